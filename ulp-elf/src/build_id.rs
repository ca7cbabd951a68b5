//! ビルドID

use std::fmt;

/// ビルドIDの長さ（160ビット、SHA-1）
pub const BUILD_ID_LEN: usize = 20;

/// バイナリの内容から導出される識別子
///
/// パッチは、ビルドIDが完全に一致するモジュールにしか適用できません。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(pub [u8; BUILD_ID_LEN]);

impl BuildId {
    /// バイト列から作成する。長さが20バイトでなければ None
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// 16進文字列から作成する
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != BUILD_ID_LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; BUILD_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; BUILD_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildId({})", self)
    }
}
