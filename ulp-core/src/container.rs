//! パッチコンテナの解析
//!
//! コンテナは外部のパッケージングツールが生成する自己記述的なバイナリです。
//!
//! ```text
//! header:  magic "ULPATCH\0" (8) | version u32
//! record*: module  u32 len + UTF-8
//!          build id (20)
//!          symbol  u32 len + UTF-8
//!          kind    u8 (0 = function, 1 = data)
//!          payload u32 len + bytes
//! ```
//!
//! 整数はすべてリトルエンディアン。レコードはストリームの終端まで続きます。

use crate::errors::PatchError;
use std::path::Path;
use ulp_elf::{BuildId, BUILD_ID_LEN};

/// コンテナのマジック
pub const CONTAINER_MAGIC: &[u8; 8] = b"ULPATCH\0";
/// サポートするコンテナのバージョン
pub const CONTAINER_VERSION: u32 = 1;

const MAX_NAME_LEN: usize = 4096;
const MAX_FUNCTION_PAYLOAD: usize = 1 << 20;

/// リダイレクションの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionKind {
    /// 関数の入口を置き換えコードへの分岐に書き換える
    Function,
    /// データワードを直接書き換える
    Data,
}

impl RedirectionKind {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Function),
            1 => Some(Self::Data),
            _ => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Function => 0,
            Self::Data => 1,
        }
    }
}

/// 1件の書き換え指示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub module: String,
    pub build_id: BuildId,
    pub symbol: String,
    pub kind: RedirectionKind,
    /// 関数の場合は置き換えコード、データの場合は書き込む値
    pub payload: Vec<u8>,
}

/// 解析済みのパッチコンテナ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchContainer {
    redirections: Vec<Redirection>,
}

/// バイト列を先頭から読むカーソル
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], PatchError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                PatchError::CorruptContainer(format!(
                    "truncated {} at offset {} (needs {} bytes, {} left)",
                    what,
                    self.pos,
                    len,
                    self.data.len() - self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self, what: &str) -> Result<u8, PatchError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32, PatchError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn name(&mut self, what: &str) -> Result<String, PatchError> {
        let len = self.u32(what)? as usize;
        if len == 0 || len > MAX_NAME_LEN {
            return Err(PatchError::CorruptContainer(format!(
                "{} length {} out of range",
                what, len
            )));
        }
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PatchError::CorruptContainer(format!("{} is not valid UTF-8", what)))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

impl PatchContainer {
    /// コンテナを作成する（レコードの検証を行う）
    pub fn new(redirections: Vec<Redirection>) -> Result<Self, PatchError> {
        if redirections.is_empty() {
            return Err(PatchError::CorruptContainer(
                "container holds no redirections".to_string(),
            ));
        }
        for r in &redirections {
            validate(r)?;
        }
        Ok(Self { redirections })
    }

    /// ファイルからコンテナを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PatchError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// バイト列からコンテナを解析する
    pub fn parse(data: &[u8]) -> Result<Self, PatchError> {
        let mut reader = Reader { data, pos: 0 };

        if reader.take(CONTAINER_MAGIC.len(), "magic")? != CONTAINER_MAGIC {
            return Err(PatchError::CorruptContainer("bad magic".to_string()));
        }
        let version = reader.u32("version")?;
        if version != CONTAINER_VERSION {
            return Err(PatchError::CorruptContainer(format!(
                "unsupported container version {}",
                version
            )));
        }

        let mut redirections = Vec::new();
        while !reader.is_empty() {
            let module = reader.name("module name")?;
            let build_id = BuildId::from_slice(reader.take(BUILD_ID_LEN, "build id")?)
                .ok_or_else(|| PatchError::CorruptContainer("bad build id".to_string()))?;
            let symbol = reader.name("symbol name")?;
            let kind_byte = reader.u8("kind")?;
            let kind = RedirectionKind::from_byte(kind_byte).ok_or_else(|| {
                PatchError::CorruptContainer(format!("unknown redirection kind {}", kind_byte))
            })?;
            let payload_len = reader.u32("payload length")? as usize;
            let payload = reader.take(payload_len, "payload")?.to_vec();

            redirections.push(Redirection {
                module,
                build_id,
                symbol,
                kind,
                payload,
            });
        }

        Self::new(redirections)
    }

    /// コンテナをバイト列に直列化する
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CONTAINER_MAGIC);
        out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        for r in &self.redirections {
            out.extend_from_slice(&(r.module.len() as u32).to_le_bytes());
            out.extend_from_slice(r.module.as_bytes());
            out.extend_from_slice(r.build_id.as_bytes());
            out.extend_from_slice(&(r.symbol.len() as u32).to_le_bytes());
            out.extend_from_slice(r.symbol.as_bytes());
            out.push(r.kind.to_byte());
            out.extend_from_slice(&(r.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&r.payload);
        }
        out
    }

    /// コンテナ順のリダイレクション
    pub fn redirections(&self) -> &[Redirection] {
        &self.redirections
    }

    /// コンテナが依存する (モジュール, ビルドID) の組（初出順、重複なし）
    pub fn dependencies(&self) -> Vec<(&str, BuildId)> {
        let mut deps: Vec<(&str, BuildId)> = Vec::new();
        for r in &self.redirections {
            if !deps.iter().any(|(m, id)| *m == r.module && *id == r.build_id) {
                deps.push((r.module.as_str(), r.build_id));
            }
        }
        deps
    }
}

fn validate(r: &Redirection) -> Result<(), PatchError> {
    let corrupt = |msg: String| Err(PatchError::CorruptContainer(msg));
    if r.module.is_empty() || r.symbol.is_empty() {
        return corrupt("empty module or symbol name".to_string());
    }
    match r.kind {
        RedirectionKind::Function if r.payload.is_empty() => {
            corrupt(format!("function redirection of {} has no code", r.symbol))
        }
        RedirectionKind::Function if r.payload.len() > MAX_FUNCTION_PAYLOAD => corrupt(format!(
            "function redirection of {} carries {} bytes of code",
            r.symbol,
            r.payload.len()
        )),
        // データの書き換えは単一ワードの不可分な書き込みに限る
        RedirectionKind::Data if !matches!(r.payload.len(), 1 | 2 | 4 | 8) => corrupt(format!(
            "data redirection of {} must be 1, 2, 4 or 8 bytes, got {}",
            r.symbol,
            r.payload.len()
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirection(module: &str, symbol: &str, kind: RedirectionKind, payload: &[u8]) -> Redirection {
        Redirection {
            module: module.to_string(),
            build_id: BuildId([0x42; 20]),
            symbol: symbol.to_string(),
            kind,
            payload: payload.to_vec(),
        }
    }

    fn sample() -> PatchContainer {
        PatchContainer::new(vec![
            redirection("banner", "banner_set", RedirectionKind::Function, &[0xc3]),
            redirection("banner", "BANNER", RedirectionKind::Data, &[1, 2, 3, 4, 5, 6, 7, 8]),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_serialized() {
        let container = sample();
        let parsed = PatchContainer::parse(&container.to_bytes()).unwrap();
        assert_eq!(parsed, container);
        assert_eq!(parsed.redirections()[0].kind, RedirectionKind::Function);
        assert_eq!(parsed.redirections()[1].payload.len(), 8);
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let bytes = sample().to_bytes();
        // レコードの途中で切れたストリームはすべて壊れているとみなす
        let record_boundary = {
            let first = PatchContainer::new(vec![sample().redirections()[0].clone()]).unwrap();
            first.to_bytes().len()
        };
        for len in 0..bytes.len() {
            if len == record_boundary {
                continue;
            }
            let result = PatchContainer::parse(&bytes[..len]);
            assert!(
                matches!(result, Err(PatchError::CorruptContainer(_))),
                "truncation at {} was accepted",
                len
            );
        }
        // レコード境界で切れた場合は1件のコンテナとして読める
        assert_eq!(
            PatchContainer::parse(&bytes[..record_boundary]).unwrap().redirections().len(),
            1
        );
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            PatchContainer::parse(&bytes),
            Err(PatchError::CorruptContainer(msg)) if msg.contains("magic")
        ));

        let mut bytes = sample().to_bytes();
        bytes[8] = 2;
        assert!(matches!(
            PatchContainer::parse(&bytes),
            Err(PatchError::CorruptContainer(msg)) if msg.contains("version")
        ));
    }

    #[test]
    fn test_empty_container() {
        let mut bytes = CONTAINER_MAGIC.to_vec();
        bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        assert!(PatchContainer::parse(&bytes).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let mut bytes = sample().to_bytes();
        // 先頭レコードの kind バイト: header(12) + 4 + "banner" + 20 + 4 + "banner_set"
        let kind_at = 12 + 4 + 6 + 20 + 4 + 10;
        assert_eq!(bytes[kind_at], 0);
        bytes[kind_at] = 7;
        assert!(matches!(
            PatchContainer::parse(&bytes),
            Err(PatchError::CorruptContainer(msg)) if msg.contains("kind")
        ));
    }

    #[test]
    fn test_data_payload_width() {
        let result = PatchContainer::new(vec![redirection(
            "banner",
            "BANNER",
            RedirectionKind::Data,
            &[1, 2, 3],
        )]);
        assert!(result.is_err());

        let result = PatchContainer::new(vec![redirection(
            "banner",
            "banner_set",
            RedirectionKind::Function,
            &[],
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_name_length() {
        let mut bytes = CONTAINER_MAGIC.to_vec();
        bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            PatchContainer::parse(&bytes),
            Err(PatchError::CorruptContainer(msg)) if msg.contains("out of range")
        ));
    }

    #[test]
    fn test_dependencies_are_distinct() {
        let mut other = redirection("libfoo.so", "foo", RedirectionKind::Function, &[0xc3]);
        other.build_id = BuildId([0x07; 20]);
        let container = PatchContainer::new(vec![
            redirection("banner", "banner_set", RedirectionKind::Function, &[0xc3]),
            other,
            redirection("banner", "banner_get", RedirectionKind::Function, &[0xc3]),
        ])
        .unwrap();
        let deps = container.dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0], ("banner", BuildId([0x42; 20])));
        assert_eq!(deps[1], ("libfoo.so", BuildId([0x07; 20])));
    }
}
