//! 元に戻すための記録
//!
//! 適用中は書き換えの直前に元のバイト列を [`RevertLog`] に追記し、巻き戻しでは
//! 逆順に消費します。適用に成功した記録は [`PatchRecord`] としてターゲット内の
//! 確保領域の先頭に書き込まれ、別セッションの revert / status から見つけられます。
//!
//! レコードの形式（リトルエンディアン）:
//!
//! ```text
//! magic "ULPREC\0\x01" | sequence u32 | count u32 | region len u64
//! | code start u64 | code end u64 | label u16 len + bytes
//! | (address u64, len u32, kind u8, original bytes) * count
//! ```

use crate::container::RedirectionKind;
use crate::errors::PatchError;
use crate::target::Target;
use ulp_target::remote::{page_align, PAGE_SIZE};

/// パッチレコードのマジック
pub const RECORD_MAGIC: &[u8; 8] = b"ULPREC\0\x01";

/// ラベルの最大長（長さは u16 で記録する）
pub const MAX_LABEL_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 42;
const CODE_START_OFFSET: usize = 24;
const ENTRY_HEADER_LEN: usize = 13;
const MAX_RECORD_LEN: u64 = 16 << 20;

/// 1回の書き込みで上書きされた元のバイト列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertRecord {
    pub address: u64,
    pub kind: RedirectionKind,
    pub original: Vec<u8>,
}

impl RevertRecord {
    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }
}

/// 追記専用の巻き戻しログ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertLog {
    records: Vec<RevertRecord>,
}

impl RevertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RevertRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 記録した順
    pub fn records(&self) -> &[RevertRecord] {
        &self.records
    }

    /// 巻き戻す順（新しいものから）
    pub fn iter_rev(&self) -> impl Iterator<Item = &RevertRecord> {
        self.records.iter().rev()
    }
}

/// ターゲット内に残す適用済みパッチの記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// 適用の通し番号（大きいほど新しい）
    pub sequence: u32,
    pub label: String,
    /// 確保領域の先頭。エンコードされず、発見した位置から決まる
    pub region: u64,
    pub region_len: u64,
    /// 置き換えコードを置いた範囲 [code_start, code_end)
    pub code_start: u64,
    pub code_end: u64,
    pub log: RevertLog,
}

impl PatchRecord {
    /// エンコード後の長さ
    pub fn encoded_len(label: &str, original_lens: impl IntoIterator<Item = usize>) -> usize {
        HEADER_LEN
            + label.len()
            + original_lens
                .into_iter()
                .map(|len| ENTRY_HEADER_LEN + len)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(
            &self.label,
            self.log.records().iter().map(RevertRecord::len),
        ));
        out.extend_from_slice(RECORD_MAGIC);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&(self.log.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.region_len.to_le_bytes());
        out.extend_from_slice(&self.code_start.to_le_bytes());
        out.extend_from_slice(&self.code_end.to_le_bytes());
        out.extend_from_slice(&(self.label.len() as u16).to_le_bytes());
        out.extend_from_slice(self.label.as_bytes());
        for record in self.log.records() {
            out.extend_from_slice(&record.address.to_le_bytes());
            out.extend_from_slice(&(record.original.len() as u32).to_le_bytes());
            out.push(record.kind.to_byte());
            out.extend_from_slice(&record.original);
        }
        out
    }

    /// `region` に置かれていたバイト列から復元する
    pub fn decode(region: u64, data: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor { data, pos: 0 };
        if cursor.take(RECORD_MAGIC.len())? != RECORD_MAGIC {
            return Err("bad record magic".to_string());
        }
        let sequence = cursor.u32()?;
        let count = cursor.u32()?;
        let region_len = cursor.u64()?;
        let code_start = cursor.u64()?;
        let code_end = cursor.u64()?;
        let label_len = cursor.u16()? as usize;
        let label = String::from_utf8(cursor.take(label_len)?.to_vec())
            .map_err(|_| "label is not valid UTF-8".to_string())?;

        if code_start > code_end || code_end > region.saturating_add(region_len) {
            return Err(format!(
                "code area {:#x}..{:#x} outside region {:#x}+{:#x}",
                code_start, code_end, region, region_len
            ));
        }

        let mut log = RevertLog::new();
        for _ in 0..count {
            let address = cursor.u64()?;
            let len = cursor.u32()? as usize;
            let kind_byte = cursor.take(1)?[0];
            let kind = RedirectionKind::from_byte(kind_byte)
                .ok_or_else(|| format!("unknown record kind {}", kind_byte))?;
            let original = cursor.take(len)?.to_vec();
            log.push(RevertRecord {
                address,
                kind,
                original,
            });
        }

        Ok(Self {
            sequence,
            label,
            region,
            region_len,
            code_start,
            code_end,
            log,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| format!("record truncated at offset {}", self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(word))
    }
}

/// ターゲット内の全パッチレコードを通し番号順に集める
///
/// 匿名の読み取り・実行専用マッピングをページ単位で走査します。隣接する
/// 確保領域はカーネルによって1つのマッピングに結合されることがあるため、
/// マッピングの先頭だけでなく各ページを確認します。
pub fn find_records<T: Target>(target: &T) -> Result<Vec<PatchRecord>, PatchError> {
    let mappings = target.mappings().map_err(PatchError::MemoryAccess)?;
    let mut found = Vec::new();

    for mapping in mappings
        .iter()
        .filter(|m| m.is_anonymous() && m.readable && m.executable && !m.writable)
    {
        let mut pos = mapping.start;
        while pos.saturating_add(HEADER_LEN as u64) <= mapping.end {
            match read_record_at(target, pos, mapping.end) {
                Some(record) => {
                    pos += page_align(record.region_len).max(PAGE_SIZE);
                    found.push(record);
                }
                None => pos += PAGE_SIZE,
            }
        }
    }

    found.sort_by_key(|r| r.sequence);
    tracing::debug!(pid = target.pid(), records = found.len(), "patch records located");
    Ok(found)
}

fn read_record_at<T: Target>(target: &T, pos: u64, limit: u64) -> Option<PatchRecord> {
    let header = target.read(pos, HEADER_LEN).ok()?;
    if &header[..RECORD_MAGIC.len()] != RECORD_MAGIC {
        return None;
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&header[CODE_START_OFFSET..CODE_START_OFFSET + 8]);
    let code_start = u64::from_le_bytes(word);
    let record_len = code_start.checked_sub(pos)?;
    if record_len < HEADER_LEN as u64 || record_len > MAX_RECORD_LEN || code_start > limit {
        tracing::warn!("ignoring malformed patch record at {:#x}", pos);
        return None;
    }

    let data = target.read(pos, record_len as usize).ok()?;
    match PatchRecord::decode(pos, &data) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("ignoring malformed patch record at {:#x}: {}", pos, e);
            None
        }
    }
}
