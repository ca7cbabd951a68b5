//! ELFファイルの読み込み機能

use crate::{ElfError, Result, SymbolTable};
use object::{Object, ObjectKind, ObjectSection, ObjectSegment};
use std::fs;
use std::path::{Path, PathBuf};

/// GNUビルドIDノートの種類
const NT_GNU_BUILD_ID: u32 = 3;

const PAGE_MASK: u64 = 0xfff;

/// ビルドIDノート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdNote {
    /// ノートの記述子（ビルドID本体）の仮想アドレス。セクションヘッダが無い場合は不明
    pub address: Option<u64>,
    /// ビルドIDのバイト列
    pub bytes: Vec<u8>,
}

/// PT_LOADセグメント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// リンク時の仮想アドレス
    pub address: u64,
    /// メモリ上のサイズ
    pub size: u64,
    /// ファイルオフセット
    pub file_offset: u64,
}

/// 解析済みのELFイメージ
///
/// 解析結果だけを所有し、ファイルの内容は保持しません。
#[derive(Debug, Clone)]
pub struct ElfImage {
    path: PathBuf,
    is_pie: bool,
    build_id: Option<BuildIdNote>,
    segments: Vec<LoadSegment>,
    symbols: SymbolTable,
}

impl ElfImage {
    /// ELFファイルを読み込んで解析する
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ElfError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &data)
    }

    /// メモリ上のELFデータを解析する（`path` は識別とエラー表示用）
    pub fn parse<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        let parse_error = |message: String| ElfError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let object_file = object::File::parse(data).map_err(|e| parse_error(e.to_string()))?;
        if object_file.format() != object::BinaryFormat::Elf {
            return Err(parse_error(format!("not an ELF file ({:?})", object_file.format())));
        }

        let segments = object_file
            .segments()
            .map(|seg| {
                let (file_offset, _) = seg.file_range();
                LoadSegment {
                    address: seg.address(),
                    size: seg.size(),
                    file_offset,
                }
            })
            .collect();

        let build_id = Self::read_build_id(&object_file);
        if build_id.is_none() {
            tracing::debug!("{:?} carries no build id note", path);
        }

        Ok(Self {
            path: path.to_path_buf(),
            // ET_DYN（PIE実行ファイルまたは共有ライブラリ）はロードバイアスを持つ
            is_pie: matches!(object_file.kind(), ObjectKind::Dynamic),
            build_id,
            segments,
            symbols: SymbolTable::new(&object_file),
        })
    }

    /// `.note.gnu.build-id` セクションからビルドIDとその位置を取り出す
    fn read_build_id(object_file: &object::File<'_>) -> Option<BuildIdNote> {
        if let Some(section) = object_file.section_by_name(".note.gnu.build-id") {
            if let Ok(data) = section.data() {
                if let Some((offset, bytes)) =
                    find_build_id_in_notes(data, object_file.is_little_endian())
                {
                    return Some(BuildIdNote {
                        address: Some(section.address() + offset as u64),
                        bytes: bytes.to_vec(),
                    });
                }
            }
        }

        // セクションヘッダが落とされていてもプログラムヘッダのノートから取れる
        let bytes = object_file.build_id().ok().flatten();
        bytes.map(|bytes| BuildIdNote {
            address: None,
            bytes: bytes.to_vec(),
        })
    }

    /// ファイルパスを取得する
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PIE（Position Independent Executable）または共有ライブラリかどうか
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// ビルドIDノートを取得する
    pub fn build_id_note(&self) -> Option<&BuildIdNote> {
        self.build_id.as_ref()
    }

    /// PT_LOADセグメントを取得する
    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    /// シンボルテーブルを取得する
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// 最初のPT_LOADセグメントのページ境界アドレス
    ///
    /// ロードバイアスは、ファイルオフセット0のマッピング先頭からこの値を引いたものです。
    pub fn first_load_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.address)
            .min()
            .unwrap_or(0)
            & !PAGE_MASK
    }
}

/// ノートセクションの中から GNU ビルドIDを探し、(記述子のオフセット, 記述子) を返す
///
/// ノートの形式: namesz(u32) descsz(u32) type(u32) name(4バイト境界) desc(4バイト境界)
pub fn find_build_id_in_notes(data: &[u8], little_endian: bool) -> Option<(usize, &[u8])> {
    let read_u32 = |at: usize| -> Option<u32> {
        let raw: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
        Some(if little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    };
    let align4 = |n: usize| (n + 3) & !3;

    let mut at = 0;
    while at + 12 <= data.len() {
        let namesz = read_u32(at)? as usize;
        let descsz = read_u32(at + 4)? as usize;
        let kind = read_u32(at + 8)?;
        let name_at = at + 12;
        let desc_at = name_at + align4(namesz);
        let name = data.get(name_at..name_at + namesz)?;
        let desc = data.get(desc_at..desc_at + descsz)?;

        if kind == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some((desc_at, desc));
        }
        at = desc_at + align4(descsz);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &[u8], kind: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn test_find_build_id_note() {
        let id: Vec<u8> = (0u8..20).collect();
        let data = note(b"GNU\0", NT_GNU_BUILD_ID, &id);
        let (offset, desc) = find_build_id_in_notes(&data, true).unwrap();
        assert_eq!(offset, 16);
        assert_eq!(desc, &id[..]);
    }

    #[test]
    fn test_skips_other_notes() {
        let mut data = note(b"GNU\0", 1, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        let id = [0xabu8; 20];
        let first_len = data.len();
        data.extend(note(b"GNU\0", NT_GNU_BUILD_ID, &id));
        let (offset, desc) = find_build_id_in_notes(&data, true).unwrap();
        assert_eq!(offset, first_len + 16);
        assert_eq!(desc, &id[..]);
    }

    #[test]
    fn test_truncated_note() {
        let id = [0xabu8; 20];
        let data = note(b"GNU\0", NT_GNU_BUILD_ID, &id);
        assert!(find_build_id_in_notes(&data[..30], true).is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ElfImage::parse("garbage", b"not an elf").is_err());
    }
}
