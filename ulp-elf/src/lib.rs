//! ulp ELFイメージ解析
//!
//! このクレートは、ロード済みモジュールのELFファイルを解析する機能を提供します。
//! ビルドID（`.note.gnu.build-id`）、PT_LOADセグメント、シンボルテーブルを取り出し、
//! パッチの適用可否の判定とシンボル解決に使います。

pub mod build_id;
pub mod loader;
pub mod symbols;

pub use build_id::{BuildId, BUILD_ID_LEN};
pub use loader::{BuildIdNote, ElfImage, LoadSegment};
pub use symbols::{Symbol, SymbolKind, SymbolTable};

use std::path::PathBuf;
use thiserror::Error;

/// ELF解析のエラー
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ELF file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// ELF解析の結果型
pub type Result<T> = std::result::Result<T, ElfError>;
