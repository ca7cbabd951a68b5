//! エラー型とエラーコード
//!
//! すべてのエラーは安定した数値コードを持ちます。コードからメッセージへの
//! 変換は外部のエラー文字列表に任せます。

use thiserror::Error;
use ulp_elf::BuildId;
use ulp_target::TargetError;

/// 検証（パッチの適用可否の判定）に失敗した理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    /// ビルドIDが一致しない（`found` が None の場合はモジュールにビルドIDがない）
    BuildIdMismatch {
        expected: BuildId,
        found: Option<BuildId>,
    },
    /// ディスク上のファイルがロード後に置き換えられている
    StaleImage,
    /// 書き換え範囲がモジュールのマップ済みセグメントからはみ出す
    OutsideSegment { symbol: String, address: u64, len: u64 },
    /// 関数が分岐命令を置くには小さすぎる
    FunctionTooSmall { symbol: String, size: u64, needed: u64 },
    /// データのペイロードがシンボルより大きい
    PayloadTooLarge { symbol: String, size: u64, payload: u64 },
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyFailure::BuildIdMismatch { expected, found: Some(found) } => {
                write!(f, "build id mismatch: patch wants {}, target has {}", expected, found)
            }
            VerifyFailure::BuildIdMismatch { expected, found: None } => {
                write!(f, "build id mismatch: patch wants {}, target has none", expected)
            }
            VerifyFailure::StaleImage => {
                write!(f, "file on disk no longer matches the loaded image")
            }
            VerifyFailure::OutsideSegment { symbol, address, len } => write!(
                f,
                "{} ({:#x}, {} bytes) is not inside a mapped segment",
                symbol, address, len
            ),
            VerifyFailure::FunctionTooSmall { symbol, size, needed } => write!(
                f,
                "{} is {} bytes, a branch needs {}",
                symbol, size, needed
            ),
            VerifyFailure::PayloadTooLarge { symbol, size, payload } => write!(
                f,
                "{} is {} bytes, payload is {}",
                symbol, size, payload
            ),
        }
    }
}

/// ライブパッチ操作のエラー
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to attach to process {pid}: {source}")]
    Attach {
        pid: i32,
        #[source]
        source: TargetError,
    },

    #[error("module {0} is not loaded in the target")]
    ModuleNotFound(String),

    #[error("symbol {symbol} not found in {module}")]
    SymbolNotFound { module: String, symbol: String },

    #[error("verification of {module} failed: {reason}")]
    Verification { module: String, reason: VerifyFailure },

    #[error("corrupt patch container: {0}")]
    CorruptContainer(String),

    #[error("{symbol} is in use by thread {tid} (checked {attempts} times)")]
    BusyTarget {
        symbol: String,
        tid: i32,
        attempts: u32,
    },

    #[error("memory access failed: {0}")]
    MemoryAccess(#[source] TargetError),

    #[error("write {index} of the patch failed ({source}); {rolled_back} earlier writes were rolled back")]
    PartialWrite {
        /// 失敗したリダイレクションの番号（1始まり）。0 は置き換えコードの書き込み
        index: usize,
        rolled_back: usize,
        #[source]
        source: TargetError,
    },

    #[error("process {pid} is in an inconsistent state: {reason}")]
    FatalInconsistentState { pid: i32, reason: String },

    #[error("another live patch session is active on process {0}")]
    SessionBusy(i32),

    #[error("no live patch is applied to process {0}")]
    NotPatched(i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// エラーコードの基点（OSのerrnoと重ならない範囲）
pub const ERROR_CODE_BASE: u32 = 0x100;

impl PatchError {
    /// 安定した数値コードを返す
    pub fn code(&self) -> u32 {
        let index = match self {
            PatchError::Attach { .. } => 1,
            PatchError::ModuleNotFound(_) => 2,
            PatchError::SymbolNotFound { .. } => 3,
            PatchError::Verification { .. } => 4,
            PatchError::CorruptContainer(_) => 5,
            PatchError::BusyTarget { .. } => 6,
            PatchError::MemoryAccess(_) => 7,
            PatchError::PartialWrite { .. } => 8,
            PatchError::FatalInconsistentState { .. } => 9,
            PatchError::SessionBusy(_) => 10,
            PatchError::NotPatched(_) => 11,
            PatchError::Io(_) => 12,
        };
        ERROR_CODE_BASE | index
    }

    /// ターゲットが変更されていないことが保証されるエラーかどうか
    pub fn target_untouched(&self) -> bool {
        !matches!(self, PatchError::FatalInconsistentState { .. })
    }
}
