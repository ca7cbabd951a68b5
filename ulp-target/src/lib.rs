//! ulp ターゲットプロセス制御
//!
//! このクレートは、ライブパッチ対象のプロセスを制御するための低レベル機能を提供します。
//! ptraceによる全スレッドの停止・再開、メモリの読み書き、レジスタアクセス、
//! ターゲット内でのシステムコール実行（領域の確保と解放）などを行います。

pub mod error;
pub mod process;
pub mod thread;
pub mod memory;
pub mod registers;
pub mod remote;

pub use error::TargetError;
pub use process::{ProcessHandle, StopReason};
pub use thread::{ThreadId, ThreadSnapshot};
pub use memory::{Memory, MemoryMapping};
pub use registers::Registers;

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, TargetError>;
