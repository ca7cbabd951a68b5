//! ulp ライブパッチのコア機能
//!
//! このクレートは、実行中のプロセスにバイナリパッチを当てるためのロジックを提供します。
//! パッチコンテナの解析、ロード済みモジュールとビルドIDの照合、静止状態の確認、
//! 関数入口とデータの書き換え、失敗時の巻き戻し、適用済みパッチの取り消しを統合します。

pub mod applier;
pub mod branch;
pub mod catalog;
pub mod consistency;
pub mod container;
pub mod disasm;
pub mod errors;
pub mod options;
pub mod revert;
pub mod session;
pub mod target;

pub use applier::{ApplyState, PatchApplier, Plan, PlannedRedirection};
pub use catalog::{LoadedModule, ModuleCatalog, ResolvedSymbol};
pub use consistency::{BusyThread, ConsistencyChecker};
pub use container::{PatchContainer, Redirection, RedirectionKind};
pub use errors::{PatchError, VerifyFailure};
pub use options::PatchOptions;
pub use revert::{PatchRecord, RevertLog, RevertRecord};
pub use session::{Session, SessionLock};
pub use target::Target;

// 他のクレートから使用するために再エクスポート
pub use ulp_elf::{BuildId, SymbolKind};
pub use ulp_target::{MemoryMapping, ThreadSnapshot};

/// ライブパッチ操作の結果型
pub type Result<T> = std::result::Result<T, PatchError>;
