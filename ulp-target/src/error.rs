//! ターゲット制御のエラー型

use nix::errno::Errno;
use thiserror::Error;

/// ターゲットプロセス操作で発生するエラー
#[derive(Debug, Error)]
pub enum TargetError {
    /// プロセスが存在しない
    #[error("process {0} does not exist")]
    NoSuchProcess(i32),

    /// アタッチが拒否された（権限不足、既に別のトレーサがいる等）
    #[error("cannot attach to process {pid}: {source}")]
    Attach {
        pid: i32,
        #[source]
        source: Errno,
    },

    /// 操作中にプロセス（またはスレッド）が終了した
    #[error("process {pid} went away ({detail})")]
    ProcessGone { pid: i32, detail: String },

    /// メモリの読み書きに失敗した
    #[error("memory access at {addr:#x} ({len} bytes) failed: {reason}")]
    MemoryAccess { addr: u64, len: usize, reason: String },

    /// リモートシステムコールがエラーを返した
    #[error("remote syscall {nr} in process {pid} failed: {errno}")]
    RemoteSyscall { pid: i32, nr: i64, errno: Errno },

    /// その他のptraceエラー
    #[error("ptrace request on thread {tid} failed: {source}")]
    Ptrace {
        tid: i32,
        #[source]
        source: Errno,
    },

    /// 既にデタッチ済み
    #[error("process {0} is not attached")]
    NotAttached(i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TargetError {
    /// メモリアクセスエラーを作成するヘルパー
    pub fn memory(addr: u64, len: usize, reason: impl std::fmt::Display) -> Self {
        TargetError::MemoryAccess {
            addr,
            len,
            reason: reason.to_string(),
        }
    }

    /// プロセスが消えたことを示すエラーかどうか
    pub fn is_process_gone(&self) -> bool {
        matches!(
            self,
            TargetError::ProcessGone { .. }
                | TargetError::NoSuchProcess(_)
                | TargetError::Ptrace {
                    source: Errno::ESRCH,
                    ..
                }
        )
    }
}
