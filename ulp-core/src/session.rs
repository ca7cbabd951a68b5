//! 実プロセスに対するライブパッチセッション
//!
//! PIDごとの排他ロックを取り、アタッチしてモジュールカタログを作り、
//! [`PatchApplier`] を動かしてからデタッチします。
//! ターゲットを不整合な状態に残した場合は、同じプロセスへの以後のセッションを
//! 拒否するためのマーカーを残します。

use crate::applier::{ApplyState, PatchApplier};
use crate::catalog::ModuleCatalog;
use crate::container::PatchContainer;
use crate::errors::PatchError;
use crate::options::PatchOptions;
use crate::revert::PatchRecord;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use ulp_target::process::process_start_time;
use ulp_target::ProcessHandle;

/// PIDごとのセッションロック（flockによる排他、ドロップで解放）
pub struct SessionLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl SessionLock {
    /// `<lock_dir>/ulp-<pid>.lock` の排他ロックを取る。取れなければ `SessionBusy`
    pub fn acquire(lock_dir: &Path, pid: i32) -> Result<Self, PatchError> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("ulp-{}.lock", pid));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!("acquired session lock {:?}", path);
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(PatchError::SessionBusy(pid)),
            Err((_, errno)) => Err(PatchError::Io(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn marker_path(lock_dir: &Path, pid: i32) -> PathBuf {
    lock_dir.join(format!("ulp-{}.fatal", pid))
}

/// 以前のセッションが不整合な状態に残したプロセスなら拒否する
///
/// マーカーには記録時のプロセス開始時刻が入っています。PIDが再利用された
/// （開始時刻が違う、またはプロセスがもう無い）場合はマーカーを消します。
pub fn check_poisoned(lock_dir: &Path, pid: i32) -> Result<(), PatchError> {
    let path = marker_path(lock_dir, pid);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = contents.lines();
    let recorded = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
    let reason = lines.next().unwrap_or("unknown").to_string();

    match (recorded, process_start_time(pid)) {
        (Some(recorded), Ok(current)) if recorded == current => {
            Err(PatchError::FatalInconsistentState {
                pid,
                reason: format!("left inconsistent by an earlier session: {}", reason),
            })
        }
        _ => {
            tracing::info!("removing stale inconsistency marker {:?}", path);
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        }
    }
}

/// プロセスを不整合としてマークする
pub fn mark_poisoned(lock_dir: &Path, pid: i32, reason: &str) -> Result<(), PatchError> {
    let Ok(start_time) = process_start_time(pid) else {
        // プロセスが既に無ければ守る対象もない
        return Ok(());
    };

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker_path(lock_dir, pid))
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    writeln!(file, "{}", start_time)?;
    writeln!(file, "{}", reason.replace('\n', " "))?;
    Ok(())
}

/// 実プロセスに対する1回のセッション
pub struct Session {
    // ロックより先にデタッチされるよう、フィールドの順序を保つ
    applier: PatchApplier<ProcessHandle>,
    catalog: ModuleCatalog,
    lock_dir: PathBuf,
    _lock: SessionLock,
}

impl Session {
    /// ロックを取り、アタッチしてモジュールを列挙する
    pub fn open(pid: i32, options: PatchOptions) -> Result<Self, PatchError> {
        let lock = SessionLock::acquire(&options.lock_dir, pid)?;
        check_poisoned(&options.lock_dir, pid)?;

        let handle =
            ProcessHandle::attach(pid).map_err(|source| PatchError::Attach { pid, source })?;
        let catalog = ModuleCatalog::discover(&handle)?;
        tracing::info!(pid, modules = catalog.modules().len(), "session opened");

        Ok(Self {
            lock_dir: options.lock_dir.clone(),
            applier: PatchApplier::new(handle, options),
            catalog,
            _lock: lock,
        })
    }

    pub fn pid(&self) -> i32 {
        self.applier.target().pid()
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    pub fn state(&self) -> ApplyState {
        self.applier.state()
    }

    pub fn apply(
        &mut self,
        container: &PatchContainer,
        label: &str,
    ) -> Result<PatchRecord, PatchError> {
        let result = self.applier.apply(&self.catalog, container, label);
        self.note(result)
    }

    pub fn revert(&mut self, all: bool) -> Result<Vec<PatchRecord>, PatchError> {
        let result = self.applier.revert(&self.catalog, all);
        self.note(result)
    }

    pub fn status(&self) -> Result<Vec<PatchRecord>, PatchError> {
        self.applier.status()
    }

    /// ターゲットを再開してデタッチする
    pub fn close(mut self) -> Result<(), PatchError> {
        self.applier.detach()
    }

    fn note<R>(&self, result: Result<R, PatchError>) -> Result<R, PatchError> {
        if let Err(PatchError::FatalInconsistentState { pid, reason }) = &result {
            tracing::error!(pid, "target left inconsistent: {}", reason);
            if let Err(e) = mark_poisoned(&self.lock_dir, *pid, reason) {
                tracing::warn!("could not record inconsistency marker: {}", e);
            }
        }
        result
    }
}
