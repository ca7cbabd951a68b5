//! プロセス制御機能

use crate::thread::{list_threads, ThreadId, ThreadSnapshot};
use crate::{Memory, MemoryMapping, Result, TargetError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// PTRACE_INTERRUPT またはグループストップによる停止
    Interrupted,
    /// SIGTRAP（リモートシステムコール用のINT3など）
    Trap,
    /// その他のシグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる強制終了
    Killed(Signal),
}

/// トレース中のスレッド
#[derive(Debug)]
struct TracedThread {
    /// 停止処理中に受け取ったシグナル。再開時に配送し直す
    pending_signal: Option<Signal>,
    running: bool,
}

/// ライブパッチ対象のプロセス
///
/// アタッチすると全スレッドが停止し、`detach` するかドロップされるまで
/// 停止したままになります。
pub struct ProcessHandle {
    pid: Pid,
    memory: Memory,
    threads: BTreeMap<ThreadId, TracedThread>,
    attached: bool,
}

impl ProcessHandle {
    /// 既存のプロセスにアタッチし、全スレッドを停止する
    ///
    /// PTRACE_SEIZEで各スレッドをトレースし、PTRACE_INTERRUPTで停止させます。
    /// アタッチ中に新しいスレッドが生成される可能性があるため、
    /// /proc/pid/task に未知のスレッドが現れなくなるまで繰り返します。
    pub fn attach(pid: i32) -> Result<Self> {
        let raw = Pid::from_raw(pid);
        match nix::sys::signal::kill(raw, None) {
            Err(Errno::ESRCH) => return Err(TargetError::NoSuchProcess(pid)),
            Err(source) if source != Errno::EPERM => {
                return Err(TargetError::Attach { pid, source })
            }
            _ => {}
        }

        let mut handle = Self {
            pid: raw,
            memory: Memory::new(pid),
            threads: BTreeMap::new(),
            attached: true,
        };

        loop {
            let tids = list_threads(pid).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TargetError::NoSuchProcess(pid)
                } else {
                    TargetError::Io(e)
                }
            })?;
            let new: Vec<ThreadId> = tids
                .into_iter()
                .filter(|tid| !handle.threads.contains_key(tid))
                .collect();
            if new.is_empty() {
                break;
            }

            for tid in new {
                match handle.seize_thread(tid) {
                    Ok(()) => {}
                    // 列挙と seize の間にスレッドが終了した
                    Err(TargetError::Ptrace {
                        source: Errno::ESRCH,
                        ..
                    }) if tid != pid => continue,
                    Err(TargetError::Ptrace { source, .. }) if tid == pid => {
                        let _ = handle.detach();
                        return Err(match source {
                            Errno::ESRCH => TargetError::NoSuchProcess(pid),
                            source => TargetError::Attach { pid, source },
                        });
                    }
                    Err(e) => {
                        let _ = handle.detach();
                        return Err(e);
                    }
                }
            }
        }

        tracing::debug!(pid, threads = handle.threads.len(), "attached and stopped all threads");
        Ok(handle)
    }

    fn seize_thread(&mut self, tid: ThreadId) -> Result<()> {
        let t = Pid::from_raw(tid);
        ptrace::seize(t, ptrace::Options::empty())
            .map_err(|source| TargetError::Ptrace { tid, source })?;
        self.threads.insert(
            tid,
            TracedThread {
                pending_signal: None,
                running: true,
            },
        );
        ptrace::interrupt(t).map_err(|source| TargetError::Ptrace { tid, source })?;
        self.wait_stopped(tid)
    }

    /// スレッドが停止するまで待機し、停止中に届いたシグナルを記録する
    fn wait_stopped(&mut self, tid: ThreadId) -> Result<()> {
        match self.wait_event(tid)? {
            StopReason::Interrupted | StopReason::Trap => {}
            StopReason::Signal(sig) => {
                // シグナル配送ストップでもスレッドは停止している。
                // 未処理の割り込み要求は次回再開時に即座に停止として現れるだけで害はない
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.pending_signal = Some(sig);
                }
            }
            StopReason::Exited(code) => {
                self.threads.remove(&tid);
                return Err(TargetError::ProcessGone {
                    pid: self.pid(),
                    detail: format!("thread {} exited with {}", tid, code),
                });
            }
            StopReason::Killed(sig) => {
                self.threads.remove(&tid);
                return Err(TargetError::ProcessGone {
                    pid: self.pid(),
                    detail: format!("thread {} killed by {:?}", tid, sig),
                });
            }
        }
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.running = false;
        }
        Ok(())
    }

    /// 指定スレッドの次の停止イベントを待機する
    pub fn wait_event(&self, tid: ThreadId) -> Result<StopReason> {
        let status = waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))
            .map_err(|source| TargetError::Ptrace { tid, source })?;

        Ok(match status {
            // PTRACE_EVENT_STOP（割り込み・グループストップ）
            WaitStatus::PtraceEvent(..) => StopReason::Interrupted,
            WaitStatus::Stopped(_, Signal::SIGTRAP) => StopReason::Trap,
            WaitStatus::Stopped(_, sig) => StopReason::Signal(sig),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, sig, _) => StopReason::Killed(sig),
            _ => StopReason::Interrupted,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// アタッチ中かどうか
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// メモリアクセスを取得する
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// メモリマッピングを取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        self.memory.get_mappings()
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(TargetError::NotAttached(self.pid()))
        }
    }

    /// 全スレッドの実行位置のスナップショットを取得する
    pub fn threads(&self, max_depth: usize) -> Result<Vec<ThreadSnapshot>> {
        self.ensure_attached()?;
        self.threads
            .keys()
            .map(|&tid| ThreadSnapshot::capture(tid, &self.memory, max_depth))
            .collect()
    }

    /// 停止中の全スレッドを再開する（トレースは継続）
    pub fn resume_all(&mut self) -> Result<()> {
        self.ensure_attached()?;
        for (&tid, thread) in self.threads.iter_mut() {
            if thread.running {
                continue;
            }
            ptrace::cont(Pid::from_raw(tid), thread.pending_signal.take())
                .map_err(|source| TargetError::Ptrace { tid, source })?;
            thread.running = true;
        }
        Ok(())
    }

    /// 実行中の全スレッドを再び停止する
    ///
    /// 再開中に生成されたスレッドもここで捕捉します。
    pub fn suspend_all(&mut self) -> Result<()> {
        self.ensure_attached()?;
        let running: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, t)| t.running)
            .map(|(&tid, _)| tid)
            .collect();

        for tid in running {
            match ptrace::interrupt(Pid::from_raw(tid)) {
                Ok(()) => self.wait_stopped(tid)?,
                Err(Errno::ESRCH) if tid != self.pid() => {
                    self.threads.remove(&tid);
                }
                Err(source) => return Err(TargetError::Ptrace { tid, source }),
            }
        }

        let known: Vec<ThreadId> = self.threads.keys().copied().collect();
        for tid in list_threads(self.pid())? {
            if !known.contains(&tid) {
                match self.seize_thread(tid) {
                    Ok(()) => {}
                    Err(TargetError::Ptrace {
                        source: Errno::ESRCH,
                        ..
                    }) => {
                        self.threads.remove(&tid);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// 指定スレッドだけを再開する（リモートシステムコール用）
    pub(crate) fn resume_thread(&mut self, tid: ThreadId) -> Result<()> {
        ptrace::cont(Pid::from_raw(tid), None::<Signal>)
            .map_err(|source| TargetError::Ptrace { tid, source })?;
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.running = true;
        }
        Ok(())
    }

    pub(crate) fn mark_stopped(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.running = false;
        }
    }

    /// 後で配送するシグナルを記録する
    pub(crate) fn defer_signal(&mut self, tid: ThreadId, sig: Signal) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.pending_signal = Some(sig);
        }
    }

    /// ターゲット内でコードを実行させるスレッドを選ぶ（メインスレッド優先）
    pub(crate) fn worker_thread(&self) -> Result<ThreadId> {
        if self.threads.contains_key(&self.pid()) {
            return Ok(self.pid());
        }
        self.threads
            .keys()
            .next()
            .copied()
            .ok_or_else(|| TargetError::ProcessGone {
                pid: self.pid(),
                detail: "no traced threads left".to_string(),
            })
    }

    /// ターゲットメモリを読み取る
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_attached()?;
        self.memory.read(addr, len)
    }

    /// ターゲットメモリに書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.ensure_attached()?;
        self.memory.write(addr, data)
    }

    /// 全スレッドを再開してトレースを終了する
    ///
    /// 何度呼んでも安全で、途中で失敗した後でも呼び出せます。
    /// 既に終了したスレッドのエラーは無視します。
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;

        let mut first_error = None;
        for (tid, mut thread) in std::mem::take(&mut self.threads) {
            let t = Pid::from_raw(tid);
            // 実行中のスレッドは停止させないとデタッチできない
            if thread.running {
                if ptrace::interrupt(t).is_err() {
                    continue;
                }
                match waitpid(t, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, sig)) if sig != Signal::SIGTRAP => {
                        thread.pending_signal = Some(sig)
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => continue,
                    Ok(_) => {}
                }
            }
            match ptrace::detach(t, thread.pending_signal.take()) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    tracing::warn!(tid, "detach failed: {}", source);
                    first_error.get_or_insert(TargetError::Ptrace { tid, source });
                }
            }
        }

        tracing::debug!(pid = self.pid(), "detached");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

/// /proc/pid/stat からプロセスの開始時刻（clock ticks）を取得する
///
/// PIDの再利用を区別するために使います。
pub fn process_start_time(pid: i32) -> Result<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TargetError::NoSuchProcess(pid)
        } else {
            TargetError::Io(e)
        }
    })?;
    parse_start_time(&stat).ok_or_else(|| {
        TargetError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed /proc/{}/stat", pid),
        ))
    })
}

fn parse_start_time(stat: &str) -> Option<u64> {
    // comm は空白や括弧を含み得るので、最後の ')' 以降を数える。
    // ')' の直後がフィールド3（state）、starttime はフィールド22
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}
