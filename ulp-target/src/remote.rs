//! ターゲットプロセス内でのシステムコール実行
//!
//! 実行可能ページの先頭に一時的に `syscall; int3` を書き込み、停止中の
//! スレッド1本だけをそこから実行させます。INT3で戻ってきたら、書き換えた
//! バイトとレジスタを元に戻します。他のスレッドは停止したままです。

use crate::process::StopReason;
use crate::{ProcessHandle, Registers, Result, TargetError};
use nix::errno::Errno;
use nix::libc;

/// `syscall` (0f 05) の直後に `int3` (cc)
const SYSCALL_TRAP: [u8; 3] = [0x0f, 0x05, 0xcc];

const SYS_MMAP: i64 = libc::SYS_mmap;
const SYS_MUNMAP: i64 = libc::SYS_munmap;

/// ページサイズ
pub const PAGE_SIZE: u64 = 4096;

/// ページ境界に切り上げる
pub fn page_align(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl ProcessHandle {
    /// ターゲット内でシステムコールを1回実行し、戻り値を返す
    pub fn remote_syscall(&mut self, nr: i64, args: [u64; 6]) -> Result<u64> {
        if !self.is_attached() {
            return Err(TargetError::NotAttached(self.pid()));
        }

        let tid = self.worker_thread()?;
        let registers = Registers::new(tid);
        let saved = registers.read()?;
        let site = self.syscall_site()?;
        let original = self.memory().read(site, SYSCALL_TRAP.len())?;

        self.memory().write(site, &SYSCALL_TRAP)?;

        let mut call = saved;
        call.rax = nr as u64;
        // 中断されたシステムコールの再開処理を抑止する
        call.orig_rax = u64::MAX;
        call.rdi = args[0];
        call.rsi = args[1];
        call.rdx = args[2];
        call.r10 = args[3];
        call.r8 = args[4];
        call.r9 = args[5];
        call.rip = site;

        let outcome = self.run_until_trap(tid, &registers, call);

        // 実行結果に関わらず、コードとレジスタは必ず元に戻す
        let restored_code = self.memory().write(site, &original);
        let restored_regs = registers.write(saved);
        let ret = outcome?;
        restored_code?;
        restored_regs?;

        let signed = ret as i64;
        if (-4095..0).contains(&signed) {
            return Err(TargetError::RemoteSyscall {
                pid: self.pid(),
                nr,
                errno: Errno::from_raw(-signed as i32),
            });
        }
        tracing::trace!(pid = self.pid(), nr, ret, "remote syscall completed");
        Ok(ret)
    }

    fn run_until_trap(
        &mut self,
        tid: i32,
        registers: &Registers,
        call: libc::user_regs_struct,
    ) -> Result<u64> {
        registers.write(call)?;
        loop {
            self.resume_thread(tid)?;
            match self.wait_event(tid)? {
                StopReason::Trap => break,
                // 古い割り込み要求による停止。もう一度走らせる
                StopReason::Interrupted => continue,
                StopReason::Signal(sig) => {
                    self.defer_signal(tid, sig);
                    continue;
                }
                StopReason::Exited(code) => {
                    return Err(TargetError::ProcessGone {
                        pid: self.pid(),
                        detail: format!("exited with {} during remote syscall", code),
                    })
                }
                StopReason::Killed(sig) => {
                    return Err(TargetError::ProcessGone {
                        pid: self.pid(),
                        detail: format!("killed by {:?} during remote syscall", sig),
                    })
                }
            }
        }
        self.mark_stopped(tid);
        Ok(registers.read()?.rax)
    }

    /// `syscall; int3` を一時的に置く場所（最初のファイル由来の実行可能マッピング）
    ///
    /// 他のスレッドのipがここにあっても構わない。書き換えたバイトは
    /// どのスレッドを再開するよりも前に `remote_syscall` が書き戻す。
    fn syscall_site(&self) -> Result<u64> {
        self.mappings()?
            .iter()
            .find(|m| m.executable && !m.is_anonymous())
            .map(|m| m.start)
            .ok_or_else(|| TargetError::memory(0, 0, "no executable mapping to host a syscall"))
    }

    /// ターゲット内に読み取り・実行可能な匿名領域を確保する
    ///
    /// `near` はヒントとして渡され、カーネルが空きを見つけられればその付近に配置されます。
    /// 書き込みは /proc/pid/mem（保護属性を無視する）経由で行います。
    pub fn allocate(&mut self, len: u64, near: u64) -> Result<u64> {
        let len = page_align(len.max(1));
        let addr = self.remote_syscall(
            SYS_MMAP,
            [
                near & !(PAGE_SIZE - 1),
                len,
                (libc::PROT_READ | libc::PROT_EXEC) as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                u64::MAX,
                0,
            ],
        )?;
        tracing::debug!(pid = self.pid(), "allocated {:#x} bytes at {:#x}", len, addr);
        Ok(addr)
    }

    /// `allocate` で確保した領域を解放する
    pub fn release(&mut self, addr: u64, len: u64) -> Result<()> {
        self.remote_syscall(SYS_MUNMAP, [addr, page_align(len.max(1)), 0, 0, 0, 0])?;
        tracing::debug!(pid = self.pid(), "released region at {:#x}", addr);
        Ok(())
    }
}
