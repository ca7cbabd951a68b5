//! レジスタアクセス機能

use crate::{Result, TargetError};
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// スレッド単位のレジスタアクセス
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: i32) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        nix::sys::ptrace::getregs(self.tid).map_err(|source| TargetError::Ptrace {
            tid: self.tid.as_raw(),
            source,
        })
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs).map_err(|source| TargetError::Ptrace {
            tid: self.tid.as_raw(),
            source,
        })
    }
}
