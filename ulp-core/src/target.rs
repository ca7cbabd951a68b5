//! パッチ適用エンジンから見たターゲットプロセス
//!
//! エンジンはこのトレイトだけを通してターゲットに触れます。実プロセスには
//! [`ProcessHandle`] の実装を使い、テストではメモリ上の偽物を使います。

use std::time::Duration;
use ulp_target::{MemoryMapping, ProcessHandle, TargetError, ThreadSnapshot};

/// 停止済みのターゲットプロセス
pub trait Target {
    /// プロセスID
    fn pid(&self) -> i32;

    /// メモリを読み取る
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError>;

    /// メモリに書き込む
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError>;

    /// 全スレッドの実行位置
    fn threads(&self, max_depth: usize) -> Result<Vec<ThreadSnapshot>, TargetError>;

    /// ターゲットを `pause` の間だけ走らせ、再び全スレッドを停止する
    fn requiesce(&mut self, pause: Duration) -> Result<(), TargetError>;

    /// メモリマッピング
    fn mappings(&self) -> Result<Vec<MemoryMapping>, TargetError>;

    /// 読み取り・実行可能な領域を `near` の付近に確保する
    fn allocate(&mut self, len: u64, near: u64) -> Result<u64, TargetError>;

    /// `allocate` で確保した領域を解放する
    fn release(&mut self, addr: u64, len: u64) -> Result<(), TargetError>;

    /// 全スレッドを再開して制御を手放す（冪等）
    fn detach(&mut self) -> Result<(), TargetError>;
}

impl Target for ProcessHandle {
    fn pid(&self) -> i32 {
        ProcessHandle::pid(self)
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        ProcessHandle::read(self, addr, len)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError> {
        ProcessHandle::write(self, addr, data)
    }

    fn threads(&self, max_depth: usize) -> Result<Vec<ThreadSnapshot>, TargetError> {
        ProcessHandle::threads(self, max_depth)
    }

    fn requiesce(&mut self, pause: Duration) -> Result<(), TargetError> {
        self.resume_all()?;
        std::thread::sleep(pause);
        self.suspend_all()
    }

    fn mappings(&self) -> Result<Vec<MemoryMapping>, TargetError> {
        ProcessHandle::mappings(self)
    }

    fn allocate(&mut self, len: u64, near: u64) -> Result<u64, TargetError> {
        ProcessHandle::allocate(self, len, near)
    }

    fn release(&mut self, addr: u64, len: u64) -> Result<(), TargetError> {
        ProcessHandle::release(self, addr, len)
    }

    fn detach(&mut self) -> Result<(), TargetError> {
        ProcessHandle::detach(self)
    }
}
