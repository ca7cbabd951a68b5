//! 静止状態の確認
//!
//! 書き換え対象のコードを実行中（または戻り先として保持している）スレッドが
//! いないことを確かめます。1つでも該当すれば操作全体を拒否します。

use crate::errors::PatchError;
use crate::options::PatchOptions;
use crate::target::Target;
use ulp_target::{ThreadId, ThreadSnapshot};

/// 実行中であってはならないコード範囲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedRange {
    pub start: u64,
    pub len: u64,
    pub label: String,
}

impl GuardedRange {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.len
    }
}

/// 保護範囲内にいるスレッド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyThread {
    pub tid: ThreadId,
    pub address: u64,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyChecker {
    ranges: Vec<GuardedRange>,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保護範囲を追加する。長さ0の範囲は無視する
    pub fn guard(&mut self, start: u64, len: u64, label: impl Into<String>) {
        if len == 0 {
            return;
        }
        self.ranges.push(GuardedRange {
            start,
            len,
            label: label.into(),
        });
    }

    pub fn ranges(&self) -> &[GuardedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 保護範囲内にいる全スレッドを列挙する
    pub fn find_busy(&self, threads: &[ThreadSnapshot]) -> Vec<BusyThread> {
        let mut busy = Vec::new();
        for thread in threads {
            let hit = thread.code_addresses().find_map(|addr| {
                self.ranges
                    .iter()
                    .find(|r| r.contains(addr))
                    .map(|r| (addr, r))
            });
            if let Some((address, range)) = hit {
                busy.push(BusyThread {
                    tid: thread.tid,
                    address,
                    label: range.label.clone(),
                });
            }
        }
        busy
    }

    /// 最初に見つかった使用中スレッドを返す
    pub fn check(&self, threads: &[ThreadSnapshot]) -> Result<(), BusyThread> {
        match self.find_busy(threads).into_iter().next() {
            Some(busy) => Err(busy),
            None => Ok(()),
        }
    }

    /// 静止するまで確認を繰り返す
    ///
    /// 使用中のスレッドがあればターゲットを `retry_delay` だけ走らせてから再確認し、
    /// `quiesce_retries` 回の再試行で静止しなければ `BusyTarget` を返します。
    /// メモリには一切書き込みません。
    pub fn wait_quiescent<T: Target>(
        &self,
        target: &mut T,
        options: &PatchOptions,
    ) -> Result<(), PatchError> {
        if self.is_empty() {
            return Ok(());
        }

        let mut attempts = 0u32;
        loop {
            let threads = target
                .threads(options.max_stack_depth)
                .map_err(PatchError::MemoryAccess)?;
            attempts += 1;

            let busy = match self.check(&threads) {
                Ok(()) => {
                    tracing::debug!(attempts, "target is quiescent");
                    return Ok(());
                }
                Err(busy) => busy,
            };

            if attempts > options.quiesce_retries {
                tracing::info!(
                    tid = busy.tid,
                    "giving up: {} still in use at {:#x}",
                    busy.label,
                    busy.address
                );
                return Err(PatchError::BusyTarget {
                    symbol: busy.label,
                    tid: busy.tid,
                    attempts,
                });
            }

            tracing::debug!(
                tid = busy.tid,
                attempt = attempts,
                "{} in use at {:#x}, letting the target run",
                busy.label,
                busy.address
            );
            target
                .requiesce(options.retry_delay)
                .map_err(PatchError::MemoryAccess)?;
        }
    }
}
