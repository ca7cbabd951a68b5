//! パッチ操作の設定

use std::path::PathBuf;
use std::time::Duration;

/// apply / revert セッションの設定
#[derive(Debug, Clone)]
pub struct PatchOptions {
    /// 静止確認を再試行する回数（初回を含まない）
    pub quiesce_retries: u32,
    /// 再試行の前にターゲットを走らせる時間
    pub retry_delay: Duration,
    /// 戻りアドレスを辿るスタックフレームの最大数
    pub max_stack_depth: usize,
    /// PIDごとのロックファイルと致命的状態マーカーを置くディレクトリ
    pub lock_dir: PathBuf,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            quiesce_retries: 10,
            retry_delay: Duration::from_millis(20),
            max_stack_depth: 64,
            lock_dir: std::env::temp_dir(),
        }
    }
}

impl PatchOptions {
    /// 静止確認の再試行回数を設定する
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.quiesce_retries = retries;
        self.retry_delay = delay;
        self
    }

    /// ロックディレクトリを設定する
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }
}
