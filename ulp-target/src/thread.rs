//! スレッド管理機能

use crate::{Memory, Registers, Result};

/// スレッドID
pub type ThreadId = i32;

/// 停止中のスレッドの実行位置のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub tid: ThreadId,
    /// 命令ポインタ（RIP）
    pub ip: u64,
    /// スタックポインタ（RSP）
    pub sp: u64,
    /// 戻りアドレスの候補（ベストエフォート）
    pub return_chain: Vec<u64>,
}

impl ThreadSnapshot {
    /// 命令ポインタと全ての戻りアドレス候補を列挙する
    pub fn code_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.ip).chain(self.return_chain.iter().copied())
    }

    /// 停止中スレッドのレジスタとスタックからスナップショットを作成する
    ///
    /// 戻りアドレスは、関数入口直後で停止している場合に備えて `[rsp]` のワードと、
    /// フレームポインタ（RBP）チェーンを `max_depth` 段まで辿ったものを集めます。
    /// フレームポインタを持たないコードでは誤った値が混ざることがありますが、
    /// 余分な候補は安全側（busy判定）にしか働きません。
    pub fn capture(tid: ThreadId, memory: &Memory, max_depth: usize) -> Result<Self> {
        let regs = Registers::new(tid).read()?;
        let mut return_chain = Vec::new();

        if let Ok(word) = memory.read_u64(regs.rsp) {
            return_chain.push(word);
        }

        let mut frame = regs.rbp;
        for _ in 0..max_depth {
            if frame == 0 || frame % 8 != 0 || frame < regs.rsp {
                break;
            }
            let (Ok(next), Ok(ret)) = (memory.read_u64(frame), memory.read_u64(frame + 8)) else {
                break;
            };
            if ret != 0 {
                return_chain.push(ret);
            }
            // スタックは上位アドレスへ向かって戻るので、単調増加しなければ打ち切る
            if next <= frame {
                break;
            }
            frame = next;
        }

        Ok(Self {
            tid,
            ip: regs.rip,
            sp: regs.rsp,
            return_chain,
        })
    }
}

/// /proc/pid/task からスレッドIDを列挙する
pub fn list_threads(pid: i32) -> std::io::Result<Vec<ThreadId>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
        if let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_addresses_includes_ip_first() {
        let snap = ThreadSnapshot {
            tid: 1,
            ip: 0x1000,
            sp: 0x7ff0,
            return_chain: vec![0x2000, 0x3000],
        };
        let addrs: Vec<u64> = snap.code_addresses().collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_list_threads_of_self() {
        let tids = list_threads(std::process::id() as i32).unwrap();
        assert!(tids.contains(&(std::process::id() as i32)));
    }
}
