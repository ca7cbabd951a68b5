//! メモリ上の偽ターゲット
//!
//! 実プロセスの代わりに、バイト列で表したマッピングとスクリプト化した
//! スレッドのスナップショットを持ちます。書き込み失敗を任意の位置で
//! 起こせるので、巻き戻しの経路を決定的に試せます。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use ulp_core::{
    BuildId, LoadedModule, ModuleCatalog, PatchContainer, PatchOptions, Redirection,
    RedirectionKind, SymbolKind, Target,
};
use ulp_elf::{Symbol, SymbolTable};
use ulp_target::remote::{page_align, PAGE_SIZE};
use ulp_target::{MemoryMapping, TargetError, ThreadSnapshot};

pub const PID: i32 = 4321;

pub const BIAS: u64 = 0x5555_0000_0000;
pub const TEXT: u64 = BIAS + 0x1000;
pub const DATA: u64 = BIAS + 0x4000;

pub const BANNER_SET: u64 = BIAS + 0x1120;
pub const BANNER_GET: u64 = BIAS + 0x1160;
pub const SHORT_FN: u64 = BIAS + 0x11a0;
pub const TINY_FN: u64 = BIAS + 0x11b0;
pub const UNSIZED_FN: u64 = BIAS + 0x11c0;
pub const BANNER: u64 = BIAS + 0x4000;
pub const FLAG: u64 = BIAS + 0x4008;

pub const DEP_BASE: u64 = 0x7f10_0000_0000;
pub const DEP_FN: u64 = DEP_BASE + 0x1100;

pub const BANNER_ID: BuildId = BuildId([0xab; 20]);
pub const DEP_ID: BuildId = BuildId([0xcd; 20]);

/// 書き換え対象のどこにもいないアドレス
pub const IDLE_IP: u64 = 0x7f20_0000_0040;

pub const NEAR_REGION: u64 = BIAS + 0x10_0000;
pub const FAR_REGION: u64 = 0x7f00_0000_0000;

/// mov rax, 1; ret
const UNSIZED_CODE: [u8; 8] = [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3];

pub struct Segment {
    pub mapping: MemoryMapping,
    pub bytes: Vec<u8>,
}

pub struct FakeTarget {
    pub segments: Vec<Segment>,
    /// threads() が返すスナップショット。requiesce のたびに次へ進む（最後は残る）
    pub schedule: VecDeque<Vec<ThreadSnapshot>>,
    pub requiesce_calls: usize,
    pub write_attempts: usize,
    pub writes: usize,
    /// このアドレスに触れる最初の書き込みを失敗させる
    pub fail_write_to: Option<u64>,
    /// 成功した書き込みがこの数に達したら以後すべて失敗させる
    pub fail_after_writes: Option<usize>,
    pub next_region: u64,
    pub allocations: usize,
    pub releases: usize,
    pub detached: bool,
}

fn file_mapping(start: u64, end: u64, exec: bool, offset: u64, path: &str) -> MemoryMapping {
    MemoryMapping {
        start,
        end,
        readable: true,
        writable: !exec,
        executable: exec,
        offset,
        path: Some(PathBuf::from(path)),
    }
}

impl FakeTarget {
    pub fn new() -> Self {
        let mut text: Vec<u8> = (0..0x1000u32).map(|i| (i as u8).wrapping_mul(7)).collect();
        let off = (UNSIZED_FN - TEXT) as usize;
        text[off..off + UNSIZED_CODE.len()].copy_from_slice(&UNSIZED_CODE);

        let mut data = vec![0u8; 0x1000];
        data[..8].copy_from_slice(&7u64.to_le_bytes());
        data[8..12].copy_from_slice(&1u32.to_le_bytes());

        let dep_text: Vec<u8> = (0..0x1000u32).map(|i| (i as u8) ^ 0x5a).collect();

        Self {
            segments: vec![
                Segment {
                    mapping: file_mapping(BIAS, TEXT, false, 0, "/opt/app/banner"),
                    bytes: vec![0x7f; 0x1000],
                },
                Segment {
                    mapping: file_mapping(TEXT, TEXT + 0x1000, true, 0x1000, "/opt/app/banner"),
                    bytes: text,
                },
                Segment {
                    mapping: file_mapping(DATA, DATA + 0x1000, false, 0x3000, "/opt/app/banner"),
                    bytes: data,
                },
                Segment {
                    mapping: file_mapping(
                        DEP_BASE + 0x1000,
                        DEP_BASE + 0x2000,
                        true,
                        0x1000,
                        "/usr/lib/libdep.so",
                    ),
                    bytes: dep_text,
                },
            ],
            schedule: VecDeque::from(vec![vec![idle_thread(100), idle_thread(101)]]),
            requiesce_calls: 0,
            write_attempts: 0,
            writes: 0,
            fail_write_to: None,
            fail_after_writes: None,
            next_region: NEAR_REGION,
            allocations: 0,
            releases: 0,
            detached: false,
        }
    }

    /// 確保領域をモジュールから rel32 の届かない位置に置く
    pub fn with_far_regions(mut self) -> Self {
        self.next_region = FAR_REGION;
        self
    }

    pub fn with_schedule(mut self, schedule: Vec<Vec<ThreadSnapshot>>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// ファイル由来のマッピングの内容（比較用）
    pub fn module_image(&self) -> Vec<(u64, Vec<u8>)> {
        self.segments
            .iter()
            .filter(|s| !s.mapping.is_anonymous())
            .map(|s| (s.mapping.start, s.bytes.clone()))
            .collect()
    }

    /// 確保されたままの領域
    pub fn regions(&self) -> Vec<u64> {
        self.segments
            .iter()
            .filter(|s| s.mapping.is_anonymous())
            .map(|s| s.mapping.start)
            .collect()
    }

    pub fn bytes_at(&self, addr: u64, len: usize) -> Vec<u8> {
        Target::read(self, addr, len).unwrap()
    }

    fn segment_mut(&mut self, addr: u64, len: usize) -> Option<&mut Segment> {
        self.segments
            .iter_mut()
            .find(|s| s.mapping.contains_span(addr, len as u64))
    }
}

impl Target for FakeTarget {
    fn pid(&self) -> i32 {
        PID
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.mapping.contains_span(addr, len as u64))
            .ok_or_else(|| TargetError::memory(addr, len, "unmapped"))?;
        let off = (addr - segment.mapping.start) as usize;
        Ok(segment.bytes[off..off + len].to_vec())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TargetError> {
        self.write_attempts += 1;
        if self.fail_after_writes.is_some_and(|n| self.writes >= n) {
            return Err(TargetError::memory(addr, data.len(), "injected failure"));
        }
        if self
            .fail_write_to
            .is_some_and(|a| a >= addr && a < addr + data.len() as u64)
        {
            // 一度だけ失敗させる（巻き戻しの書き込みは通す）
            self.fail_write_to = None;
            return Err(TargetError::memory(addr, data.len(), "injected failure"));
        }

        let segment = self
            .segment_mut(addr, data.len())
            .ok_or_else(|| TargetError::memory(addr, data.len(), "unmapped"))?;
        let off = (addr - segment.mapping.start) as usize;
        segment.bytes[off..off + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn threads(&self, _max_depth: usize) -> Result<Vec<ThreadSnapshot>, TargetError> {
        Ok(self.schedule.front().cloned().unwrap_or_default())
    }

    fn requiesce(&mut self, _pause: Duration) -> Result<(), TargetError> {
        self.requiesce_calls += 1;
        if self.schedule.len() > 1 {
            self.schedule.pop_front();
        }
        Ok(())
    }

    fn mappings(&self) -> Result<Vec<MemoryMapping>, TargetError> {
        Ok(self.segments.iter().map(|s| s.mapping.clone()).collect())
    }

    fn allocate(&mut self, len: u64, _near: u64) -> Result<u64, TargetError> {
        let len = page_align(len.max(1));
        let start = self.next_region;
        // 隙間を空けて結合されないようにする
        self.next_region += len + PAGE_SIZE;
        self.allocations += 1;
        self.segments.push(Segment {
            mapping: MemoryMapping {
                start,
                end: start + len,
                readable: true,
                writable: false,
                executable: true,
                offset: 0,
                path: None,
            },
            bytes: vec![0; len as usize],
        });
        Ok(start)
    }

    fn release(&mut self, addr: u64, _len: u64) -> Result<(), TargetError> {
        let index = self
            .segments
            .iter()
            .position(|s| s.mapping.is_anonymous() && s.mapping.start == addr)
            .ok_or_else(|| TargetError::memory(addr, 0, "not an allocated region"))?;
        self.segments.remove(index);
        self.releases += 1;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), TargetError> {
        self.detached = true;
        Ok(())
    }
}

pub fn idle_thread(tid: i32) -> ThreadSnapshot {
    ThreadSnapshot {
        tid,
        ip: IDLE_IP,
        sp: 0x7ffd_0000_0000,
        return_chain: vec![IDLE_IP + 0x100],
    }
}

pub fn thread_at(tid: i32, ip: u64, return_chain: &[u64]) -> ThreadSnapshot {
    ThreadSnapshot {
        tid,
        ip,
        sp: 0x7ffd_0000_0000,
        return_chain: return_chain.to_vec(),
    }
}

/// 偽ターゲットのモジュール構成に対応するカタログ
pub fn catalog(target: &FakeTarget) -> ModuleCatalog {
    let banner_segments = target
        .segments
        .iter()
        .filter(|s| s.mapping.path.as_deref() == Some(std::path::Path::new("/opt/app/banner")))
        .map(|s| s.mapping.clone())
        .collect();
    let dep_segments = target
        .segments
        .iter()
        .filter(|s| s.mapping.path.as_deref() == Some(std::path::Path::new("/usr/lib/libdep.so")))
        .map(|s| s.mapping.clone())
        .collect();

    ModuleCatalog::from_modules(vec![
        LoadedModule {
            name: "banner".into(),
            path: PathBuf::from("/opt/app/banner"),
            bias: BIAS,
            build_id: Some(BANNER_ID),
            stale: false,
            symbols: SymbolTable::from_symbols([
                Symbol::new("banner_set".into(), BANNER_SET - BIAS, 0x30, SymbolKind::Text),
                Symbol::new("banner_get".into(), BANNER_GET - BIAS, 0x20, SymbolKind::Text),
                Symbol::new("short_fn".into(), SHORT_FN - BIAS, 8, SymbolKind::Text),
                Symbol::new("tiny_fn".into(), TINY_FN - BIAS, 3, SymbolKind::Text),
                Symbol::new("unsized_fn".into(), UNSIZED_FN - BIAS, 0, SymbolKind::Text),
                Symbol::new("BANNER".into(), BANNER - BIAS, 8, SymbolKind::Data),
                Symbol::new("FLAG".into(), FLAG - BIAS, 4, SymbolKind::Data),
            ]),
            segments: banner_segments,
        },
        LoadedModule {
            name: "libdep.so".into(),
            path: PathBuf::from("/usr/lib/libdep.so"),
            bias: DEP_BASE,
            build_id: Some(DEP_ID),
            stale: false,
            symbols: SymbolTable::from_symbols([Symbol::new(
                "dep_fn".into(),
                DEP_FN - DEP_BASE,
                0x40,
                SymbolKind::Text,
            )]),
            segments: dep_segments,
        },
    ])
}

pub fn function(symbol: &str, payload: &[u8]) -> Redirection {
    Redirection {
        module: "banner".into(),
        build_id: BANNER_ID,
        symbol: symbol.into(),
        kind: RedirectionKind::Function,
        payload: payload.to_vec(),
    }
}

pub fn data(symbol: &str, payload: &[u8]) -> Redirection {
    Redirection {
        module: "banner".into(),
        build_id: BANNER_ID,
        symbol: symbol.into(),
        kind: RedirectionKind::Data,
        payload: payload.to_vec(),
    }
}

pub fn dep_function(payload: &[u8]) -> Redirection {
    Redirection {
        module: "libdep.so".into(),
        build_id: DEP_ID,
        symbol: "dep_fn".into(),
        kind: RedirectionKind::Function,
        payload: payload.to_vec(),
    }
}

pub fn container(redirections: Vec<Redirection>) -> PatchContainer {
    PatchContainer::new(redirections).unwrap()
}

/// 再試行を2回、待ち時間なしにした設定
pub fn options() -> PatchOptions {
    PatchOptions::default().with_retries(2, Duration::ZERO)
}
