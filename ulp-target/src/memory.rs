//! メモリアクセス機能

use crate::{Result, TargetError};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

/// ptraceで転送されるワードのサイズ
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// メモリマッピング情報（/proc/pid/maps の1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピングのファイルオフセット
    pub offset: u64,
    /// ファイルパス（匿名マッピングや [stack] などは None）
    pub path: Option<PathBuf>,
}

impl MemoryMapping {
    /// アドレス範囲 [addr, addr+len) がこのマッピングに完全に含まれるか
    pub fn contains_span(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }

    /// ファイルに裏付けられていないマッピングかどうか
    pub fn is_anonymous(&self) -> bool {
        self.path.is_none()
    }

    /// /proc/pid/maps の1行を解析する
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(6, char::is_whitespace);
        let range = parts.next()?;
        let perms = parts.next()?;
        let offset = parts.next()?;
        let _dev = parts.next()?;
        let _inode = parts.next()?;
        let pathname = parts.next().map(str::trim).unwrap_or("");

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(offset, 16).ok()?;

        let perms = perms.as_bytes();
        // "[heap]" や "[vdso]" などの擬似パスはファイルとして扱わない
        let path = if pathname.starts_with('/') {
            Some(PathBuf::from(pathname))
        } else {
            None
        };

        Some(Self {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            path,
        })
    }
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                self.read_via_ptrace(addr, size)
            }
            Err(e) => Err(self.io_to_error(addr, size, e)),
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// まず /proc/pid/mem で書き込み、失敗した場合はPTRACE_POKEDATAによる
    /// ワード単位の書き込みにフォールバックします。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.write_via_proc_mem(addr, data) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(self.io_to_error(addr, data.len(), e))
            }
            Err(e) => {
                tracing::debug!(
                    "write via {} at {:#x} failed ({}), falling back to ptrace",
                    self.mem_path(),
                    addr,
                    e
                );
                self.write_via_ptrace(addr, data)
            }
        }
    }

    fn write_via_proc_mem(&self, addr: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data)
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, WORD_SIZE)?;
        let array: [u8; WORD_SIZE] = bytes
            .try_into()
            .map_err(|_| TargetError::memory(addr, WORD_SIZE, "short read"))?;
        Ok(u64::from_le_bytes(array))
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// ワード境界に揃えて読み取り、要求範囲だけを切り出します。
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size + 2 * WORD_SIZE);
        let aligned = align_down(addr);
        let skip = (addr - aligned) as usize;

        for word_addr in word_span(addr, size) {
            let word = self.peek(word_addr, addr, size)?;
            data.extend_from_slice(&word.to_ne_bytes());
        }

        Ok(data.into_iter().skip(skip).take(size).collect())
    }

    /// PTRACE_POKEDATAを使用してメモリに書き込む
    ///
    /// ptraceはワード単位でしか転送できないため、書き込み範囲がワード境界に
    /// 揃っていない場合は境界のワードを読み取ってから書き戻します（read-modify-write）。
    /// 要求範囲外のバイトは変更されません。
    pub fn write_via_ptrace(&self, addr: u64, data: &[u8]) -> Result<()> {
        use nix::sys::ptrace;

        for word_addr in word_span(addr, data.len()) {
            let covers_whole_word =
                word_addr >= addr && word_addr + WORD_SIZE as u64 <= addr + data.len() as u64;
            let current = if covers_whole_word {
                0
            } else {
                self.peek(word_addr, addr, data.len())?
            };
            let merged = merge_into_word(current, word_addr, addr, data);

            ptrace::write(self.pid, word_addr as ptrace::AddressType, merged as i64)
                .map_err(|e| TargetError::memory(word_addr, WORD_SIZE, format!("PTRACE_POKEDATA: {}", e)))?;
        }

        Ok(())
    }

    fn peek(&self, word_addr: u64, addr: u64, size: usize) -> Result<u64> {
        nix::sys::ptrace::read(self.pid, word_addr as nix::sys::ptrace::AddressType)
            .map(|w| w as u64)
            .map_err(|e| match e {
                Errno::ESRCH => TargetError::ProcessGone {
                    pid: self.pid.as_raw(),
                    detail: format!("PTRACE_PEEKDATA at {:#x}", word_addr),
                },
                e => TargetError::memory(addr, size, format!("PTRACE_PEEKDATA at {:#x}: {}", word_addr, e)),
            })
    }

    fn io_to_error(&self, addr: u64, size: usize, e: std::io::Error) -> TargetError {
        if e.kind() == ErrorKind::NotFound {
            TargetError::ProcessGone {
                pid: self.pid.as_raw(),
                detail: format!("{} vanished", self.mem_path()),
            }
        } else {
            TargetError::memory(addr, size, e)
        }
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TargetError::NoSuchProcess(self.pid.as_raw())
            } else {
                TargetError::Io(e)
            }
        })?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = MemoryMapping::parse_line(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}

fn align_down(addr: u64) -> u64 {
    addr & !(WORD_SIZE as u64 - 1)
}

/// [addr, addr+len) に掛かるワード境界アドレスを列挙する
pub fn word_span(addr: u64, len: usize) -> impl Iterator<Item = u64> {
    let first = align_down(addr);
    let end = addr + len as u64;
    (0..)
        .map(move |i| first + i * WORD_SIZE as u64)
        .take_while(move |w| *w < end)
}

/// `word_addr` から始まるワード `word` に、`addr` から始まる `data` のうち
/// 重なる部分だけを上書きした値を返す
pub fn merge_into_word(word: u64, word_addr: u64, addr: u64, data: &[u8]) -> u64 {
    let mut bytes = word.to_ne_bytes();
    for (i, byte) in bytes.iter_mut().enumerate() {
        let at = word_addr + i as u64;
        if at >= addr && at < addr + data.len() as u64 {
            *byte = data[(at - addr) as usize];
        }
    }
    u64::from_ne_bytes(bytes)
}
