//! ライブパッチの動作確認用プログラム
//! 1つのグローバル値に対するセッターとゲッターを持ち、標準入力から1行ずつ
//! コマンドを受け取ります。実行中にulpでパッチを当て、挙動の変化を確かめます。
//!
//! コマンド:
//!   get       値を表示する
//!   set <n>   値を設定する
//!   calls     セッターの呼び出し回数を表示する
//!   zeroed    ゼロ初期化された値（.bss）を表示する
//!   quit      終了する

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// パッチの対象になるグローバル値
#[no_mangle]
pub static BANNER_VALUE: AtomicU64 = AtomicU64::new(7);

/// ゼロ初期化されたグローバル値（.bss に置かれる）
#[no_mangle]
pub static BANNER_ZEROED: AtomicU64 = AtomicU64::new(0);

/// セッターの呼び出し回数
static SET_CALLS: AtomicU64 = AtomicU64::new(0);

/// 値を設定し、以前の値を返す
#[no_mangle]
#[inline(never)]
pub extern "C" fn banner_set(value: u64) -> u64 {
    let previous = BANNER_VALUE.swap(value, Ordering::SeqCst);
    SET_CALLS.fetch_add(1, Ordering::SeqCst);
    previous
}

/// 現在の値を返す
#[no_mangle]
#[inline(never)]
pub extern "C" fn banner_get() -> u64 {
    BANNER_VALUE.load(Ordering::SeqCst)
}

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("get"), None) => writeln!(stdout, "{}", banner_get())?,
            (Some("set"), Some(value)) => match value.parse::<u64>() {
                Ok(value) => {
                    banner_set(value);
                    writeln!(stdout, "ok")?;
                }
                Err(_) => writeln!(stdout, "bad value: {}", value)?,
            },
            (Some("calls"), None) => writeln!(stdout, "{}", SET_CALLS.load(Ordering::SeqCst))?,
            (Some("zeroed"), None) => {
                writeln!(stdout, "{}", BANNER_ZEROED.load(Ordering::SeqCst))?
            }
            (Some("quit"), None) => break,
            _ => writeln!(stdout, "unknown command: {}", line)?,
        }
        stdout.flush()?;
    }

    Ok(())
}
