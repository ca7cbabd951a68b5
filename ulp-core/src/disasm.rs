//! 逆アセンブル機能
//!
//! サイズ情報のない関数について、入口に分岐命令を置けるかどうかを調べます。

use capstone::prelude::*;

/// 制御がこの命令の後ろへ流れない命令
fn ends_flow(mnemonic: &str) -> bool {
    matches!(mnemonic, "ret" | "retq" | "jmp" | "ud2" | "int3" | "hlt")
}

/// 関数入口から `needed` バイト以上を、命令境界で覆う長さを求める
///
/// # Arguments
/// * `code` - 関数入口から読み取ったバイト列
/// * `base_addr` - 関数の開始アドレス
/// * `needed` - 書き換えたいバイト数
///
/// # Returns
/// 覆うのに必要な長さ。`needed` に届く前に関数が終わる（ret や無条件分岐）か、
/// 解読できない場合は None
pub fn entry_span(code: &[u8], base_addr: u64, needed: usize) -> Option<usize> {
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| tracing::warn!("Failed to create Capstone: {}", e))
        .ok()?;

    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| tracing::debug!("Failed to disassemble at {:#x}: {}", base_addr, e))
        .ok()?;

    let mut covered = 0usize;
    for insn in insns.as_ref() {
        covered += insn.bytes().len();
        if covered >= needed {
            return Some(covered);
        }
        if ends_flow(insn.mnemonic().unwrap_or("")) {
            return None;
        }
    }
    None
}
