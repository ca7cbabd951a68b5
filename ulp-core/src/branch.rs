//! x86-64 の分岐命令の生成

/// `jmp rel32` の長さ
pub const REL32_JUMP_LEN: usize = 5;
/// `jmp [rip+0]; dq target` の長さ
pub const ABS_JUMP_LEN: usize = 14;

/// `from` に置いた `jmp rel32` で `to` へ飛ぶ命令列。距離が ±2GiB を超える場合は None
pub fn rel32_jump(from: u64, to: u64) -> Option<[u8; REL32_JUMP_LEN]> {
    let next = from.wrapping_add(REL32_JUMP_LEN as u64);
    let disp = (to as i64).wrapping_sub(next as i64);
    let disp = i32::try_from(disp).ok()?;

    let mut code = [0u8; REL32_JUMP_LEN];
    code[0] = 0xe9;
    code[1..].copy_from_slice(&disp.to_le_bytes());
    Some(code)
}

/// 絶対アドレスへの間接分岐（どこからでも届く）
pub fn abs_jump(to: u64) -> [u8; ABS_JUMP_LEN] {
    let mut code = [0u8; ABS_JUMP_LEN];
    // jmp qword ptr [rip+0]
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&to.to_le_bytes());
    code
}

/// 届くなら短い形式、届かなければ絶対分岐を返す
pub fn encode_jump(from: u64, to: u64) -> Vec<u8> {
    match rel32_jump(from, to) {
        Some(code) => code.to_vec(),
        None => abs_jump(to).to_vec(),
    }
}
