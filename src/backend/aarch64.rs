//! AArch64 backend (AAPCS64).

use crate::block::CodeBuf;

use super::{greg_off, HostReg, VM_PC_OFF, VM_TRAMPOLINE_OFF};

pub const X0: HostReg = 0;
pub const X16: HostReg = 16;
pub const X17: HostReg = 17;
pub const X19: HostReg = 19;
pub const X28: HostReg = 28;

/// Host register holding the VM state pointer for the whole block.
pub const VM_PTR_REG: HostReg = X0;

/// x1-x15: caller-saved, free to clobber. x16/x17 are reserved as
/// emitter scratch and x18 is the platform register.
pub const SCRATCH_REGS_MASK: u32 = 0xFFFE;

/// x19-x28: callee-saved pool, reclaimable with a save/restore pair.
pub const ABI_RECLAIM_REGS_MASK: u32 = ((1 << (X28 + 1)) - 1) & !((1 << X19) - 1);

/// Bytes a direct-jump patch site occupies (B imm26).
pub const JMP_PATCH_SIZE: usize = 4;

/// Direct B range is +/-128 MiB.
const B_MAX_OFFSET: i64 = (1 << 27) - 4;

fn put32(buf: &mut CodeBuf, insn: u32) {
    buf.push_bytes(&insn.to_le_bytes());
}

/// Block prologue. The VM state pointer already arrives in x0 and x0 is
/// excluded from both allocation pools, so nothing needs to be
/// materialized.
pub fn emit_prologue(_buf: &mut CodeBuf) {}

/// ldr hreg, [x0, #greg*8] (32-bit when the guest is RV32)
pub fn emit_reg_load(buf: &mut CodeBuf, hreg: HostReg, greg: u8, rv64: bool) {
    let off = greg_off(greg) as u32;
    if rv64 {
        put32(buf, 0xF940_0000 | ((off / 8) << 10) | ((VM_PTR_REG as u32) << 5) | hreg as u32);
    } else {
        put32(buf, 0xB940_0000 | ((off / 4) << 10) | ((VM_PTR_REG as u32) << 5) | hreg as u32);
    }
}

/// str hreg, [x0, #greg*8] (32-bit when the guest is RV32)
pub fn emit_reg_store(buf: &mut CodeBuf, hreg: HostReg, greg: u8, rv64: bool) {
    let off = greg_off(greg) as u32;
    if rv64 {
        put32(buf, 0xF900_0000 | ((off / 8) << 10) | ((VM_PTR_REG as u32) << 5) | hreg as u32);
    } else {
        put32(buf, 0xB900_0000 | ((off / 4) << 10) | ((VM_PTR_REG as u32) << 5) | hreg as u32);
    }
}

/// Add `pc_off` to the VM PC slot, via the x17 emitter scratch.
pub fn emit_pc_commit(buf: &mut CodeBuf, pc_off: i32) {
    debug_assert!(pc_off >= 0);
    let pc_scaled = (VM_PC_OFF as u32 / 8) << 10;

    // ldr x17, [x0, #pc]
    put32(buf, 0xF940_0000 | pc_scaled | ((VM_PTR_REG as u32) << 5) | X17 as u32);
    if pc_off < 0x1000 {
        // add x17, x17, #pc_off
        put32(buf, 0x9100_0000 | ((pc_off as u32) << 10) | ((X17 as u32) << 5) | X17 as u32);
    } else {
        // movz x16, #lo16; movk x16, #hi16, lsl 16; add x17, x17, x16
        let lo = pc_off as u32 & 0xFFFF;
        let hi = (pc_off as u32 >> 16) & 0xFFFF;
        put32(buf, 0xD280_0000 | (lo << 5) | X16 as u32);
        put32(buf, 0xF2A0_0000 | (hi << 5) | X16 as u32);
        put32(buf, 0x8B00_0000 | ((X16 as u32) << 16) | ((X17 as u32) << 5) | X17 as u32);
    }
    // str x17, [x0, #pc]
    put32(buf, 0xF900_0000 | pc_scaled | ((VM_PTR_REG as u32) << 5) | X17 as u32);
}

/// str hreg, [sp, #-16]!
pub fn emit_push(buf: &mut CodeBuf, hreg: HostReg) {
    put32(buf, 0xF81F_0FE0 | hreg as u32);
}

/// ldr hreg, [sp], #16
pub fn emit_pop(buf: &mut CodeBuf, hreg: HostReg) {
    put32(buf, 0xF841_07E0 | hreg as u32);
}

/// ret
pub fn emit_ret(buf: &mut CodeBuf) {
    put32(buf, 0xD65F_03C0);
}

/// Direct-jump placeholder: `b +4` over a `ret`, so the unpatched site
/// is a valid NONE-style exit. Returns the offset of the patchable
/// branch within the buffer.
pub fn emit_jmp_placeholder(buf: &mut CodeBuf) -> usize {
    let patch_off = buf.len();
    put32(buf, 0x1400_0001);
    emit_ret(buf);
    patch_off
}

/// ldr x17, [x0, #trampoline]; br x17
pub fn emit_tail_jmp(buf: &mut CodeBuf) {
    let tramp_scaled = (VM_TRAMPOLINE_OFF as u32 / 8) << 10;
    put32(buf, 0xF940_0000 | tramp_scaled | ((VM_PTR_REG as u32) << 5) | X17 as u32);
    put32(buf, 0xD61F_0000 | ((X17 as u32) << 5));
}

/// Encode a patched direct branch at address `src` targeting `dst`.
/// Returns None when the displacement is outside B's imm26 range; the
/// placeholder fallback then stays in effect.
pub fn encode_jmp(src: usize, dst: usize) -> Option<[u8; JMP_PATCH_SIZE]> {
    let off = (dst as i64).wrapping_sub(src as i64);
    debug_assert_eq!(off & 3, 0);
    if off < -(B_MAX_OFFSET + 4) || off > B_MAX_OFFSET {
        return None;
    }
    let insn = 0x1400_0000 | (((off >> 2) as u32) & 0x03FF_FFFF);
    Some(insn.to_le_bytes())
}

extern "C" {
    // Provided by compiler-rt / libgcc.
    fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
}

/// AArch64 has split I/D caches; flush after every code write.
pub fn flush_icache(ptr: *const u8, len: usize) {
    unsafe {
        __clear_cache(ptr as *mut _, ptr.wrapping_add(len) as *mut _);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Check that the words for an emitted sequence match
    fn check_words<R>(words: &[u32], run: R)
    where
        R: FnOnce(&mut CodeBuf),
    {
        let mut buf = CodeBuf::new();
        run(&mut buf);
        let emitted: Vec<u32> = buf
            .as_slice()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(emitted, words);
    }

    #[test]
    fn test_reg_load_store() {
        // ldr x3, [x0, #8] / str x3, [x0, #8]
        check_words(&[0xF9400403], |buf| emit_reg_load(buf, 3, 1, true));
        check_words(&[0xF9000403], |buf| emit_reg_store(buf, 3, 1, true));
        // ldr w3, [x0, #8]
        check_words(&[0xB9400803], |buf| emit_reg_load(buf, 3, 1, false));
    }

    #[test]
    fn test_pc_commit() {
        // ldr x17, [x0, #256]; add x17, x17, #4; str x17, [x0, #256]
        check_words(&[0xF9408011, 0x91001231, 0xF9008011], |buf| emit_pc_commit(buf, 4));
    }

    #[test]
    fn test_push_pop() {
        // str x19, [sp, #-16]! / ldr x19, [sp], #16
        check_words(&[0xF81F0FF3], |buf| emit_push(buf, X19));
        check_words(&[0xF84107F3], |buf| emit_pop(buf, X19));
    }

    #[test]
    fn test_terminators() {
        check_words(&[0xD65F03C0], emit_ret);
        check_words(&[0x14000001, 0xD65F03C0], |buf| {
            assert_eq!(emit_jmp_placeholder(buf), 0);
        });
        // ldr x17, [x0, #264]; br x17
        check_words(&[0xF9408411, 0xD61F0220], emit_tail_jmp);
    }

    #[test]
    fn test_encode_jmp() {
        // b . (self)
        assert_eq!(encode_jmp(0x1000, 0x1000), Some(0x14000000u32.to_le_bytes()));
        // b +16
        assert_eq!(encode_jmp(0x1000, 0x1010), Some(0x14000004u32.to_le_bytes()));
        // b -4
        assert_eq!(encode_jmp(0x1004, 0x1000), Some(0x17FFFFFFu32.to_le_bytes()));
        // Out of imm26 range
        assert_eq!(encode_jmp(0, 1 << 30), None);
    }

    #[test]
    fn vm_ptr_reg_is_not_allocatable() {
        let pools = SCRATCH_REGS_MASK | ABI_RECLAIM_REGS_MASK;
        assert_eq!(pools & (1 << VM_PTR_REG), 0);
        assert_eq!(pools & (1 << X16), 0);
        assert_eq!(pools & (1 << X17), 0);
        assert_eq!(SCRATCH_REGS_MASK & ABI_RECLAIM_REGS_MASK, 0);
    }
}
