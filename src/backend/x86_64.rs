//! x86-64 backend (SysV and Win64).

use crate::block::CodeBuf;

use super::{greg_off, HostReg, VM_PC_OFF, VM_TRAMPOLINE_OFF};

pub const RAX: HostReg = 0;
pub const RCX: HostReg = 1;
pub const RDX: HostReg = 2;
pub const RBX: HostReg = 3;
pub const RSP: HostReg = 4;
pub const RBP: HostReg = 5;
pub const RSI: HostReg = 6;
pub const RDI: HostReg = 7;
pub const R8: HostReg = 8;
pub const R9: HostReg = 9;
pub const R10: HostReg = 10;
pub const R11: HostReg = 11;
pub const R12: HostReg = 12;
pub const R13: HostReg = 13;
pub const R14: HostReg = 14;
pub const R15: HostReg = 15;

const fn bit(reg: HostReg) -> u32 {
    1 << reg
}

/// Host register holding the VM state pointer for the whole block:
/// the first integer argument register of the active ABI.
#[cfg(not(windows))]
pub const VM_PTR_REG: HostReg = RDI;
#[cfg(windows)]
pub const VM_PTR_REG: HostReg = RCX;

/// ABI-volatile registers the generated code may clobber freely,
/// minus the VM state pointer.
#[cfg(not(windows))]
pub const SCRATCH_REGS_MASK: u32 =
    bit(RAX) | bit(RCX) | bit(RDX) | bit(RSI) | bit(R8) | bit(R9) | bit(R10) | bit(R11);
#[cfg(windows)]
pub const SCRATCH_REGS_MASK: u32 =
    bit(RAX) | bit(RDX) | bit(R8) | bit(R9) | bit(R10) | bit(R11);

/// Callee-saved registers the allocator may additionally reclaim. Each
/// one claimed must be saved on entry to its live range and restored in
/// the epilogue.
#[cfg(not(windows))]
pub const ABI_RECLAIM_REGS_MASK: u32 =
    bit(RBX) | bit(R12) | bit(R13) | bit(R14) | bit(R15);
#[cfg(windows)]
pub const ABI_RECLAIM_REGS_MASK: u32 = bit(RBX) | bit(RBP) | bit(RSI) | bit(RDI)
    | bit(R12) | bit(R13) | bit(R14) | bit(R15);

/// Bytes a direct-jump patch site occupies (jmp rel32).
pub const JMP_PATCH_SIZE: usize = 5;

/// REX prefix. Emitted only when any field requires it.
fn write_rex(buf: &mut CodeBuf, w: bool, reg: HostReg, rm: HostReg) {
    let rex = 0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1);
    if rex != 0x40 {
        buf.push_byte(rex);
    }
}

/// ModRM + displacement for a `[base + disp]` operand. `base` is always
/// the VM pointer register here, which never needs an SIB byte.
fn write_modrm_disp(buf: &mut CodeBuf, reg: HostReg, base: HostReg, disp: i32) {
    debug_assert!(base & 7 != RSP, "rsp-based operands need an SIB byte");

    if (-128..=127).contains(&disp) {
        buf.push_byte(0x40 | ((reg & 7) << 3) | (base & 7));
        buf.push_byte(disp as u8);
    } else {
        buf.push_byte(0x80 | ((reg & 7) << 3) | (base & 7));
        buf.push_bytes(&disp.to_le_bytes());
    }
}

/// Block prologue. The VM state pointer already arrives in [VM_PTR_REG]
/// and that register is excluded from both allocation pools, so nothing
/// needs to be materialized.
pub fn emit_prologue(_buf: &mut CodeBuf) {}

/// mov hreg, [vm + greg*8] (32-bit when the guest is RV32)
pub fn emit_reg_load(buf: &mut CodeBuf, hreg: HostReg, greg: u8, rv64: bool) {
    write_rex(buf, rv64, hreg, VM_PTR_REG);
    buf.push_byte(0x8B);
    write_modrm_disp(buf, hreg, VM_PTR_REG, greg_off(greg));
}

/// mov [vm + greg*8], hreg (32-bit when the guest is RV32)
pub fn emit_reg_store(buf: &mut CodeBuf, hreg: HostReg, greg: u8, rv64: bool) {
    write_rex(buf, rv64, hreg, VM_PTR_REG);
    buf.push_byte(0x89);
    write_modrm_disp(buf, hreg, VM_PTR_REG, greg_off(greg));
}

/// add qword [vm + pc], pc_off
pub fn emit_pc_commit(buf: &mut CodeBuf, pc_off: i32) {
    write_rex(buf, true, 0, VM_PTR_REG);
    if (-128..=127).contains(&pc_off) {
        buf.push_byte(0x83);
        write_modrm_disp(buf, 0, VM_PTR_REG, VM_PC_OFF);
        buf.push_byte(pc_off as u8);
    } else {
        buf.push_byte(0x81);
        write_modrm_disp(buf, 0, VM_PTR_REG, VM_PC_OFF);
        buf.push_bytes(&pc_off.to_le_bytes());
    }
}

/// push hreg
pub fn emit_push(buf: &mut CodeBuf, hreg: HostReg) {
    if hreg >= 8 {
        buf.push_byte(0x41);
    }
    buf.push_byte(0x50 + (hreg & 7));
}

/// pop hreg
pub fn emit_pop(buf: &mut CodeBuf, hreg: HostReg) {
    if hreg >= 8 {
        buf.push_byte(0x41);
    }
    buf.push_byte(0x58 + (hreg & 7));
}

/// ret
pub fn emit_ret(buf: &mut CodeBuf) {
    buf.push_byte(0xC3);
}

/// Direct-jump placeholder: `jmp +0` falling through to a `ret`, so the
/// unpatched site is a valid NONE-style exit. Returns the offset of the
/// patchable jump within the buffer.
pub fn emit_jmp_placeholder(buf: &mut CodeBuf) -> usize {
    let patch_off = buf.len();
    buf.push_byte(0xE9);
    buf.push_bytes(&0i32.to_le_bytes());
    emit_ret(buf);
    patch_off
}

/// jmp qword [vm + trampoline] — indirect tail transfer for dynamic
/// successors.
pub fn emit_tail_jmp(buf: &mut CodeBuf) {
    buf.push_byte(0xFF);
    write_modrm_disp(buf, 4, VM_PTR_REG, VM_TRAMPOLINE_OFF);
}

/// Encode a patched direct jump at address `src` targeting `dst`.
/// Returns None when the displacement is out of rel32 range.
pub fn encode_jmp(src: usize, dst: usize) -> Option<[u8; JMP_PATCH_SIZE]> {
    let rel = (dst as i64).wrapping_sub(src as i64 + JMP_PATCH_SIZE as i64);
    let rel: i32 = rel.try_into().ok()?;

    let mut bytes = [0xE9, 0, 0, 0, 0];
    bytes[1..].copy_from_slice(&rel.to_le_bytes());
    Some(bytes)
}

/// x86 has coherent instruction caches.
pub fn flush_icache(_ptr: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Check that the bytes for an emitted sequence match a hex string
    fn check_bytes<R>(bytes: &str, run: R)
    where
        R: FnOnce(&mut CodeBuf),
    {
        let mut buf = CodeBuf::new();
        run(&mut buf);
        let hex: String = buf.as_slice().iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, bytes);
    }

    #[test]
    #[cfg(not(windows))]
    fn test_reg_load() {
        check_bytes("488b5f08", |buf| emit_reg_load(buf, RBX, 1, true));
        check_bytes("4c8b6710", |buf| emit_reg_load(buf, R12, 2, true));
        check_bytes("8b4708", |buf| emit_reg_load(buf, RAX, 1, false));
        // greg 16 and up need a disp32
        check_bytes("488b9f80000000", |buf| emit_reg_load(buf, RBX, 16, true));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_reg_store() {
        check_bytes("48895f08", |buf| emit_reg_store(buf, RBX, 1, true));
        check_bytes("4c896710", |buf| emit_reg_store(buf, R12, 2, true));
        check_bytes("894708", |buf| emit_reg_store(buf, RAX, 1, false));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_pc_commit() {
        // add qword [rdi+0x100], 4
        check_bytes("4883870001000004", |buf| emit_pc_commit(buf, 4));
        // add qword [rdi+0x100], 0x1000
        check_bytes("4881870001000000100000", |buf| emit_pc_commit(buf, 0x1000));
    }

    #[test]
    fn test_push_pop() {
        check_bytes("53", |buf| emit_push(buf, RBX));
        check_bytes("4154", |buf| emit_push(buf, R12));
        check_bytes("5b", |buf| emit_pop(buf, RBX));
        check_bytes("415c", |buf| emit_pop(buf, R12));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_terminators() {
        check_bytes("c3", emit_ret);
        // jmp +0; ret
        check_bytes("e900000000c3", |buf| {
            assert_eq!(emit_jmp_placeholder(buf), 0);
        });
        // jmp qword [rdi+0x108]
        check_bytes("ffa708010000", emit_tail_jmp);
    }

    #[test]
    fn test_encode_jmp() {
        // Backward jump: dst == src encodes rel32 of -5
        assert_eq!(encode_jmp(0x1000, 0x1000), Some([0xE9, 0xFB, 0xFF, 0xFF, 0xFF]));
        // Forward jump over 11 bytes
        assert_eq!(encode_jmp(0x1000, 0x1010), Some([0xE9, 0x0B, 0x00, 0x00, 0x00]));
        // Out of rel32 range
        assert_eq!(encode_jmp(0, usize::MAX / 2), None);
    }

    #[test]
    fn vm_ptr_reg_is_not_allocatable() {
        assert_eq!(SCRATCH_REGS_MASK & bit(VM_PTR_REG), 0);
        assert_eq!(ABI_RECLAIM_REGS_MASK & bit(VM_PTR_REG), 0);
        assert_eq!(SCRATCH_REGS_MASK & ABI_RECLAIM_REGS_MASK, 0);
        assert_eq!((SCRATCH_REGS_MASK | ABI_RECLAIM_REGS_MASK) & bit(RSP), 0);
    }
}
