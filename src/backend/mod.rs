//! Host-architecture backends.
//!
//! One backend is selected at build time based on the host. Each module
//! exports the same surface (register pools, prologue/epilogue emission,
//! guest-GPR load/store, branch-displacement encoding) so the core never
//! dispatches at runtime.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("no JIT backend for this host architecture");

/// Host register id. Meaning is backend-specific.
pub type HostReg = u8;

/// Signature of a generated block. The VM state pointer arrives in the
/// host ABI's first integer argument register and stays there for the
/// whole block.
pub type BlockFn = unsafe extern "C" fn(*mut VmState);

/// Layout contract between the emitters and the embedding VM. Generated
/// code hard-codes these offsets, so the register file and PC slot must
/// stay at fixed positions.
#[repr(C)]
pub struct VmState {
    /// Guest general-purpose register file. x0 is present but generated
    /// code never reads or writes it.
    pub gregs: [u64; 32],

    /// Current guest program counter.
    pub pc: u64,

    /// Dispatch trampoline the TAIL terminator jumps through when the
    /// next guest PC is dynamic. Entered with the VM state pointer still
    /// in the argument register.
    pub trampoline: *const u8,
}

impl VmState {
    pub fn new() -> Self {
        Self { gregs: [0; 32], pc: 0, trampoline: std::ptr::null() }
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offset of a guest GPR slot within [VmState].
pub(crate) const fn greg_off(greg: u8) -> i32 {
    greg as i32 * 8
}

/// Byte offset of the PC slot within [VmState].
pub(crate) const VM_PC_OFF: i32 = 32 * 8;

/// Byte offset of the trampoline slot within [VmState].
pub(crate) const VM_TRAMPOLINE_OFF: i32 = VM_PC_OFF + 8;

const _: () = {
    assert!(std::mem::offset_of!(VmState, gregs) == 0);
    assert!(std::mem::offset_of!(VmState, pc) == VM_PC_OFF as usize);
    assert!(std::mem::offset_of!(VmState, trampoline) == VM_TRAMPOLINE_OFF as usize);
};
