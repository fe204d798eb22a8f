//! Guest-to-host register allocation state.
//!
//! Pure bookkeeping lives here: descriptors for the 32 guest GPRs, the
//! free-pool bitmask and the LRU clock. Operations that have to emit
//! host code (loads, spills, callee-saved saves) drive this state from
//! the block assembler.

use bitflags::bitflags;

use crate::backend::{self, HostReg};

/// Number of guest general-purpose registers.
pub const GUEST_REGS: usize = 32;

/// Guest register x0: reads as constant zero, writes are discarded.
/// Never assigned a host register.
pub const REGISTER_ZERO: u8 = 0;

bitflags! {
    /// Allocation details for one guest register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RegFlags: u8 {
        /// The host register value diverges from the in-memory VM copy;
        /// a store is owed at spill or block end.
        const DIRTY = 1;
        /// The host register value mirrors the in-memory VM copy.
        const LOADED = 2;
        /// `auipc_off` holds a foldable PC-relative immediate.
        const AUIPC = 4;
    }
}

/// Per-guest-register descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegInfo {
    /// Last use of this mapping, for LRU reclaim.
    pub last_used: usize,

    /// Pending AUIPC immediate, valid while [RegFlags::AUIPC] is set.
    pub auipc_off: i32,

    /// Claimed host register, None if not mapped.
    pub hreg: Option<HostReg>,

    pub flags: RegFlags,
}

/// Allocation state for one block under construction.
pub struct RegAlloc {
    pub regs: [RegInfo; GUEST_REGS],

    /// Bitmask of host registers currently free for allocation.
    pub hreg_mask: u32,

    /// Bitmask of callee-saved host registers the block has reclaimed
    /// and must restore in the epilogue.
    pub abireclaim_mask: u32,

    /// Reclaimed callee-saved registers in save order, for the reverse
    /// restore sequence.
    pub reclaimed: Vec<HostReg>,

    /// Monotone per-block counter feeding `last_used`.
    clock: usize,
}

impl RegAlloc {
    pub fn new() -> Self {
        Self {
            regs: [RegInfo::default(); GUEST_REGS],
            hreg_mask: backend::SCRATCH_REGS_MASK,
            abireclaim_mask: 0,
            reclaimed: Vec::new(),
            clock: 0,
        }
    }

    /// Reset to the block-entry state: nothing mapped, the full ABI-free
    /// pool available.
    pub fn reset(&mut self) {
        self.regs = [RegInfo::default(); GUEST_REGS];
        self.hreg_mask = backend::SCRATCH_REGS_MASK;
        self.abireclaim_mask = 0;
        self.reclaimed.clear();
        self.clock = 0;
    }

    /// Claim any free host register. None iff the pool is exhausted.
    pub fn try_claim(&mut self) -> Option<HostReg> {
        if self.hreg_mask == 0 {
            return None;
        }
        let hreg = self.hreg_mask.trailing_zeros() as HostReg;
        self.hreg_mask &= !(1 << hreg);
        Some(hreg)
    }

    /// Release an explicitly claimed host register.
    pub fn free(&mut self, hreg: HostReg) {
        debug_assert_eq!(self.hreg_mask & (1 << hreg), 0, "double free of host register");
        self.hreg_mask |= 1 << hreg;
    }

    /// Pick a callee-saved register not yet reclaimed by this block, if
    /// any remain.
    pub fn take_abi_reclaimable(&mut self) -> Option<HostReg> {
        let available = backend::ABI_RECLAIM_REGS_MASK & !self.abireclaim_mask;
        if available == 0 {
            return None;
        }
        let hreg = available.trailing_zeros() as HostReg;
        self.abireclaim_mask |= 1 << hreg;
        self.reclaimed.push(hreg);
        Some(hreg)
    }

    /// The mapped guest register with the smallest `last_used`.
    pub fn lru_victim(&self) -> Option<u8> {
        self.regs
            .iter()
            .enumerate()
            .filter(|(_, info)| info.hreg.is_some())
            .min_by_key(|(_, info)| info.last_used)
            .map(|(greg, _)| greg as u8)
    }

    /// Bump a mapping's LRU position. Done on every access, not just on
    /// claim.
    pub fn touch(&mut self, greg: u8) {
        self.clock += 1;
        self.regs[greg as usize].last_used = self.clock;
    }

    pub fn mapped_count(&self) -> usize {
        self.regs.iter().filter(|info| info.hreg.is_some()).count()
    }

    /// Record a pending AUIPC immediate for `greg`, for folding into a
    /// later use instead of materializing it.
    pub fn set_auipc_off(&mut self, greg: u8, off: i32) {
        let info = &mut self.regs[greg as usize];
        info.auipc_off = off;
        info.flags.insert(RegFlags::AUIPC);
    }

    /// The pending AUIPC immediate for `greg`, if still valid.
    pub fn auipc_off(&self, greg: u8) -> Option<i32> {
        let info = &self.regs[greg as usize];
        info.flags.contains(RegFlags::AUIPC).then_some(info.auipc_off)
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}
