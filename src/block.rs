//! Per-block code assembly: the growable emission buffer, guest PC
//! tracking, outgoing-link bookkeeping and the emission half of the
//! register allocator.

use tracing::warn;

use crate::backend::{self, HostReg};
use crate::regalloc::{RegAlloc, RegFlags, RegInfo, GUEST_REGS, REGISTER_ZERO};

/// Growable buffer host instructions are assembled into before the
/// block is copied into the code heap.
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn grow_for(&mut self, len: usize) {
        let free = self.bytes.capacity() - self.bytes.len();
        if free < len {
            // Geometric growth with a 1 KiB minimum step
            self.bytes.reserve(len.max(self.bytes.capacity()).max(1024));
        }
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.grow_for(1);
        self.bytes.push(byte);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.grow_for(bytes.len());
        self.bytes.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for CodeBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of control transfer emitted at a block's exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Return to the VM dispatch loop after committing the guest PC.
    None,
    /// Tail-jump through the VM trampoline; the next guest PC is dynamic.
    Tail,
    /// Direct jump toward a specific successor guest physical PC,
    /// patched by the linker once that block exists.
    Jmp(u64),
}

/// How an emitter is about to use a guest register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegPurpose {
    Read,
    Write,
    ReadWrite,
}

impl RegPurpose {
    fn reads(self) -> bool {
        matches!(self, RegPurpose::Read | RegPurpose::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, RegPurpose::Write | RegPurpose::ReadWrite)
    }
}

/// An unresolved direct branch out of this block.
#[derive(Clone, Copy, Debug)]
pub struct OutgoingLink {
    /// Guest physical PC of the successor block.
    pub target: u64,
    /// Offset of the patchable jump within this block's code.
    pub patch_off: usize,
}

/// State for the block currently being compiled. One live at a time per
/// JIT context.
pub struct BlockAssembler {
    code: CodeBuf,
    pub(crate) regs: RegAlloc,
    links: Vec<OutgoingLink>,

    /// Guest virtual PC of the next instruction being compiled.
    virt_pc: u64,

    /// Guest physical PC of the block's entry; the lookup key.
    phys_pc: u64,

    /// Accumulated guest byte length of instructions emitted so far.
    /// Committed to the VM PC slot once at block end instead of per
    /// instruction.
    pc_off: i32,

    rv64: bool,
    ended: bool,

    /// The block ran out of host registers with nothing left to evict.
    /// Its code must be discarded instead of finalized.
    aborted: bool,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self {
            code: CodeBuf::new(),
            regs: RegAlloc::new(),
            links: Vec::new(),
            virt_pc: 0,
            phys_pc: 0,
            pc_off: 0,
            rv64: false,
            ended: false,
            aborted: false,
        }
    }

    /// Reset for a new block and emit the prologue.
    pub fn begin(&mut self, phys_pc: u64, virt_pc: u64, rv64: bool) {
        self.code.clear();
        self.regs.reset();
        self.links.clear();
        self.virt_pc = virt_pc;
        self.phys_pc = phys_pc;
        self.pc_off = 0;
        self.rv64 = rv64;
        self.ended = false;
        self.aborted = false;
        self.emit_init();
    }

    /// Emit the block prologue: establish the VM state pointer per the
    /// active ABI.
    pub fn emit_init(&mut self) {
        backend::emit_prologue(&mut self.code);
    }

    /// Append raw host instruction bytes.
    pub fn put_code(&mut self, bytes: &[u8]) {
        self.code.push_bytes(bytes);
    }

    /// Account for one just-decoded guest instruction. Opcode emitters
    /// call this once per instruction.
    pub fn advance_pc(&mut self, guest_bytes: u32) {
        self.pc_off += guest_bytes as i32;
        self.virt_pc += guest_bytes as u64;
    }

    /// Record an outgoing direct branch to be patched by the linker.
    pub fn record_link(&mut self, target: u64, patch_off: usize) {
        self.links.push(OutgoingLink { target, patch_off });
    }

    /// Claim any free host register without emitting code. None iff the
    /// pool is exhausted.
    pub fn try_claim_hreg(&mut self) -> Option<HostReg> {
        self.regs.try_claim()
    }

    /// Claim any free host register, reclaiming a mapped one if the
    /// pool is exhausted. Never fails.
    pub fn claim_hreg(&mut self) -> HostReg {
        match self.regs.try_claim() {
            Some(hreg) => hreg,
            None => self.reclaim_hreg(),
        }
    }

    /// Release an explicitly claimed host register.
    pub fn free_hreg(&mut self, hreg: HostReg) {
        self.regs.free(hreg);
    }

    /// Free up a host register when the pool is exhausted. Prefers
    /// grabbing an unused callee-saved register (saved here, restored
    /// in the epilogue) over spilling; falls back to evicting the least
    /// recently used guest mapping, spilling its value if dirty.
    pub fn reclaim_hreg(&mut self) -> HostReg {
        if let Some(hreg) = self.regs.take_abi_reclaimable() {
            backend::emit_push(&mut self.code, hreg);
            return hreg;
        }

        // An exhausted pool with nothing mapped means the emitters
        // claimed every register as a temporary; nothing can be evicted,
        // so give up on this block and let the VM interpret it
        let Some(greg) = self.regs.lru_victim() else {
            warn!("host register pool exhausted with nothing to evict, aborting block");
            self.aborted = true;
            return backend::VM_PTR_REG;
        };
        let info = self.regs.regs[greg as usize];
        let Some(hreg) = info.hreg else {
            self.aborted = true;
            return backend::VM_PTR_REG;
        };

        if info.flags.contains(RegFlags::DIRTY) {
            backend::emit_reg_store(&mut self.code, hreg, greg, self.rv64);
        }
        self.regs.regs[greg as usize] = RegInfo::default();
        hreg
    }

    /// Map a guest register to a host register for the given purpose,
    /// loading it from the VM state when a read needs it. Returns the
    /// existing mapping when there is one.
    pub fn map_reg(&mut self, greg: u8, purpose: RegPurpose) -> HostReg {
        debug_assert_ne!(greg, REGISTER_ZERO, "x0 is never mapped");

        let hreg = match self.regs.regs[greg as usize].hreg {
            Some(hreg) => hreg,
            None => {
                let hreg = self.claim_hreg();
                let info = &mut self.regs.regs[greg as usize];
                info.hreg = Some(hreg);
                info.flags = RegFlags::empty();
                hreg
            }
        };

        if purpose.writes() {
            // A write invalidates any pending AUIPC fold
            self.regs.regs[greg as usize].flags.remove(RegFlags::AUIPC);
        }

        let flags = self.regs.regs[greg as usize].flags;
        if purpose.reads() && !flags.intersects(RegFlags::LOADED | RegFlags::DIRTY) {
            backend::emit_reg_load(&mut self.code, hreg, greg, self.rv64);
            self.regs.regs[greg as usize].flags.insert(RegFlags::LOADED);
        }
        if purpose.writes() {
            self.regs.regs[greg as usize].flags.insert(RegFlags::DIRTY);
        }

        self.regs.touch(greg);
        hreg
    }

    /// Record a pending AUIPC immediate for `greg`.
    pub fn set_auipc_off(&mut self, greg: u8, off: i32) {
        self.regs.set_auipc_off(greg, off);
    }

    /// The pending AUIPC immediate for `greg`, if still valid.
    pub fn auipc_off(&self, greg: u8) -> Option<i32> {
        self.regs.auipc_off(greg)
    }

    /// Store every dirty guest register back to the VM state and drop
    /// all mappings, returning the pool to its block-entry state.
    fn flush_mappings(&mut self) {
        for greg in 0..GUEST_REGS as u8 {
            let info = self.regs.regs[greg as usize];
            if let Some(hreg) = info.hreg {
                if info.flags.contains(RegFlags::DIRTY) {
                    backend::emit_reg_store(&mut self.code, hreg, greg, self.rv64);
                }
                self.regs.regs[greg as usize] = RegInfo::default();
            }
        }
        self.regs.hreg_mask = backend::SCRATCH_REGS_MASK;
    }

    /// Flush mappings, restore reclaimed callee-saved registers, commit
    /// the accumulated PC offset and emit the chosen terminator.
    pub fn emit_end(&mut self, linkage: Linkage) {
        debug_assert!(!self.ended, "emit_end called twice");

        self.flush_mappings();

        let reclaimed = std::mem::take(&mut self.regs.reclaimed);
        for &hreg in reclaimed.iter().rev() {
            backend::emit_pop(&mut self.code, hreg);
        }
        self.regs.abireclaim_mask = 0;

        if self.pc_off != 0 {
            backend::emit_pc_commit(&mut self.code, self.pc_off);
        }

        match linkage {
            Linkage::None => backend::emit_ret(&mut self.code),
            Linkage::Tail => backend::emit_tail_jmp(&mut self.code),
            Linkage::Jmp(target) => {
                let patch_off = backend::emit_jmp_placeholder(&mut self.code);
                self.record_link(target, patch_off);
            }
        }

        self.ended = true;
    }

    pub fn nonempty(&self) -> bool {
        !self.code.is_empty()
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn code(&self) -> &[u8] {
        self.code.as_slice()
    }

    pub fn phys_pc(&self) -> u64 {
        self.phys_pc
    }

    pub fn virt_pc(&self) -> u64 {
        self.virt_pc
    }

    pub fn pc_off(&self) -> i32 {
        self.pc_off
    }

    /// Guest byte length of the block, for dirty-page intersection.
    pub fn guest_len(&self) -> u32 {
        self.pc_off as u32
    }

    pub fn links(&self) -> &[OutgoingLink] {
        &self.links
    }
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn begun() -> BlockAssembler {
        let mut block = BlockAssembler::new();
        block.begin(0x1000, 0x1000, true);
        block
    }

    #[test]
    fn code_buf_grows_by_at_least_one_kib() {
        let mut buf = CodeBuf::new();
        buf.push_byte(0x90);
        assert!(buf.bytes.capacity() >= 1024);
        assert_eq!(buf.as_slice(), &[0x90]);
    }

    #[test]
    fn advance_pc_accumulates_guest_bytes() {
        let mut block = begun();
        block.advance_pc(4);
        block.advance_pc(2); // compressed instruction
        assert_eq!(block.pc_off(), 6);
        assert_eq!(block.virt_pc(), 0x1006);
    }

    #[test]
    fn map_reg_reuses_existing_mapping() {
        let mut block = begun();
        let first = block.map_reg(5, RegPurpose::Write);
        let len_after_first = block.code().len();
        let second = block.map_reg(5, RegPurpose::ReadWrite);

        assert_eq!(first, second);
        // The second mapping must not emit a reload: the value is
        // already live (and dirty) in the host register.
        assert_eq!(block.code().len(), len_after_first);
    }

    #[test]
    fn map_reg_for_read_emits_exactly_one_load() {
        let mut block = begun();
        let before = block.code().len();
        block.map_reg(7, RegPurpose::Read);
        let after_first = block.code().len();
        assert!(after_first > before);

        block.map_reg(7, RegPurpose::Read);
        assert_eq!(block.code().len(), after_first);
    }

    #[test]
    fn emit_end_unmaps_everything() {
        let mut block = begun();
        for greg in 1..8u8 {
            block.map_reg(greg, RegPurpose::ReadWrite);
        }
        block.advance_pc(4 * 7);
        block.emit_end(Linkage::None);

        assert_eq!(block.regs.mapped_count(), 0);
        assert_eq!(block.regs.hreg_mask, crate::backend::SCRATCH_REGS_MASK);
        assert_eq!(block.regs.abireclaim_mask, 0);
        assert!(block.ended());
    }

    #[test]
    fn write_invalidates_auipc_fold() {
        let mut block = begun();
        block.map_reg(3, RegPurpose::Write);
        block.set_auipc_off(3, 0x2000);
        assert_eq!(block.auipc_off(3), Some(0x2000));

        block.map_reg(3, RegPurpose::Write);
        assert_eq!(block.auipc_off(3), None);
    }

    #[test]
    fn jmp_linkage_records_an_outgoing_link() {
        let mut block = begun();
        block.advance_pc(4);
        block.emit_end(Linkage::Jmp(0x2000));

        assert_eq!(block.links().len(), 1);
        assert_eq!(block.links()[0].target, 0x2000);
        assert!(block.links()[0].patch_off < block.code().len());
    }

    #[test]
    fn register_pressure_reclaims_callee_saved_then_spills() {
        let mut block = begun();
        let scratch = crate::backend::SCRATCH_REGS_MASK.count_ones() as u8;
        let reclaimable = crate::backend::ABI_RECLAIM_REGS_MASK.count_ones() as u8;

        // Map more guest registers than there are scratch host registers:
        // the overflow claims callee-saved registers (with saves emitted).
        for greg in 1..=(scratch + reclaimable) {
            block.map_reg(greg, RegPurpose::Write);
        }
        assert_eq!(block.regs.abireclaim_mask, crate::backend::ABI_RECLAIM_REGS_MASK);
        assert_eq!(block.regs.mapped_count(), (scratch + reclaimable) as usize);

        // One more forces an LRU spill: greg 1 is the oldest mapping and
        // must lose its host register to the newcomer.
        let len_before = block.code().len();
        let newcomer = block.map_reg(31, RegPurpose::Write);
        assert!(block.code().len() > len_before, "dirty spill must emit a store");
        assert!(block.regs.regs[1].hreg.is_none());
        assert_eq!(block.regs.regs[31].hreg, Some(newcomer));

        // A later read of the spilled register reloads it
        let len_before = block.code().len();
        block.map_reg(1, RegPurpose::Read);
        assert!(block.code().len() > len_before, "spilled register must be reloaded");
    }

    #[test]
    fn exhausted_pool_with_nothing_mapped_aborts() {
        let mut block = begun();

        // Drain the scratch pool with bare claims (no guest mappings),
        // then force the callee-saved reclaim pool dry as well
        while block.try_claim_hreg().is_some() {}
        for _ in 0..crate::backend::ABI_RECLAIM_REGS_MASK.count_ones() {
            block.reclaim_hreg();
        }
        assert!(!block.aborted());

        // Nothing is mapped, so there is no LRU victim left to evict
        block.reclaim_hreg();
        assert!(block.aborted());

        // The state survives emit_end without panicking
        block.emit_end(Linkage::None);
        assert!(block.aborted());
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    #[cfg(not(windows))]
    fn single_block_bytes() {
        use crate::backend::x86_64::*;

        // One mapped write, one guest instruction, NONE terminator:
        //   mov rax, <imm emitted by caller>  (not part of this test)
        //   mov [rdi+8], rax      spill of dirty x1
        //   add qword [rdi+256], 4
        //   ret
        let mut block = begun();
        let hreg = block.map_reg(1, RegPurpose::Write);
        assert_eq!(hreg, RAX);
        block.advance_pc(4);
        block.emit_end(Linkage::None);

        assert_eq!(
            block.code(),
            [
                0x48, 0x89, 0x47, 0x08, // mov [rdi+8], rax
                0x48, 0x83, 0x87, 0x00, 0x01, 0x00, 0x00, 0x04, // add qword [rdi+256], 4
                0xC3, // ret
            ]
        );
    }

    proptest! {
        // No two distinct guest registers are ever simultaneously
        // assigned the same host register.
        #[test]
        fn mappings_stay_disjoint(ops in proptest::collection::vec((1u8..32, 0u8..3), 1..64)) {
            let mut block = begun();
            for (greg, purpose) in ops {
                let purpose = match purpose {
                    0 => RegPurpose::Read,
                    1 => RegPurpose::Write,
                    _ => RegPurpose::ReadWrite,
                };
                block.map_reg(greg, purpose);

                let mut seen = std::collections::HashSet::new();
                for info in &block.regs.regs {
                    if let Some(hreg) = info.hreg {
                        prop_assert!(seen.insert(hreg), "host register double-mapped");
                        prop_assert_eq!(block.regs.hreg_mask & (1 << hreg), 0);
                    }
                }
            }
        }

        // claim_hreg never fails, whatever the pool state.
        #[test]
        fn claim_always_succeeds(extra_claims in 1usize..48) {
            let mut block = begun();
            for greg in 1..32u8 {
                block.map_reg(greg, RegPurpose::Write);
            }
            for _ in 0..extra_claims {
                let hreg = block.claim_hreg();
                block.free_hreg(hreg);
            }
        }
    }
}
