//! A retargetable JIT core for RISC-V guests. Translated blocks are
//! keyed by guest physical PC, stored in an append-only executable
//! heap, chained together with patched direct jumps and invalidated
//! wholesale when guest code pages are written.
//!
//! The VM driving this crate owns instruction decoding and guest memory;
//! this crate owns host code emission, the block cache and the guest
//! register file mapping.

mod utils;
pub(crate) use utils::IntoUsize;

pub mod backend;
pub mod block;
pub mod heap;
pub mod memtracking;
pub mod regalloc;
pub mod virtualmem;

use thiserror::Error;
use tracing::debug;

use crate::backend::BlockFn;
use crate::block::BlockAssembler;
use crate::heap::{CodeHeap, HeapBlock};
use crate::memtracking::DirtyPages;
use crate::virtualmem::VirtualMem;

pub use crate::backend::VmState;
pub use crate::block::{Linkage, RegPurpose};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JitError {
    /// The host refused to hand out memory for the code heap.
    #[error("failed to reserve memory for the code heap")]
    HostOutOfMemory,

    /// The code heap has no room left for another block.
    #[error("code heap exhausted")]
    CacheFull,
}

/// One JIT instance: the code heap, the block under construction and
/// the guest-page dirtiness tracker. The VM creates one per hart group
/// sharing a block cache.
pub struct JitContext {
    heap: CodeHeap,
    asm: BlockAssembler,
    dirty: Option<DirtyPages>,
    rv64: bool,
}

impl JitContext {
    /// Create a context with `heap_size` bytes of code heap.
    pub fn new(heap_size: usize) -> Result<Self, JitError> {
        let mem = Self::reserve(heap_size)?;
        debug!(heap_size, "initialized JIT context");

        Ok(Self {
            heap: CodeHeap::new(mem),
            asm: BlockAssembler::new(),
            dirty: None,
            rv64: false,
        })
    }

    #[cfg(not(test))]
    fn reserve(heap_size: usize) -> Result<VirtualMem, JitError> {
        VirtualMem::system_reserve(heap_size)
    }

    #[cfg(test)]
    fn reserve(heap_size: usize) -> Result<VirtualMem, JitError> {
        // Tiny pages exercise the W^X page tracking without mmap
        Ok(VirtualMem::new_dummy(heap_size, 8))
    }

    /// Select the guest register width for subsequently compiled
    /// blocks. Takes effect at the next [Self::block_init].
    pub fn set_rv64(&mut self, rv64: bool) {
        self.rv64 = rv64;
    }

    /// Start compiling a block for the guest instruction at
    /// `phys_pc`/`virt_pc`.
    pub fn block_init(&mut self, phys_pc: u64, virt_pc: u64) {
        self.asm.begin(phys_pc, virt_pc, self.rv64);
    }

    /// Whether the block under construction has emitted any code. The
    /// VM skips finalization for blocks the emitters gave up on.
    pub fn block_nonempty(&self) -> bool {
        self.asm.nonempty()
    }

    /// The block under construction, for the opcode emitters.
    pub fn asm_mut(&mut self) -> &mut BlockAssembler {
        &mut self.asm
    }

    pub fn asm(&self) -> &BlockAssembler {
        &self.asm
    }

    /// Copy the finished block into the heap, publish it for lookup,
    /// patch predecessors branching to it and return its entry point.
    ///
    /// A full heap is flushed and the append retried once; None means
    /// the block cannot be placed (oversized, or its guest range was
    /// already written to) and the VM stays in the interpreter.
    pub fn block_finalize(&mut self) -> Option<BlockFn> {
        debug_assert!(self.asm.ended(), "finalizing a block without a terminator");

        if self.asm.aborted() {
            debug!(
                phys_pc = format_args!("{:#x}", self.asm.phys_pc()),
                "dropping aborted block"
            );
            return None;
        }

        let phys_pc = self.asm.phys_pc();
        let guest_len = self.asm.guest_len();

        // Refuse to publish a block whose source was dirtied while it
        // was being compiled
        if let Some(dirty) = &self.dirty {
            if dirty.intersects(phys_pc, guest_len as u64) {
                debug!(phys_pc = format_args!("{phys_pc:#x}"), "dropping block, source dirtied");
                return None;
            }
        }

        let offset = match self.heap.append(self.asm.code()) {
            Ok(offset) => offset,
            Err(JitError::CacheFull) => {
                self.flush_cache();
                match self.heap.append(self.asm.code()) {
                    Ok(offset) => offset,
                    Err(err) => {
                        debug!(%err, phys_pc = format_args!("{phys_pc:#x}"), "dropping block");
                        return None;
                    }
                }
            }
            Err(err) => {
                debug!(%err, phys_pc = format_args!("{phys_pc:#x}"), "dropping block");
                return None;
            }
        };

        // Backward branches can be patched right away; forward ones wait
        // for their target to be published
        for link in self.asm.links() {
            let site = offset + link.patch_off;
            match self.heap.lookup(link.target).copied() {
                Some(target) => {
                    if self.heap.patch_jump(site, target.offset).is_err() {
                        return None;
                    }
                }
                None => self.heap.queue_link(link.target, site),
            }
        }
        self.heap.publish(phys_pc, HeapBlock { offset, guest_len });

        // Patching before sealing: the write session is still open
        if self.heap.resolve_links(phys_pc, offset).is_err() {
            return None;
        }
        self.heap.finalize();

        debug!(
            phys_pc = format_args!("{phys_pc:#x}"),
            offset,
            len = self.asm.code().len(),
            "published block"
        );
        Some(self.block_fn(offset))
    }

    /// Find the published block for `phys_pc`. A hit on a block whose
    /// guest range has been written to flushes the whole cache and
    /// misses.
    pub fn block_lookup(&mut self, phys_pc: u64) -> Option<BlockFn> {
        let block = *self.heap.lookup(phys_pc)?;

        if let Some(dirty) = &self.dirty {
            if dirty.intersects(phys_pc, block.guest_len as u64) {
                self.flush_cache();
                return None;
            }
        }

        Some(self.block_fn(block.offset))
    }

    /// Enable guest-page write tracking over `guest_mem_size` bytes of
    /// guest physical memory. Without it, cache coherence is entirely
    /// the VM's problem.
    pub fn init_memtracking(&mut self, guest_mem_size: u64) {
        self.dirty = Some(DirtyPages::new(guest_mem_size));
    }

    /// Report a guest physical memory write. No-op unless tracking was
    /// enabled.
    pub fn mark_dirty_mem(&mut self, addr: u64, len: u64) {
        if let Some(dirty) = &mut self.dirty {
            dirty.mark(addr, len);
        }
    }

    /// Throw away every translated block. Previously returned block
    /// pointers become stale; the VM must not re-enter them.
    pub fn flush_cache(&mut self) {
        self.heap.flush();
        if let Some(dirty) = &mut self.dirty {
            dirty.clear();
        }
    }

    fn block_fn(&self, offset: usize) -> BlockFn {
        let ptr = self.heap.code_ptr(offset).raw_ptr();
        // Callers only run these pointers outside a write session; the
        // heap seals itself executable in block_finalize
        unsafe { std::mem::transmute::<*const u8, BlockFn>(ptr) }
    }
}
