//! The executable code heap: append-only block storage, the published
//! block index keyed by guest physical PC, and the cross-block linker.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::backend;
use crate::virtualmem::{CodePtr, VirtualMem, WriteError};
use crate::JitError;

/// A published translation block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapBlock {
    /// Byte offset of the block's entry within the heap.
    pub offset: usize,

    /// Guest byte length of the instructions the block was compiled
    /// from, for dirty-range intersection.
    pub guest_len: u32,
}

/// Bump-allocated storage for translated blocks. Blocks are only ever
/// appended; invalidation is wholesale via [CodeHeap::flush].
pub struct CodeHeap {
    mem: VirtualMem,

    /// Bump cursor for the next block.
    curr: usize,

    /// Published blocks, keyed by guest physical PC.
    blocks: HashMap<u64, HeapBlock>,

    /// Unresolved direct-jump patch sites, keyed by the guest physical
    /// PC they branch toward.
    links: HashMap<u64, Vec<usize>>,
}

fn write_error(err: WriteError) -> JitError {
    match err {
        WriteError::OutOfBounds => JitError::CacheFull,
        WriteError::FailedPageMapping => JitError::HostOutOfMemory,
    }
}

impl CodeHeap {
    pub fn new(mem: VirtualMem) -> Self {
        Self {
            mem,
            curr: 0,
            blocks: HashMap::new(),
            links: HashMap::new(),
        }
    }

    /// Total heap capacity in bytes.
    pub fn size(&self) -> usize {
        self.mem.virtual_region_size()
    }

    /// Bytes consumed by appended blocks.
    pub fn used(&self) -> usize {
        self.curr
    }

    /// Address of a heap offset as a code pointer.
    pub fn code_ptr(&self, offset: usize) -> CodePtr {
        self.mem.start_ptr().add_bytes(offset)
    }

    /// Copy a finished block's code into the heap. Returns the offset
    /// of its entry, or [JitError::CacheFull] when it does not fit.
    pub fn append(&mut self, code: &[u8]) -> Result<usize, JitError> {
        if code.len() > self.size() - self.curr {
            return Err(JitError::CacheFull);
        }

        let offset = self.curr;
        self.mem
            .write_bytes(self.code_ptr(offset), code)
            .map_err(write_error)?;
        self.curr += code.len();

        trace!(offset, len = code.len(), "appended block code");
        Ok(offset)
    }

    pub fn lookup(&self, phys_pc: u64) -> Option<&HeapBlock> {
        self.blocks.get(&phys_pc)
    }

    /// Make a block visible to lookups.
    pub fn publish(&mut self, phys_pc: u64, block: HeapBlock) {
        self.blocks.insert(phys_pc, block);
    }

    /// Register an unresolved direct-jump site at heap offset
    /// `patch_off`, to be patched once a block for `target` exists.
    pub fn queue_link(&mut self, target: u64, patch_off: usize) {
        self.links.entry(target).or_default().push(patch_off);
    }

    /// Rewrite the jump at heap offset `site` to land on the block at
    /// `dest_off`. A displacement out of encoding range keeps the
    /// placeholder, which exits to the dispatch loop instead.
    pub fn patch_jump(&mut self, site: usize, dest_off: usize) -> Result<(), JitError> {
        let src = self.code_ptr(site).into_usize();
        let dst = self.code_ptr(dest_off).into_usize();
        match backend::encode_jmp(src, dst) {
            Some(patch) => {
                self.mem
                    .write_bytes(self.code_ptr(site), &patch)
                    .map_err(write_error)?;
                trace!(site, dest_off, "linked block jump");
            }
            None => {
                trace!(site, dest_off, "jump displacement out of range, left unlinked");
            }
        }
        Ok(())
    }

    /// Patch every queued jump toward `phys_pc` to land on the block at
    /// `dest_off`.
    pub fn resolve_links(&mut self, phys_pc: u64, dest_off: usize) -> Result<(), JitError> {
        let Some(sites) = self.links.remove(&phys_pc) else {
            return Ok(());
        };
        for site in sites {
            self.patch_jump(site, dest_off)?;
        }
        Ok(())
    }

    /// Seal the current write session and make the heap executable.
    pub fn finalize(&mut self) {
        self.mem.mark_all_executable();
        backend::flush_icache(self.mem.start_ptr().raw_ptr(), self.curr);
    }

    /// Drop every block, every published mapping and every pending
    /// link. Existing code bytes are simply abandoned and overwritten
    /// by subsequent appends.
    pub fn flush(&mut self) {
        debug!(used = self.curr, blocks = self.blocks.len(), "flushing code heap");
        self.curr = 0;
        self.blocks.clear();
        self.links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(size: usize) -> CodeHeap {
        CodeHeap::new(VirtualMem::new_dummy(size, 8))
    }

    #[test]
    fn append_bumps_offsets() {
        let mut heap = heap(4096);
        assert_eq!(heap.append(&[0xC3]), Ok(0));
        assert_eq!(heap.append(&[0x90, 0xC3]), Ok(1));
        assert_eq!(heap.used(), 3);
    }

    #[test]
    fn append_rejects_overflow() {
        let mut heap = heap(16);
        assert_eq!(heap.append(&[0; 12]), Ok(0));
        assert_eq!(heap.append(&[0; 8]), Err(JitError::CacheFull));
        // The failed append must not consume space
        assert_eq!(heap.used(), 12);
        assert_eq!(heap.append(&[0; 4]), Ok(12));
    }

    #[test]
    fn publish_then_lookup() {
        let mut heap = heap(4096);
        let block = HeapBlock { offset: 0x40, guest_len: 8 };
        heap.publish(0x8000_1000, block);

        assert_eq!(heap.lookup(0x8000_1000), Some(&block));
        assert_eq!(heap.lookup(0x8000_1004), None);
    }

    #[test]
    fn flush_forgets_everything() {
        let mut heap = heap(4096);
        heap.append(&[0xC3]).unwrap();
        heap.publish(0x1000, HeapBlock { offset: 0, guest_len: 4 });
        heap.queue_link(0x2000, 0);

        heap.flush();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.lookup(0x1000), None);
        // A re-resolve after the flush has nothing to patch
        heap.resolve_links(0x2000, 0).unwrap();
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn resolve_patches_queued_jumps() {
        let mut heap = heap(4096);

        // Predecessor: a 5-byte jmp placeholder at offset 0, then ret
        let pred = heap.append(&[0xE9, 0, 0, 0, 0, 0xC3]).unwrap();
        heap.queue_link(0x2000, pred);

        // Successor lands at offset 6
        let succ = heap.append(&[0xC3]).unwrap();
        heap.resolve_links(0x2000, succ).unwrap();

        // rel32 = dst - (src + 5) = 6 - 5 = 1
        let patched = unsafe {
            std::slice::from_raw_parts(heap.code_ptr(pred).raw_ptr(), 5)
        };
        assert_eq!(patched, [0xE9, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn resolve_patches_queued_jumps() {
        let mut heap = heap(4096);

        // Predecessor: a `b +4` placeholder falling through to ret
        let pred = heap
            .append(&[0x01, 0x00, 0x00, 0x14, 0xC0, 0x03, 0x5F, 0xD6])
            .unwrap();
        heap.queue_link(0x2000, pred);

        let succ = heap.append(&[0xC0, 0x03, 0x5F, 0xD6]).unwrap();
        heap.resolve_links(0x2000, succ).unwrap();

        // imm26 = (8 - 0) / 4 = 2
        let patched = unsafe {
            std::slice::from_raw_parts(heap.code_ptr(pred).raw_ptr(), 4)
        };
        assert_eq!(patched, [0x02, 0x00, 0x00, 0x14]);
    }
}
