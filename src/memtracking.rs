//! Dirty guest-memory tracking for transparent translation-cache
//! invalidation.
//!
//! One bit per page-sized region of guest physical memory. The bitmap is
//! power-of-two sized and addresses wrap by [DirtyPages::mask], so it acts
//! like a direct-mapped shadow of guest memory: aliasing can only cause
//! extra, conservative invalidations, never missed ones.

type Entry = u32;

const ENTRY_NUM_BITS: usize = Entry::BITS as usize;

/// Guest page granularity for dirty tracking.
pub const PAGE_SIZE: u64 = 4096;

pub struct DirtyPages {
    entries: Vec<Entry>,

    /// `entries.len() * 32 - 1`, used to wrap page indices.
    mask: u64,

    /// Whether any page has been marked since the last clear. Lets lookups
    /// skip the bitmap scan entirely on the common clean path.
    any_dirty: bool,
}

impl DirtyPages {
    /// Build a tracker covering `guest_mem_size` bytes of guest physical
    /// memory.
    pub fn new(guest_mem_size: u64) -> Self {
        let pages = (guest_mem_size / PAGE_SIZE).max(1).next_power_of_two();
        let num_entries = (pages as usize).div_ceil(ENTRY_NUM_BITS).next_power_of_two();

        Self {
            entries: vec![0; num_entries],
            mask: (num_entries as u64 * ENTRY_NUM_BITS as u64) - 1,
            any_dirty: false,
        }
    }

    fn page_bit(&self, addr: u64) -> (usize, u32) {
        let page = (addr / PAGE_SIZE) & self.mask;
        let entry_idx = (page as usize) / ENTRY_NUM_BITS;
        let bit_idx = (page as usize) % ENTRY_NUM_BITS;
        (entry_idx, 1 << bit_idx)
    }

    /// Mark every page overlapping `[addr, addr + len)` dirty.
    pub fn mark(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = addr / PAGE_SIZE;
        let last = addr.saturating_add(len - 1) / PAGE_SIZE;
        if last - first >= self.mask {
            // Range covers the whole (wrapped) bitmap
            self.entries.fill(!0);
        } else {
            for page in first..=last {
                let (entry_idx, bit) = self.page_bit(page * PAGE_SIZE);
                self.entries[entry_idx] |= bit;
            }
        }
        self.any_dirty = true;
    }

    /// Whether any page overlapping `[addr, addr + len)` has been marked
    /// since the last [Self::clear].
    pub fn intersects(&self, addr: u64, len: u64) -> bool {
        if !self.any_dirty {
            return false;
        }
        let first = addr / PAGE_SIZE;
        let last = addr.saturating_add(len.max(1) - 1) / PAGE_SIZE;
        if last - first >= self.mask {
            // Range covers the whole (wrapped) bitmap and we know
            // something is dirty
            return true;
        }
        for page in first..=last {
            let (entry_idx, bit) = self.page_bit(page * PAGE_SIZE);
            if self.entries[entry_idx] & bit != 0 {
                return true;
            }
        }
        false
    }

    /// Reset all dirty bits. Done on full cache flush, not per block.
    pub fn clear(&mut self) {
        if self.any_dirty {
            self.entries.fill(0);
            self.any_dirty = false;
        }
    }
}
