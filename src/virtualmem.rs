//! Memory management for the JIT code heap. Deals with virtual memory.

use std::ptr::NonNull;

use crate::IntoUsize;

#[cfg(not(test))]
pub type VirtualMem = VirtualMemory<sys::SystemAllocator>;

#[cfg(test)]
pub type VirtualMem = VirtualMemory<tests::TestingAllocator>;

/// Memory for generated executable machine code. We reserve address space for
/// the entire code heap upfront and map physical memory into the reserved
/// address space as needed. On Linux, this is done with an `mmap` with
/// `PROT_NONE` upfront and gradually using `mprotect` with
/// `PROT_READ|PROT_WRITE` as needed.
///
/// This handles ["W^X"](https://en.wikipedia.org/wiki/W%5EX) semi-automatically.
/// Writes are always accepted and once a write session is over a call to
/// [Self::mark_all_executable] makes the region executable.
pub struct VirtualMemory<A: Allocator> {
    /// Location of the virtual memory region.
    region_start: NonNull<u8>,

    /// Size of the region in bytes.
    region_size_bytes: usize,

    /// Number of bytes per "page", memory protection permission can only be
    /// controlled at this granularity.
    page_size_bytes: usize,

    /// Number of bytes that we have allocated physical memory for starting at
    /// [Self::region_start].
    mapped_region_bytes: usize,

    /// Keep track of the address of the last written to page.
    /// Used for changing protection to implement W^X.
    current_write_page: Option<usize>,

    /// Zero size member for making syscalls to get physical memory during
    /// normal operation. When testing this owns some memory.
    allocator: A,
}

/// Groups together the syscalls to get new physical memory and to change
/// memory protection. See [VirtualMemory] for details.
pub trait Allocator {
    #[must_use]
    fn mark_writable(&mut self, ptr: *const u8, size: u32) -> bool;

    fn mark_executable(&mut self, ptr: *const u8, size: u32);
}

/// Pointer into a [VirtualMemory].
/// Note: there is no NULL constant for CodePtr. You should use
/// `Option<CodePtr>` instead.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Debug)]
#[repr(C, packed)]
pub struct CodePtr(NonNull<u8>);

/// Errors that can happen when writing to [VirtualMemory]
#[derive(Debug, PartialEq)]
pub enum WriteError {
    OutOfBounds,
    FailedPageMapping,
}

use WriteError::*;

impl<A: Allocator> VirtualMemory<A> {
    /// Bring a part of the address space under management.
    pub fn new(
        allocator: A,
        page_size: u32,
        virt_region_start: NonNull<u8>,
        size_bytes: usize,
    ) -> Self {
        assert_ne!(0, page_size);
        let page_size_bytes = page_size.as_usize();

        Self {
            region_start: virt_region_start,
            region_size_bytes: size_bytes,
            page_size_bytes,
            mapped_region_bytes: 0,
            current_write_page: None,
            allocator,
        }
    }

    /// Return the start of the region as a raw pointer. Note that it could be
    /// a dangling pointer so be careful dereferencing it.
    pub fn start_ptr(&self) -> CodePtr {
        CodePtr(self.region_start)
    }

    /// Size of the region in bytes where writes could be attempted.
    pub fn virtual_region_size(&self) -> usize {
        self.region_size_bytes
    }

    /// Write a single byte. The first write to a page makes it writable.
    pub fn write_byte(&mut self, write_ptr: CodePtr, byte: u8) -> Result<(), WriteError> {
        let page_size = self.page_size_bytes;
        let raw: *mut u8 = write_ptr.raw_ptr() as *mut u8;
        let page_addr = (raw as usize / page_size) * page_size;

        if self.current_write_page == Some(page_addr) {
            // Writing within the last written to page, nothing to do
        } else {
            // Switching to a different and potentially new page
            let start = self.region_start.as_ptr();
            let mapped_region_end = start.wrapping_add(self.mapped_region_bytes);
            let whole_region_end = start.wrapping_add(self.region_size_bytes);
            let alloc = &mut self.allocator;

            assert!((start..=whole_region_end).contains(&mapped_region_end));

            if (start..mapped_region_end).contains(&raw) {
                // Writing to a previously written to page.
                // Need to make the page writable, but no need to fill.
                let page_size: u32 = page_size.try_into().unwrap();
                if !alloc.mark_writable(page_addr as *const _, page_size) {
                    return Err(FailedPageMapping);
                }

                self.current_write_page = Some(page_addr);
            } else if (start..whole_region_end).contains(&raw) {
                // Writing to a brand new page
                let mapped_region_end_addr = mapped_region_end as usize;
                let alloc_size = page_addr - mapped_region_end_addr + page_size;

                assert_eq!(0, alloc_size % page_size, "allocation size should be page aligned");
                assert_eq!(0, mapped_region_end_addr % page_size, "pointer should be page aligned");

                // Allocate new chunk
                let alloc_size_u32: u32 = alloc_size.try_into().unwrap();
                unsafe {
                    if !alloc.mark_writable(mapped_region_end.cast(), alloc_size_u32) {
                        return Err(FailedPageMapping);
                    }
                    if cfg!(target_arch = "x86_64") {
                        // Fill new memory with PUSH DS (0x1E) so that executing
                        // uninitialized memory faults with #UD in 64-bit mode.
                        std::slice::from_raw_parts_mut(mapped_region_end, alloc_size).fill(0x1E);
                    } else if cfg!(target_arch = "aarch64") {
                        // In aarch64, all zeros encodes UDF, so it's already
                        // what we want.
                    }
                }
                self.mapped_region_bytes += alloc_size;

                self.current_write_page = Some(page_addr);
            } else {
                return Err(OutOfBounds);
            }
        }

        // We have permission to write if we get here
        unsafe { raw.write(byte) };

        Ok(())
    }

    /// Write a slice of bytes starting at `write_ptr`.
    pub fn write_bytes(&mut self, write_ptr: CodePtr, bytes: &[u8]) -> Result<(), WriteError> {
        for (idx, byte) in bytes.iter().enumerate() {
            self.write_byte(write_ptr.add_bytes(idx), *byte)?;
        }
        Ok(())
    }

    /// Make all the code in the region executable. Call this at the end of a
    /// write session. See [Self] for the usual usage flow.
    pub fn mark_all_executable(&mut self) {
        self.current_write_page = None;

        let region_start = self.region_start;
        let mapped_region_bytes: u32 = self.mapped_region_bytes.try_into().unwrap();

        // Make the mapped region executable
        self.allocator
            .mark_executable(region_start.as_ptr(), mapped_region_bytes);
    }
}

impl CodePtr {
    /// Note that the raw pointer might be dangling if there hasn't been any
    /// writes to it through the [VirtualMemory] yet.
    pub fn raw_ptr(self) -> *const u8 {
        let CodePtr(ptr) = self;
        ptr.as_ptr()
    }

    /// Advance the CodePtr. Can return a dangling pointer.
    pub fn add_bytes(self, bytes: usize) -> Self {
        let CodePtr(raw) = self;
        CodePtr(NonNull::new(raw.as_ptr().wrapping_add(bytes)).unwrap())
    }

    pub fn into_usize(self) -> usize {
        let CodePtr(ptr) = self;
        ptr.as_ptr() as usize
    }
}

impl From<*mut u8> for CodePtr {
    fn from(value: *mut u8) -> Self {
        assert!(value as usize != 0);
        CodePtr(NonNull::new(value).unwrap())
    }
}

/// VirtualAlloc-backed allocation: reserve with `MEM_RESERVE`, commit
/// pages with `MEM_COMMIT` on first write.
#[cfg(all(not(test), windows))]
mod sys {
    use super::*;
    use crate::{IntoUsize, JitError};

    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_NOACCESS, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    /// Owns the reserved region and groups together the protection calls.
    pub struct SystemAllocator {
        base: *mut core::ffi::c_void,
    }

    impl Drop for SystemAllocator {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.base, 0, MEM_RELEASE);
            }
        }
    }

    impl super::Allocator for SystemAllocator {
        fn mark_writable(&mut self, ptr: *const u8, size: u32) -> bool {
            unsafe {
                // Commit is a no-op for already-committed pages; the
                // protect call covers the recommit-after-execute case
                if VirtualAlloc(ptr as *const _, size.as_usize(), MEM_COMMIT, PAGE_READWRITE)
                    .is_null()
                {
                    return false;
                }
                let mut old = 0;
                VirtualProtect(ptr as *const _, size.as_usize(), PAGE_READWRITE, &mut old) != 0
            }
        }

        fn mark_executable(&mut self, ptr: *const u8, size: u32) {
            unsafe {
                let mut old = 0;
                VirtualProtect(ptr as *const _, size.as_usize(), PAGE_EXECUTE_READ, &mut old);
            }
        }
    }

    impl VirtualMemory<SystemAllocator> {
        /// Reserve `size_bytes` of address space for the code heap. No
        /// physical memory is committed until the first write.
        pub fn system_reserve(size_bytes: usize) -> Result<Self, JitError> {
            let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
            unsafe { GetSystemInfo(&mut info) };
            let page_size = info.dwPageSize.as_usize();
            let size_bytes = size_bytes.next_multiple_of(page_size);

            let ptr = unsafe {
                VirtualAlloc(std::ptr::null(), size_bytes, MEM_RESERVE, PAGE_NOACCESS)
            };
            if ptr.is_null() {
                return Err(JitError::HostOutOfMemory);
            }

            let start = NonNull::new(ptr as *mut u8).ok_or(JitError::HostOutOfMemory)?;
            Ok(VirtualMemory::new(
                SystemAllocator { base: ptr },
                info.dwPageSize,
                start,
                size_bytes,
            ))
        }
    }
}

/// mmap/mprotect-backed allocation for normal operation.
#[cfg(all(not(test), unix))]
mod sys {
    use super::*;
    use crate::{IntoUsize, JitError};

    /// Owns the reserved mapping and groups together the mprotect syscalls.
    pub struct SystemAllocator {
        base: *mut libc::c_void,
        size: usize,
    }

    impl Drop for SystemAllocator {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base, self.size);
            }
        }
    }

    impl super::Allocator for SystemAllocator {
        fn mark_writable(&mut self, ptr: *const u8, size: u32) -> bool {
            unsafe {
                libc::mprotect(
                    ptr as *mut libc::c_void,
                    size.as_usize(),
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        fn mark_executable(&mut self, ptr: *const u8, size: u32) {
            unsafe {
                libc::mprotect(
                    ptr as *mut libc::c_void,
                    size.as_usize(),
                    libc::PROT_READ | libc::PROT_EXEC,
                );
            }
        }
    }

    impl VirtualMemory<SystemAllocator> {
        /// Reserve `size_bytes` of address space for the code heap. No
        /// physical memory is committed until the first write.
        pub fn system_reserve(size_bytes: usize) -> Result<Self, JitError> {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let size_bytes = size_bytes.next_multiple_of(page_size);

            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size_bytes,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(JitError::HostOutOfMemory);
            }

            let start = NonNull::new(ptr as *mut u8).ok_or(JitError::HostOutOfMemory)?;
            Ok(VirtualMemory::new(
                SystemAllocator { base: ptr, size: size_bytes },
                page_size.try_into().unwrap(),
                start,
                size_bytes,
            ))
        }
    }
}
