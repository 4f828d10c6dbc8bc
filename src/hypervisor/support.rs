use core::ptr::NonNull;
use std::alloc::{self, Layout, handle_alloc_error};

use x86::bits64::paging::BASE_PAGE_SIZE;

/// A zero-initialized, page-aligned block of host memory. Blocks back the
/// guest page tables and vthread stacks, both of which are mapped into the
/// guest-physical address space.
pub(crate) struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The block is plain memory owned by this value. Concurrent access by
// guests is not synchronized with the host, same as any memory shared with
// the guest.
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    /// Allocates `pages` zeroed pages.
    pub(crate) fn new(pages: usize) -> Self {
        let size = pages.max(1).saturating_mul(BASE_PAGE_SIZE);
        let Ok(layout) = Layout::from_size_align(size, BASE_PAGE_SIZE) else {
            panic!("Could not describe a block of {pages} pages");
        };
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    /// The host virtual address of the block.
    pub(crate) fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// The size of the block in bytes. Always a multiple of the page size.
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn pages(&self) -> usize {
        self.len() / BASE_PAGE_SIZE
    }

    /// Returns the `index`-th page reinterpreted as `T`.
    pub(crate) fn page<T>(&self, index: usize) -> &T {
        const { assert!(size_of::<T>() <= BASE_PAGE_SIZE) };
        assert!(index < self.pages());
        // SAFETY: The page is in bounds, aligned and zero-initialized at least;
        // `T` is only instantiated with plain integer arrays.
        unsafe { &*self.ptr.as_ptr().add(index * BASE_PAGE_SIZE).cast::<T>() }
    }

    /// Returns the `index`-th page reinterpreted as `T`.
    pub(crate) fn page_mut<T>(&mut self, index: usize) -> &mut T {
        const { assert!(size_of::<T>() <= BASE_PAGE_SIZE) };
        assert!(index < self.pages());
        // SAFETY: See `page`. `&mut self` guarantees exclusivity on the host side.
        unsafe { &mut *self.ptr.as_ptr().add(index * BASE_PAGE_SIZE).cast::<T>() }
    }

    /// Writes `value` at the byte `offset` of the block.
    pub(crate) fn write_u64(&mut self, offset: usize, value: u64) {
        assert!(offset % size_of::<u64>() == 0 && offset + size_of::<u64>() <= self.len());
        // SAFETY: In bounds and aligned as checked above.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u64>().write(value) };
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: The block is `len` initialized bytes.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: Allocated with the same layout in `new`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for HostBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

// The landing pad a vthread returns into when its entry function returns.
#[cfg(all(target_arch = "x86_64", target_os = "macos"))]
core::arch::global_asm!(
    ".text",
    ".globl _vthread_hlt",
    "_vthread_hlt:",
    "hlt",
    "jmp _vthread_hlt",
);
#[cfg(all(target_arch = "x86_64", not(target_os = "macos")))]
core::arch::global_asm!(
    ".text",
    ".globl vthread_hlt",
    "vthread_hlt:",
    "hlt",
    "jmp vthread_hlt",
);

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    fn vthread_hlt();
}

/// Returns the address of the `hlt` stub.
pub(crate) fn hlt_stub_address() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        vthread_hlt as usize as u64
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// Rounds `size` down to a multiple of 8 bytes, then up to whole pages.
pub(crate) fn stack_pages(size: usize) -> usize {
    ((size >> 3) << 3).div_ceil(BASE_PAGE_SIZE).max(1)
}
