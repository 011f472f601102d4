//! Kernel heap entry points.
//!
//! kmalloc routes a byte size to the right allocator: zero-size requests
//! get a non-dereferenceable sentinel, anything up to 2 KiB goes to the
//! slab layer, anything up to the largest buddy chunk (4 MiB) goes to the
//! buddy layer page-rounded, and bigger requests are refused. kfree routes
//! back by consulting the page back-reference: slab pages carry one, raw
//! buddy chunks do not.

use core::alloc::{GlobalAlloc, Layout};

use ochre_core::addr::VirtAddr;
use ochre_core::kerr;

use crate::{MAX_ORDER, MmError, PAGE_SIZE, buddy, slab};

/// Sentinel returned for zero-size requests. Never dereferenceable and
/// never produced by a real allocation; [`kfree`] treats it as a no-op.
pub const ZERO_SIZE_PTR: VirtAddr = VirtAddr::new_truncate(u64::MAX);

/// Largest request kmalloc serves: one maximum-order buddy chunk.
pub const MAX_ALLOC_SIZE: u64 = PAGE_SIZE << (MAX_ORDER - 1);

/// Smallest buddy order whose chunk holds `size` bytes.
fn size_to_page_order(size: u64) -> usize {
    let pages = size.div_ceil(PAGE_SIZE);
    pages.next_power_of_two().trailing_zeros() as usize
}

/// Allocates `size` bytes from the kernel heap.
///
/// The returned address is aligned to the rounded allocation size (a
/// power of two), so any natural alignment up to the request size holds.
pub fn kmalloc(size: usize) -> Result<VirtAddr, MmError> {
    if size == 0 {
        return Ok(ZERO_SIZE_PTR);
    }
    if size <= slab::MAX_BLOCK_SIZE {
        return slab::alloc(size);
    }
    if size as u64 > MAX_ALLOC_SIZE {
        return Err(MmError::TooLarge);
    }
    let order = size_to_page_order(size as u64);
    buddy::with(|b| b.allocate(order).map(|head| b.page_vaddr(head)))
        .ok_or(MmError::OutOfMemory)
}

/// Allocates `size` zeroed bytes from the kernel heap.
pub fn kzalloc(size: usize) -> Result<VirtAddr, MmError> {
    let addr = kmalloc(size)?;
    if addr != ZERO_SIZE_PTR {
        // SAFETY: kmalloc returned a live allocation of at least `size`
        // bytes.
        unsafe { core::ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, size) };
    }
    Ok(addr)
}

/// Frees an address previously returned by [`kmalloc`] / [`kzalloc`].
///
/// Dispatches through the page back-reference: present means the block
/// belongs to a slab, absent means a raw buddy chunk. Freeing the
/// zero-size sentinel is a no-op; only the exact pointer previously
/// returned is a supported argument.
///
/// # Panics
///
/// Panics if the address is inside the managed range but is not a live
/// allocation (buddy-level double free or interior page); that is a
/// contract violation, not a recoverable error.
pub fn kfree(vaddr: VirtAddr) -> Result<(), MmError> {
    if vaddr == ZERO_SIZE_PTR {
        return Ok(());
    }
    let Some(pfn) = buddy::with(|b| b.pfn_of(vaddr)) else {
        kerr!("kfree: {vaddr} is outside the managed range");
        return Err(MmError::InvalidFree);
    };
    match buddy::with(|b| b.slab_owner(pfn)) {
        Some(head) => slab::free(head, vaddr),
        None => {
            if !vaddr.is_aligned(PAGE_SIZE) {
                return Err(MmError::Unaligned);
            }
            buddy::with(|b| b.free(pfn));
            Ok(())
        }
    }
}

/// Bytes actually reserved for a request of `size` bytes: the slab block
/// size or the buddy chunk size after rounding, in both branches.
pub fn granted_size(size: usize) -> usize {
    if size == 0 {
        0
    } else if size <= slab::MAX_BLOCK_SIZE {
        slab::granted_size(size)
    } else {
        (PAGE_SIZE << size_to_page_order(size as u64)) as usize
    }
}

/// Allocates a chunk of `2^order` raw pages, bypassing the slab layer.
///
/// This is the path page-table construction uses for intermediate table
/// pages; the pages are not zeroed here.
pub fn get_pages(order: usize) -> Option<VirtAddr> {
    buddy::with(|b| b.allocate(order).map(|head| b.page_vaddr(head)))
}

/// Frees a chunk previously returned by [`get_pages`].
///
/// # Panics
///
/// Panics if `vaddr` is not the base of a live chunk.
pub fn free_pages(vaddr: VirtAddr) {
    let pfn = buddy::with(|b| b.pfn_of(vaddr)).expect("free_pages: address outside managed range");
    buddy::with(|b| b.free(pfn));
}

/// [`GlobalAlloc`] adapter over the kernel heap, for the kernel binary to
/// install as its `#[global_allocator]`.
pub struct KernelHeap;

// SAFETY: kmalloc returns unique, live, suitably aligned blocks; kfree
// accepts exactly those blocks back.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Rounded allocations are aligned to their own size, so inflating
        // the request to the alignment satisfies any power-of-two align.
        let size = layout.size().max(layout.align());
        match kmalloc(size) {
            Ok(addr) => addr.as_mut_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = kfree(VirtAddr::new_truncate(ptr as u64));
    }
}

/// The kernel's heap instance. Only registered as the global allocator on
/// the real target so host tests keep the std allocator.
#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap;
