//! Physical and heap memory management for the ochre kernel.
//!
//! Three allocators layered bottom-up:
//! - [`buddy`]: power-of-two page allocator over the usable physical range,
//!   orders 0 (one page) through [`MAX_ORDER`]` - 1` (4 MiB).
//! - [`slab`]: sub-page fixed-size block allocator that carves slabs out of
//!   buddy chunks, one size class per power of two from 64 B to 2 KiB.
//! - [`kmalloc`]: the routing layer the rest of the kernel calls; dispatches
//!   a byte size to the slab layer or directly to the buddy layer.
//!
//! The page-table manager in `ochre_core::arch` sits beside these and pulls
//! its intermediate table pages straight from the buddy layer, never through
//! kmalloc.
//!
//! Boot code calls [`init`] once with the usable physical span; after that
//! every entry point is safe to call from any core.

#![cfg_attr(not(test), no_std)]

pub mod buddy;
pub mod kmalloc;
pub mod page;
pub mod slab;

use ochre_core::addr::{PhysAddr, VirtAddr};

pub use page::Pfn;

/// Log2 of the page size.
pub const PAGE_SHIFT: u64 = 12;

/// Size of one physical page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of buddy orders. The largest chunk is
/// `2^(MAX_ORDER - 1)` pages, i.e. 4 MiB.
pub const MAX_ORDER: usize = 11;

/// Errors reported by the allocator entry points.
///
/// Everything here is a normal, recoverable failure. Contract violations
/// (double free, bad order, freeing an untracked address) panic instead;
/// continuing past one would corrupt free-list state for every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No chunk or slab of sufficient size is available.
    OutOfMemory,
    /// The request exceeds the largest representable buddy chunk.
    TooLarge,
    /// The freed address does not belong to any live allocation.
    InvalidFree,
    /// The freed address is not aligned to the minimum block size.
    Unaligned,
}

impl core::fmt::Display for MmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::TooLarge => f.write_str("request exceeds the largest buddy chunk"),
            Self::InvalidFree => f.write_str("address does not belong to a live allocation"),
            Self::Unaligned => f.write_str("address is not block-aligned"),
        }
    }
}

/// Description of the usable physical memory span, handed over by boot code.
///
/// The span starts after the kernel image; the buddy allocator carves its
/// page descriptor table from the head of it. `offset` is the constant the
/// whole core uses to reach physical memory (`virt = offset + phys`): the
/// kernel direct-map base in production, a host buffer address in tests.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryInfo {
    /// First usable physical address (page-aligned).
    pub start: PhysAddr,
    /// One past the last usable physical address (page-aligned).
    pub end: PhysAddr,
    /// Virtual-to-physical offset for all pointer conversions.
    pub offset: u64,
}

/// Page-allocation interface the slab layer builds on.
///
/// In production this is [`buddy::GlobalPages`] forwarding to the global
/// buddy allocator; tests substitute an instance-local allocator. Keeping
/// the slab layer off the globals is what makes it testable in isolation.
///
/// Lock ordering: implementations may take the buddy lock internally, so a
/// caller already holding a slab-class lock is fine, but the reverse order
/// is forbidden.
pub trait PageProvider {
    /// Allocates a chunk of `2^order` pages, returning the head pfn.
    fn alloc_pages(&mut self, order: usize) -> Option<Pfn>;

    /// Frees a chunk previously returned by [`Self::alloc_pages`].
    fn free_pages(&mut self, head: Pfn);

    /// Returns the virtual address of the page at `pfn`.
    fn page_vaddr(&self, pfn: Pfn) -> VirtAddr;

    /// Returns the pfn containing `vaddr`, or `None` if the address is
    /// outside the managed range.
    fn pfn_of(&self, vaddr: VirtAddr) -> Option<Pfn>;

    /// Records `owner` as the owning slab head on `count` pages starting
    /// at `head`. `None` clears the back-reference.
    fn set_slab_owner(&mut self, head: Pfn, count: usize, owner: Option<Pfn>);

    /// Returns the slab head owning the page at `pfn`, if any.
    fn slab_owner(&self, pfn: Pfn) -> Option<Pfn>;
}

/// Initializes the memory core from the boot-supplied physical span.
///
/// Brings up the buddy allocator over `info` and leaves the slab classes
/// empty; kmalloc is usable as soon as this returns.
///
/// # Safety
///
/// - `info` must describe memory that is unused, mapped at `offset`, and
///   exclusively owned by the memory core from now on.
/// - Must be called exactly once, before any allocator entry point.
pub unsafe fn init(info: PhysMemoryInfo) {
    // SAFETY: Forwarded contract.
    unsafe { buddy::init(info) };
}
