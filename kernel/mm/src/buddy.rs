//! Binary buddy allocator for physical pages.
//!
//! Chunks are power-of-two page runs, order 0 through [`MAX_ORDER`]` - 1`,
//! each aligned to its own size. An allocation that misses its order's free
//! list borrows from the next non-empty order above and splits on the way
//! down; a free merges with its buddy repeatedly on the way up. Split and
//! merge are exact inverses, so the free lists always partition the free
//! part of the region into maximal aligned chunks.
//!
//! The descriptor table is carved from the head of the managed region at
//! init; the remainder becomes the allocatable area.

use core::mem::size_of;

use ochre_core::addr::{PhysAddr, VirtAddr};
use ochre_core::sync::SpinLock;
use ochre_core::{kdebug, kinfo};

use crate::page::{FreeList, PageDescriptor, Pfn};
use crate::{MAX_ORDER, PAGE_SHIFT, PAGE_SIZE, PageProvider, PhysMemoryInfo};

/// Buddy allocator over one contiguous physical region.
///
/// All mutation goes through `&mut self`; the module's global lock provides
/// thread safety, so no interior lock is needed and tests can run instances
/// side by side.
pub struct BuddyAllocator {
    /// One descriptor per allocatable page, indexed by `pfn - base`.
    descriptors: &'static mut [PageDescriptor],
    /// Free chunk lists, one per order.
    free_lists: [FreeList; MAX_ORDER],
    /// Pfn of the first allocatable page.
    base: Pfn,
    /// Number of allocatable pages.
    page_count: usize,
    /// Virtual-to-physical offset for all pointer conversions.
    offset: u64,
}

impl BuddyAllocator {
    /// Creates an allocator over the span described by `info`.
    ///
    /// Reserves the head of the span for the descriptor table, then
    /// populates the free lists by tiling the remainder: forward from the
    /// first maximum-order boundary in maximal chunks, then backward from
    /// that boundary toward the region start.
    ///
    /// # Safety
    ///
    /// `info` must describe unused memory mapped at `info.offset` and owned
    /// exclusively by this allocator from now on.
    pub unsafe fn new(info: PhysMemoryInfo) -> Result<Self, crate::MmError> {
        let start = info.start.align_up(PAGE_SIZE);
        let end = info.end.align_down(PAGE_SIZE);
        if end <= start {
            return Err(crate::MmError::OutOfMemory);
        }

        // Split the span between the descriptor table and the pages it
        // describes: npages * (desc + page) <= total bytes. The remainder
        // past the page-rounded reservation can hold one page more than the
        // table has room to describe, so the page count is clamped to the
        // reservation's capacity and the span end pulled in to match.
        let desc_size = size_of::<PageDescriptor>() as u64;
        let npages = (end - start) / (PAGE_SIZE + desc_size);
        let free_start = (start + npages * desc_size).align_up(PAGE_SIZE);
        let desc_capacity = ((free_start - start) / desc_size) as usize;
        let page_count = (((end - free_start) / PAGE_SIZE) as usize).min(desc_capacity);
        if page_count == 0 {
            return Err(crate::MmError::OutOfMemory);
        }
        let end = free_start + page_count as u64 * PAGE_SIZE;

        // SAFETY: [start, free_start) is reserved for the table, mapped at
        // the offset, unaliased, and large enough for page_count records.
        let descriptors = unsafe {
            let ptr = (info.offset + start.as_u64()) as *mut PageDescriptor;
            core::slice::from_raw_parts_mut(ptr, page_count)
        };
        descriptors.fill(PageDescriptor::unlinked());

        let mut allocator = Self {
            descriptors,
            free_lists: [FreeList::new(); MAX_ORDER],
            base: Pfn::new(free_start.as_u64() >> PAGE_SHIFT),
            page_count,
            offset: info.offset,
        };
        allocator.populate(free_start, end);
        Ok(allocator)
    }

    /// Tiles `[free_start, end)` onto the free lists.
    ///
    /// Pass 1 walks forward from the first maximum-order boundary placing
    /// the largest chunks that fit. Pass 2 walks backward from that boundary
    /// toward the region start, orders descending, so the unaligned head of
    /// the region is covered by progressively smaller aligned chunks. Every
    /// allocatable page ends up in exactly one free chunk.
    fn populate(&mut self, free_start: PhysAddr, end: PhysAddr) {
        let top_chunk = PAGE_SIZE << (MAX_ORDER - 1);
        let mut pivot = free_start.align_up(top_chunk);
        if pivot.as_u64() > end.as_u64() {
            // Region too small to reach a maximum-order boundary; the
            // backward pass covers all of it.
            pivot = end;
        }

        let mut cursor = pivot;
        for order in (0..MAX_ORDER).rev() {
            let chunk = PAGE_SIZE << order;
            while cursor.is_aligned(chunk) && cursor.as_u64() + chunk <= end.as_u64() {
                self.insert_free_chunk(self.pfn_at(cursor), order);
                cursor = cursor + chunk;
            }
        }

        let mut cursor = pivot;
        for order in (0..MAX_ORDER - 1).rev() {
            let chunk = PAGE_SIZE << order;
            while cursor.is_aligned(chunk) && cursor.as_u64() >= free_start.as_u64() + chunk {
                cursor = cursor - chunk;
                self.insert_free_chunk(self.pfn_at(cursor), order);
            }
        }
    }

    fn pfn_at(&self, phys: PhysAddr) -> Pfn {
        Pfn::new(phys.as_u64() >> PAGE_SHIFT)
    }

    fn idx(&self, pfn: Pfn) -> usize {
        (pfn.as_u64() - self.base.as_u64()) as usize
    }

    fn insert_free_chunk(&mut self, head: Pfn, order: usize) {
        let idx = self.idx(head);
        self.descriptors[idx].allocated = false;
        self.descriptors[idx].order = order as u8;
        self.free_lists[order].push(self.descriptors, self.base, head);
    }

    /// Allocates a chunk of `2^order` pages, returning its head pfn, or
    /// `None` when no order from `order` upward has a free chunk.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range order; that is a caller defect, not an
    /// out-of-memory condition.
    pub fn allocate(&mut self, order: usize) -> Option<Pfn> {
        assert!(order < MAX_ORDER, "invalid buddy order {order}");

        let mut current = (order..MAX_ORDER).find(|&k| !self.free_lists[k].is_empty())?;
        let head = self.free_lists[current].pop(self.descriptors, self.base)?;

        // Split down to the requested order, parking the upper half of each
        // split on its own free list.
        while current > order {
            current -= 1;
            let upper = head.offset(1 << current);
            self.insert_free_chunk(upper, current);
        }

        let idx = self.idx(head);
        self.descriptors[idx].allocated = true;
        self.descriptors[idx].order = order as u8;
        Some(head)
    }

    /// Frees the chunk headed by `head`, merging with free buddies upward
    /// as far as possible.
    ///
    /// # Panics
    ///
    /// Panics if `head` is not the head page of a live allocation.
    pub fn free(&mut self, head: Pfn) {
        let idx = self.idx(head);
        assert!(
            self.descriptors[idx].allocated,
            "double free of pfn {:#x}",
            head.as_u64()
        );
        let mut order = usize::from(self.descriptors[idx].order);
        self.descriptors[idx].allocated = false;

        let mut pfn = head;
        while order < MAX_ORDER - 1 {
            let Some(buddy) = self.buddy_of(pfn, order) else {
                break;
            };
            let bidx = self.idx(buddy);
            if self.descriptors[bidx].allocated
                || usize::from(self.descriptors[bidx].order) != order
            {
                break;
            }
            self.free_lists[order].remove(self.descriptors, self.base, buddy);
            pfn = pfn.min(buddy);
            order += 1;
        }

        self.insert_free_chunk(pfn, order);
    }

    /// Computes the sibling chunk that pairs with `pfn` at `order`: round
    /// the address down to the next order's boundary; if that lands on the
    /// chunk itself the sibling follows it, otherwise it precedes it.
    /// Returns `None` when the sibling falls outside the managed range.
    fn buddy_of(&self, pfn: Pfn, order: usize) -> Option<Pfn> {
        let addr = pfn.as_u64() << PAGE_SHIFT;
        let chunk = PAGE_SIZE << order;
        let parent = addr & !(2 * chunk - 1);
        let buddy_addr = if parent == addr { addr + chunk } else { addr - chunk };

        let range_start = self.base.as_u64() << PAGE_SHIFT;
        let range_end = range_start + (self.page_count as u64) * PAGE_SIZE;
        if buddy_addr < range_start || buddy_addr + chunk > range_end {
            return None;
        }
        Some(Pfn::new(buddy_addr >> PAGE_SHIFT))
    }

    /// Total free pages across all orders.
    pub fn free_page_count(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    /// Total free bytes.
    pub fn free_mem_size(&self) -> u64 {
        self.free_page_count() as u64 * PAGE_SIZE
    }

    /// Total managed bytes (free plus allocated).
    pub fn total_mem_size(&self) -> u64 {
        self.page_count as u64 * PAGE_SIZE
    }

    /// Number of allocatable pages.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Logs the per-order free-list occupancy.
    pub fn log_stats(&self) {
        for (order, list) in self.free_lists.iter().enumerate() {
            kdebug!(
                "buddy: order {:2}: {:5} free chunks ({} KiB each)",
                order,
                list.len(),
                (PAGE_SIZE << order) / 1024
            );
        }
    }

    /// Returns the virtual address of the page at `pfn`.
    pub fn page_vaddr(&self, pfn: Pfn) -> VirtAddr {
        VirtAddr::new_truncate(self.offset.wrapping_add(pfn.as_u64() << PAGE_SHIFT))
    }

    /// Returns the pfn containing `vaddr`, or `None` outside the managed
    /// range.
    pub fn pfn_of(&self, vaddr: VirtAddr) -> Option<Pfn> {
        let phys = vaddr.as_u64().checked_sub(self.offset)?;
        let pfn = phys >> PAGE_SHIFT;
        let base = self.base.as_u64();
        if pfn < base || pfn >= base + self.page_count as u64 {
            return None;
        }
        Some(Pfn::new(pfn))
    }

    /// Records `owner` as the owning slab on `count` pages from `head`.
    pub fn set_slab_owner(&mut self, head: Pfn, count: usize, owner: Option<Pfn>) {
        let start = self.idx(head);
        for desc in &mut self.descriptors[start..start + count] {
            desc.slab = owner.unwrap_or(Pfn::NONE);
        }
    }

    /// Returns the slab head owning the page at `pfn`, if any.
    pub fn slab_owner(&self, pfn: Pfn) -> Option<Pfn> {
        let slab = self.descriptors[self.idx(pfn)].slab;
        (!slab.is_none()).then_some(slab)
    }
}

impl PageProvider for BuddyAllocator {
    fn alloc_pages(&mut self, order: usize) -> Option<Pfn> {
        self.allocate(order)
    }

    fn free_pages(&mut self, head: Pfn) {
        self.free(head);
    }

    fn page_vaddr(&self, pfn: Pfn) -> VirtAddr {
        self.page_vaddr(pfn)
    }

    fn pfn_of(&self, vaddr: VirtAddr) -> Option<Pfn> {
        self.pfn_of(vaddr)
    }

    fn set_slab_owner(&mut self, head: Pfn, count: usize, owner: Option<Pfn>) {
        self.set_slab_owner(head, count, owner);
    }

    fn slab_owner(&self, pfn: Pfn) -> Option<Pfn> {
        self.slab_owner(pfn)
    }
}

// ---------------------------------------------------------------------------
// Global buddy allocator
// ---------------------------------------------------------------------------

/// Global buddy allocator. One lock covers all free-list state; allocate
/// and free hold it for their whole operation, splitting and merging
/// included.
static BUDDY: SpinLock<Option<BuddyAllocator>> = SpinLock::new(None);

/// Initializes the global buddy allocator.
///
/// # Safety
///
/// Same contract as [`BuddyAllocator::new`], plus: must be called exactly
/// once, before any other entry point of this crate.
pub unsafe fn init(info: PhysMemoryInfo) {
    kdebug!(
        "buddy: usable physical span {}..{}, direct map offset {:#x}",
        info.start,
        info.end,
        info.offset
    );
    // SAFETY: Forwarded contract.
    let allocator =
        unsafe { BuddyAllocator::new(info) }.expect("buddy: unusable physical memory span");
    kinfo!(
        "buddy: managing {} pages ({} KiB) at {:#x}",
        allocator.page_count(),
        allocator.total_mem_size() / 1024,
        allocator.base.as_u64() << PAGE_SHIFT
    );

    let mut buddy = BUDDY.lock();
    assert!(buddy.is_none(), "buddy allocator already initialized");
    *buddy = Some(allocator);
}

/// Runs `f` with the global allocator under its lock.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut buddy = BUDDY.lock();
    f(buddy.as_mut().expect("buddy allocator not initialized"))
}

/// Like [`with`], but returns `None` instead of spinning when the lock is
/// already held or the allocator is not initialized. For panic paths.
pub fn try_with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> Option<R> {
    let mut buddy = BUDDY.try_lock()?;
    Some(f(buddy.as_mut()?))
}

/// [`PageProvider`] that forwards to the global allocator, taking the buddy
/// lock per call. This is what the slab layer uses in production; holding a
/// slab-class lock while calling it preserves the slab-then-buddy lock
/// order.
pub struct GlobalPages;

impl PageProvider for GlobalPages {
    fn alloc_pages(&mut self, order: usize) -> Option<Pfn> {
        with(|b| b.allocate(order))
    }

    fn free_pages(&mut self, head: Pfn) {
        with(|b| b.free(head));
    }

    fn page_vaddr(&self, pfn: Pfn) -> VirtAddr {
        with(|b| b.page_vaddr(pfn))
    }

    fn pfn_of(&self, vaddr: VirtAddr) -> Option<Pfn> {
        with(|b| b.pfn_of(vaddr))
    }

    fn set_slab_owner(&mut self, head: Pfn, count: usize, owner: Option<Pfn>) {
        with(|b| b.set_slab_owner(head, count, owner));
    }

    fn slab_owner(&self, pfn: Pfn) -> Option<Pfn> {
        with(|b| b.slab_owner(pfn))
    }
}
