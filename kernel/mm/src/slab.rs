//! Slab allocator for sub-page allocations.
//!
//! One size class per power-of-two block size from 64 B to 2 KiB. Each
//! class carves 32-page chunks out of the buddy layer and formats them as a
//! [`SlabHeader`] followed by equal-sized blocks; free blocks are threaded
//! through their own first word. The header occupies the slab's first block
//! slot, so a fresh slab starts with `total_blocks - 1` usable blocks.
//!
//! Every page of a slab carries a back-reference to the slab's head pfn in
//! its page descriptor; kfree uses it to route an address back to the
//! owning class. A slab whose last live block is freed is returned to the
//! buddy layer immediately, keeping slab-layer memory bounded.
//!
//! Lock ordering: class lock first, then (inside the [`PageProvider`]) the
//! buddy lock. Never the reverse.

use ochre_core::addr::VirtAddr;
use ochre_core::sync::SpinLock;
use ochre_core::{kdebug, kwarn};

use crate::page::Pfn;
use crate::{MmError, PAGE_SIZE, PageProvider, buddy::GlobalPages};

/// Buddy order of one slab: 32 pages, 128 KiB.
pub const SLAB_PAGE_ORDER: usize = 5;

/// Pages per slab.
pub const SLAB_PAGES: usize = 1 << SLAB_PAGE_ORDER;

/// Bytes per slab.
const SLAB_BYTES: u64 = PAGE_SIZE << SLAB_PAGE_ORDER;

/// Log2 of the smallest supported block size (64 B).
pub const MIN_BLOCK_ORDER: usize = 6;

/// Log2 of the largest supported block size (2 KiB).
pub const MAX_BLOCK_ORDER: usize = 11;

/// Largest byte size served by the slab layer.
pub const MAX_BLOCK_SIZE: usize = 1 << MAX_BLOCK_ORDER;

/// Smallest block size; also the alignment every freed address must have.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_BLOCK_ORDER;

/// Number of size classes.
pub const CLASS_COUNT: usize = MAX_BLOCK_ORDER - MIN_BLOCK_ORDER + 1;

/// Metadata embedded at the start of every slab, inside the first block
/// slot. Must stay within [`MIN_BLOCK_SIZE`] bytes.
#[repr(C)]
struct SlabHeader {
    /// Log2 of the block size this slab serves.
    block_order: u32,
    /// Block slots in the slab, the header's own slot included.
    total_blocks: u32,
    /// Currently free blocks. The maximum reachable value is
    /// `total_blocks - 1`; hitting it means zero live allocations.
    free_blocks: u32,
    /// Virtual address of the first free block, 0 when none.
    next_free: u64,
    /// Previous slab on the class partial list, or [`Pfn::NONE`].
    prev: Pfn,
    /// Next slab on the class partial list, or [`Pfn::NONE`].
    next: Pfn,
}

/// Returns a mutable reference to the header of the slab headed by `head`.
///
/// # Safety
///
/// `head` must be the head pfn of a live slab, and the caller must hold the
/// class lock so no other reference to this header exists.
unsafe fn header<'a, P: PageProvider>(provider: &P, head: Pfn) -> &'a mut SlabHeader {
    unsafe { &mut *provider.page_vaddr(head).as_mut_ptr::<SlabHeader>() }
}

/// One slab size class: the slab currently being allocated from, plus a
/// list of partially used slabs to fall back on.
///
/// A completely full slab is on neither; only the back-references on its
/// pages still reach it. A completely empty slab never exists here, it is
/// returned to the buddy layer the moment its last live block is freed.
pub struct SlabClass {
    block_order: usize,
    current: Option<Pfn>,
    partial: Pfn,
    partial_tail: Pfn,
}

impl SlabClass {
    /// Creates an empty class serving `2^block_order`-byte blocks.
    pub const fn new(block_order: usize) -> Self {
        Self {
            block_order,
            current: None,
            partial: Pfn::NONE,
            partial_tail: Pfn::NONE,
        }
    }

    /// Allocates one block.
    pub fn alloc<P: PageProvider>(&mut self, provider: &mut P) -> Result<VirtAddr, MmError> {
        if self.current.is_none() {
            self.current = Some(match self.pop_partial(provider) {
                Some(head) => head,
                None => self.create_slab(provider)?,
            });
        }
        let head = self.current.unwrap_or_else(|| unreachable!());

        let (block, emptied) = {
            // SAFETY: head is a live slab and the class lock is held.
            let hdr = unsafe { header(provider, head) };
            let block = hdr.next_free;
            debug_assert!(block != 0, "current slab has no free block");
            // SAFETY: Free blocks store the address of the next free block
            // in their first word.
            hdr.next_free = unsafe { *(block as *const u64) };
            hdr.free_blocks -= 1;
            (block, hdr.free_blocks == 0)
        };

        if emptied {
            // The emptied slab drops off all lists; from now on only its
            // page back-references keep it findable. Refill eagerly so the
            // class always has a slab ready.
            self.current = self.pop_partial(provider);
            if self.current.is_none() {
                match self.create_slab(provider) {
                    Ok(fresh) => self.current = Some(fresh),
                    Err(_) => kwarn!(
                        "slab: no replacement slab for {}-byte class",
                        1usize << self.block_order
                    ),
                }
            }
        }

        Ok(VirtAddr::new_truncate(block))
    }

    /// Frees the block at `vaddr` belonging to the slab headed by `head`.
    ///
    /// The caller resolved `head` through the page back-reference before
    /// taking the class lock.
    pub fn free<P: PageProvider>(
        &mut self,
        provider: &mut P,
        head: Pfn,
        vaddr: VirtAddr,
    ) -> Result<(), MmError> {
        if !vaddr.is_aligned(MIN_BLOCK_SIZE as u64) {
            return Err(MmError::Unaligned);
        }

        let (free_now, total) = {
            // SAFETY: head is a live slab and the class lock is held.
            let hdr = unsafe { header(provider, head) };
            // SAFETY: The block is dead from the caller's perspective; its
            // first word now carries the free-list link.
            unsafe { *(vaddr.as_u64() as *mut u64) = hdr.next_free };
            hdr.next_free = vaddr.as_u64();
            hdr.free_blocks += 1;
            (hdr.free_blocks, hdr.total_blocks)
        };

        if free_now == total - 1 {
            // Zero live blocks remain: detach the slab and give its pages
            // back to the buddy layer.
            if self.current == Some(head) {
                self.current = self.pop_partial(provider);
            } else {
                self.remove_partial(provider, head);
            }
            provider.set_slab_owner(head, SLAB_PAGES, None);
            provider.free_pages(head);
        } else if free_now == 1 {
            // The slab was full and untracked; it has room again.
            self.push_partial(provider, head);
        }
        Ok(())
    }

    /// Obtains a fresh slab from the buddy layer and formats it: header in
    /// block slot 0, all remaining blocks threaded onto the free list, and
    /// the back-reference stamped on every constituent page.
    fn create_slab<P: PageProvider>(&mut self, provider: &mut P) -> Result<Pfn, MmError> {
        let head = provider
            .alloc_pages(SLAB_PAGE_ORDER)
            .ok_or(MmError::OutOfMemory)?;
        let base = provider.page_vaddr(head).as_u64();
        let block_size = 1u64 << self.block_order;
        let total = (SLAB_BYTES / block_size) as u32;

        // SAFETY: The chunk was just allocated for this slab; nothing else
        // references it.
        unsafe {
            for i in 1..total {
                let addr = base + u64::from(i) * block_size;
                let next = if i + 1 < total {
                    base + u64::from(i + 1) * block_size
                } else {
                    0
                };
                *(addr as *mut u64) = next;
            }
            *(base as *mut SlabHeader) = SlabHeader {
                block_order: self.block_order as u32,
                total_blocks: total,
                free_blocks: total - 1,
                next_free: base + block_size,
                prev: Pfn::NONE,
                next: Pfn::NONE,
            };
        }

        provider.set_slab_owner(head, SLAB_PAGES, Some(head));
        Ok(head)
    }

    /// Appends a slab at the partial-list tail, so refills reuse slabs in
    /// the order they regained room.
    fn push_partial<P: PageProvider>(&mut self, provider: &mut P, pfn: Pfn) {
        let old_tail = self.partial_tail;
        {
            // SAFETY: pfn is a live slab under the class lock.
            let hdr = unsafe { header(provider, pfn) };
            hdr.prev = old_tail;
            hdr.next = Pfn::NONE;
        }
        if old_tail.is_none() {
            self.partial = pfn;
        } else {
            // SAFETY: As above.
            unsafe { header(provider, old_tail) }.next = pfn;
        }
        self.partial_tail = pfn;
    }

    fn pop_partial<P: PageProvider>(&mut self, provider: &mut P) -> Option<Pfn> {
        if self.partial.is_none() {
            return None;
        }
        let pfn = self.partial;
        self.remove_partial(provider, pfn);
        Some(pfn)
    }

    fn remove_partial<P: PageProvider>(&mut self, provider: &mut P, pfn: Pfn) {
        // SAFETY: pfn is a live slab under the class lock.
        let (prev, next) = {
            let hdr = unsafe { header(provider, pfn) };
            let links = (hdr.prev, hdr.next);
            hdr.prev = Pfn::NONE;
            hdr.next = Pfn::NONE;
            links
        };
        if prev.is_none() {
            debug_assert!(self.partial == pfn, "slab not on this partial list");
            self.partial = next;
        } else {
            // SAFETY: As above.
            unsafe { header(provider, prev) }.next = next;
        }
        if next.is_none() {
            self.partial_tail = prev;
        } else {
            // SAFETY: As above.
            unsafe { header(provider, next) }.prev = prev;
        }
    }
}

/// Maps a byte size to its class index, or `None` above [`MAX_BLOCK_SIZE`].
pub(crate) fn class_index(size: usize) -> Option<usize> {
    if size > MAX_BLOCK_SIZE {
        return None;
    }
    let order = size
        .next_power_of_two()
        .trailing_zeros()
        .max(MIN_BLOCK_ORDER as u32) as usize;
    Some(order - MIN_BLOCK_ORDER)
}

/// Rounded block size actually granted for a request of `size` bytes.
pub(crate) fn granted_size(size: usize) -> usize {
    1 << (class_index(size).map_or(MAX_BLOCK_ORDER, |i| i + MIN_BLOCK_ORDER))
}

// ---------------------------------------------------------------------------
// Global size classes
// ---------------------------------------------------------------------------

/// One lock per class so pressure on different block sizes does not
/// serialize.
static CLASSES: [SpinLock<SlabClass>; CLASS_COUNT] = [
    SpinLock::new(SlabClass::new(6)),
    SpinLock::new(SlabClass::new(7)),
    SpinLock::new(SlabClass::new(8)),
    SpinLock::new(SlabClass::new(9)),
    SpinLock::new(SlabClass::new(10)),
    SpinLock::new(SlabClass::new(11)),
];

/// Logs the occupancy of every class: slabs currently tracked (current plus
/// partial; full slabs are untracked) and their free blocks.
pub fn log_stats() {
    for class_lock in &CLASSES {
        let class = class_lock.lock();
        let mut slabs = 0u32;
        let mut free = 0u32;
        let mut visit = |head: Pfn| {
            // SAFETY: head is a live slab under the class lock.
            let hdr = unsafe { header(&GlobalPages, head) };
            slabs += 1;
            free += hdr.free_blocks;
            hdr.next
        };
        if let Some(head) = class.current {
            visit(head);
        }
        let mut cursor = class.partial;
        while !cursor.is_none() {
            cursor = visit(cursor);
        }
        kdebug!(
            "slab: {:4}-byte class: {} slabs tracked, {} free blocks",
            1usize << class.block_order,
            slabs,
            free
        );
    }
}

/// Allocates a block large enough for `size` bytes from the global classes.
///
/// # Panics
///
/// Panics if `size` exceeds [`MAX_BLOCK_SIZE`]; the heap router checks the
/// bound before dispatching here.
pub fn alloc(size: usize) -> Result<VirtAddr, MmError> {
    let idx = class_index(size).expect("slab request above the largest block size");
    CLASSES[idx].lock().alloc(&mut GlobalPages)
}

/// Frees a block at `vaddr` owned by the slab headed by `head`.
pub fn free(head: Pfn, vaddr: VirtAddr) -> Result<(), MmError> {
    // The class is identified by the slab's own header. Reading it before
    // taking the class lock is fine: a slab with a live block is never
    // returned to the buddy layer, and block_order never changes.
    // SAFETY: head came from a page back-reference, so the slab is live.
    let order = unsafe { header(&GlobalPages, head) }.block_order as usize;
    assert!(
        (MIN_BLOCK_ORDER..=MAX_BLOCK_ORDER).contains(&order),
        "corrupt slab header at pfn {:#x}",
        head.as_u64()
    );
    CLASSES[order - MIN_BLOCK_ORDER]
        .lock()
        .free(&mut GlobalPages, head, vaddr)
}
