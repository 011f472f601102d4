//! Page descriptors and the intrusive free lists built over them.
//!
//! One [`PageDescriptor`] per physical page, stored in a flat table indexed
//! by pfn. All list membership is expressed as pfn links into that table
//! rather than raw pointers, so the buddy allocator never holds aliasing
//! pointers into page memory.

/// A physical page-frame number.
///
/// Used both as the allocator's currency (chunks are identified by their
/// head pfn) and as the index into the descriptor table after subtracting
/// the table's base pfn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pfn(u32);

impl Pfn {
    /// Sentinel for "no page", used by intrusive links.
    pub const NONE: Pfn = Pfn(u32::MAX);

    /// Creates a pfn from a raw frame number.
    ///
    /// # Panics
    ///
    /// Panics if `raw` collides with the [`Pfn::NONE`] sentinel.
    pub fn new(raw: u64) -> Self {
        assert!(raw < u64::from(u32::MAX), "pfn out of range: {raw:#x}");
        Self(raw as u32)
    }

    /// Returns the raw frame number.
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Returns `true` if this is the [`Pfn::NONE`] sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Returns the pfn `delta` frames after this one.
    pub fn offset(self, delta: u64) -> Self {
        Self::new(self.as_u64() + delta)
    }
}

/// Per-page metadata. One record per physical page in the managed range.
#[derive(Debug, Clone, Copy)]
pub struct PageDescriptor {
    /// Previous chunk head on the free list, or [`Pfn::NONE`].
    pub prev: Pfn,
    /// Next chunk head on the free list, or [`Pfn::NONE`].
    pub next: Pfn,
    /// Head pfn of the slab owning this page, or [`Pfn::NONE`] for pages
    /// that are free or raw buddy allocations.
    pub slab: Pfn,
    /// Buddy order this page is tracked at. Meaningful for chunk heads.
    pub order: u8,
    /// Whether the page has been handed out (or is interior to a chunk).
    pub allocated: bool,
}

impl PageDescriptor {
    /// An allocated, unlinked, order-0 descriptor: the initial state of
    /// every page before the free lists are populated.
    pub const fn unlinked() -> Self {
        Self {
            prev: Pfn::NONE,
            next: Pfn::NONE,
            slab: Pfn::NONE,
            order: 0,
            allocated: true,
        }
    }
}

/// Doubly-linked list of free chunk heads for one buddy order.
///
/// The links live inside the descriptors; the list itself only stores the
/// head pfn and a count. Every operation takes the descriptor table and the
/// table's base pfn so it can map pfns to table indices.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    head: Pfn,
    count: usize,
}

impl FreeList {
    /// An empty list.
    pub const fn new() -> Self {
        Self {
            head: Pfn::NONE,
            count: 0,
        }
    }

    /// Number of chunks on the list.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the list holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn idx(base: Pfn, pfn: Pfn) -> usize {
        (pfn.as_u64() - base.as_u64()) as usize
    }

    /// Pushes the chunk headed by `pfn` onto the list front.
    pub fn push(&mut self, descs: &mut [PageDescriptor], base: Pfn, pfn: Pfn) {
        let old_head = self.head;
        {
            let desc = &mut descs[Self::idx(base, pfn)];
            desc.prev = Pfn::NONE;
            desc.next = old_head;
        }
        if !old_head.is_none() {
            descs[Self::idx(base, old_head)].prev = pfn;
        }
        self.head = pfn;
        self.count += 1;
    }

    /// Pops the chunk at the list front, if any.
    pub fn pop(&mut self, descs: &mut [PageDescriptor], base: Pfn) -> Option<Pfn> {
        if self.head.is_none() {
            return None;
        }
        let pfn = self.head;
        self.remove(descs, base, pfn);
        Some(pfn)
    }

    /// Unlinks the chunk headed by `pfn` from anywhere in the list.
    pub fn remove(&mut self, descs: &mut [PageDescriptor], base: Pfn, pfn: Pfn) {
        let (prev, next) = {
            let desc = &mut descs[Self::idx(base, pfn)];
            let links = (desc.prev, desc.next);
            desc.prev = Pfn::NONE;
            desc.next = Pfn::NONE;
            links
        };
        if prev.is_none() {
            debug_assert!(self.head == pfn, "removing a page not on this list");
            self.head = next;
        } else {
            descs[Self::idx(base, prev)].next = next;
        }
        if !next.is_none() {
            descs[Self::idx(base, next)].prev = prev;
        }
        self.count -= 1;
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> Vec<PageDescriptor> {
        vec![PageDescriptor::unlinked(); n]
    }

    #[test]
    fn push_pop_lifo() {
        let base = Pfn::new(100);
        let mut descs = table(8);
        let mut list = FreeList::new();

        list.push(&mut descs, base, Pfn::new(101));
        list.push(&mut descs, base, Pfn::new(104));
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop(&mut descs, base), Some(Pfn::new(104)));
        assert_eq!(list.pop(&mut descs, base), Some(Pfn::new(101)));
        assert_eq!(list.pop(&mut descs, base), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle() {
        let base = Pfn::new(0);
        let mut descs = table(8);
        let mut list = FreeList::new();

        for i in [1u64, 3, 5] {
            list.push(&mut descs, base, Pfn::new(i));
        }
        list.remove(&mut descs, base, Pfn::new(3));
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop(&mut descs, base), Some(Pfn::new(5)));
        assert_eq!(list.pop(&mut descs, base), Some(Pfn::new(1)));
        assert!(list.is_empty());
    }

    #[test]
    fn remove_head_and_tail() {
        let base = Pfn::new(0);
        let mut descs = table(8);
        let mut list = FreeList::new();

        for i in [0u64, 2, 4] {
            list.push(&mut descs, base, Pfn::new(i));
        }
        // Head is 4, tail is 0.
        list.remove(&mut descs, base, Pfn::new(4));
        list.remove(&mut descs, base, Pfn::new(0));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop(&mut descs, base), Some(Pfn::new(2)));
    }

    #[test]
    fn removed_descriptor_links_cleared() {
        let base = Pfn::new(0);
        let mut descs = table(4);
        let mut list = FreeList::new();

        list.push(&mut descs, base, Pfn::new(1));
        list.push(&mut descs, base, Pfn::new(2));
        list.remove(&mut descs, base, Pfn::new(1));
        assert!(descs[1].prev.is_none());
        assert!(descs[1].next.is_none());
    }

    #[test]
    #[should_panic(expected = "pfn out of range")]
    fn pfn_sentinel_collision_rejected() {
        let _ = Pfn::new(u64::from(u32::MAX));
    }
}
