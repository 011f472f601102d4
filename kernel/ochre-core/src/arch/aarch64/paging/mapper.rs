//! Translation-table builder and walker.
//!
//! All table memory is reached through a fixed virtual-to-physical offset
//! (the kernel direct map in production, the test arena base in unit tests).
//! Intermediate table pages come from a caller-supplied allocator so this
//! code stays independent of the page allocator's globals.

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::aarch64::barrier;
use crate::paging::{PageSize, PhysFrame, Size4KiB};

use super::{MapError, PageTable, PageTableEntry, TableKind, VmFlags};

/// Result of walking a virtual address through a table.
#[derive(Debug, Clone, Copy)]
pub enum TranslateResult {
    /// Terminated at an L3 page descriptor.
    Page4KiB {
        /// The mapped frame.
        frame: PhysFrame<Size4KiB>,
        /// The matched descriptor.
        entry: PageTableEntry,
    },
    /// Terminated at an L2 block descriptor.
    Block2MiB {
        /// Physical start of the 2 MiB block.
        phys_start: PhysAddr,
        /// The matched descriptor.
        entry: PageTableEntry,
    },
    /// Terminated at an L1 block descriptor.
    Block1GiB {
        /// Physical start of the 1 GiB block.
        phys_start: PhysAddr,
        /// The matched descriptor.
        entry: PageTableEntry,
    },
    /// The walk hit an invalid descriptor.
    NotMapped,
}

/// Walks and builds 4-level translation tables reached via a direct map.
pub struct PageTableMapper {
    offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper whose tables live at `offset + phys`.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.offset.wrapping_add(phys.as_u64())) as *mut u8
    }

    /// Returns a mutable reference to the table at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be a 4 KiB-aligned frame holding a translation table,
    /// reachable through this mapper's offset, with no aliasing references.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *self.phys_to_virt(phys).cast::<PageTable>() }
    }

    /// Ensures `table[index]` references a next-level table, allocating and
    /// zeroing a fresh page if the slot is invalid. Returns the physical
    /// address of the next-level table.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a terminal block descriptor. Mapping pages
    /// over an existing block mapping is a caller contract violation.
    ///
    /// # Safety
    ///
    /// `table_phys` must satisfy the [`Self::table_at`] contract.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> Result<PhysAddr, MapError> {
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_valid() {
            assert!(
                entry.is_table_or_page(),
                "page walk hit a block descriptor at table {:#x} index {index}",
                table_phys.as_u64(),
            );
            return Ok(entry.address());
        }

        let frame = alloc().ok_or(MapError::OutOfMemory)?.start_address();
        // SAFETY: The frame was just allocated and is reachable through the
        // offset. Stale data must not read as valid descriptors.
        unsafe {
            (*self.phys_to_virt(frame).cast::<PageTable>()).zero();
        }
        table.entries[index] = PageTableEntry::new_table(frame);
        Ok(frame)
    }

    /// Maps `length` bytes starting at `virt` to the physical range starting
    /// at `phys`, as 4 KiB leaf entries with the given permissions.
    ///
    /// `length` is rounded up to whole pages. Intermediate tables are
    /// allocated on demand through `alloc`; on out-of-memory, entries written
    /// so far remain in place and the error is returned. Ends with the
    /// store/instruction barriers that make the new entries visible to the
    /// walker; no TLB maintenance is performed because previously unmapped
    /// addresses have no stale entries.
    ///
    /// # Panics
    ///
    /// Panics if `virt` or `phys` is not page-aligned, or if the walk runs
    /// into an existing block mapping.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid L0 table reachable
    /// through this mapper's offset, and the caller must serialize
    /// modifications of the same table.
    pub unsafe fn map_range(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        length: u64,
        flags: VmFlags,
        kind: TableKind,
        alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> Result<(), MapError> {
        assert!(virt.is_aligned(Size4KiB::SIZE), "map_range: unaligned virtual address");
        assert!(phys.is_aligned(Size4KiB::SIZE), "map_range: unaligned physical address");

        let pages = length.div_ceil(Size4KiB::SIZE);
        let mut l3_phys = None;

        for i in 0..pages {
            let va = virt + i * Size4KiB::SIZE;
            let pa = phys + i * Size4KiB::SIZE;

            // Re-walk from L0 on the first page and at every leaf-table
            // boundary; in between the same L3 table is reused.
            if l3_phys.is_none() || va.l3_index() == 0 {
                // SAFETY: root is valid per the function contract; each
                // ensure_table result is a table installed by this walk.
                let l1 = unsafe { self.ensure_table(root, va.l0_index(), alloc)? };
                let l2 = unsafe { self.ensure_table(l1, va.l1_index(), alloc)? };
                let l3 = unsafe { self.ensure_table(l2, va.l2_index(), alloc)? };
                l3_phys = Some(l3);
            }
            let l3 = l3_phys.unwrap_or_else(|| unreachable!());

            // SAFETY: l3 came from ensure_table just above.
            let table = unsafe { self.table_at(l3) };
            table.entries[va.l3_index()] = PageTableEntry::new_page(pa, flags, kind);
        }

        barrier::dsb_ishst();
        barrier::isb();
        Ok(())
    }

    /// Walks `virt` through the table at `root` without allocating.
    ///
    /// # Safety
    ///
    /// `root` must satisfy the [`Self::map_range`] contract.
    pub unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> TranslateResult {
        let l0 = unsafe { self.table_at(root) };
        let l0e = l0.entries[virt.l0_index()];
        if !l0e.is_valid() {
            return TranslateResult::NotMapped;
        }
        assert!(l0e.is_table_or_page(), "malformed table: terminal descriptor at L0");

        let l1 = unsafe { self.table_at(l0e.address()) };
        let l1e = l1.entries[virt.l1_index()];
        if !l1e.is_valid() {
            return TranslateResult::NotMapped;
        }
        if !l1e.is_table_or_page() {
            return TranslateResult::Block1GiB {
                phys_start: l1e.address(),
                entry: l1e,
            };
        }

        let l2 = unsafe { self.table_at(l1e.address()) };
        let l2e = l2.entries[virt.l2_index()];
        if !l2e.is_valid() {
            return TranslateResult::NotMapped;
        }
        if !l2e.is_table_or_page() {
            return TranslateResult::Block2MiB {
                phys_start: l2e.address(),
                entry: l2e,
            };
        }

        let l3 = unsafe { self.table_at(l2e.address()) };
        let l3e = l3.entries[virt.l3_index()];
        if !l3e.is_valid() {
            return TranslateResult::NotMapped;
        }
        assert!(l3e.is_table_or_page(), "malformed table: block descriptor at L3");

        TranslateResult::Page4KiB {
            frame: PhysFrame::containing_address(l3e.address()),
            entry: l3e,
        }
    }

    /// Translates `virt` to a physical address, handling every terminal
    /// granularity. Returns `None` if unmapped.
    ///
    /// # Safety
    ///
    /// `root` must satisfy the [`Self::map_range`] contract.
    pub unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        match unsafe { self.translate(root, virt) } {
            TranslateResult::Page4KiB { frame, .. } => {
                Some(frame.start_address() + virt.page_offset())
            }
            TranslateResult::Block2MiB { phys_start, .. } => {
                Some(phys_start + virt.block_offset_2mib())
            }
            TranslateResult::Block1GiB { phys_start, .. } => {
                Some(phys_start + virt.block_offset_1gib())
            }
            TranslateResult::NotMapped => None,
        }
    }

    /// Translates `virt` and decodes the permissions of the matched entry.
    ///
    /// # Safety
    ///
    /// `root` must satisfy the [`Self::map_range`] contract.
    pub unsafe fn query(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        kind: TableKind,
    ) -> Result<(PhysAddr, VmFlags), MapError> {
        let (phys, entry) = match unsafe { self.translate(root, virt) } {
            TranslateResult::Page4KiB { frame, entry } => {
                (frame.start_address() + virt.page_offset(), entry)
            }
            TranslateResult::Block2MiB { phys_start, entry } => {
                (phys_start + virt.block_offset_2mib(), entry)
            }
            TranslateResult::Block1GiB { phys_start, entry } => {
                (phys_start + virt.block_offset_1gib(), entry)
            }
            TranslateResult::NotMapped => return Err(MapError::NotMapped),
        };
        Ok((phys, entry.vm_flags(kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::KERNEL_VBASE;
    use std::alloc::{Layout, alloc, dealloc};

    /// Bump arena standing in for physical memory. Page n lives at
    /// "physical" address n * 4096; the mapper offset is the arena base.
    struct TestArena {
        base: *mut u8,
        layout: Layout,
        pages: usize,
        next: usize,
    }

    impl TestArena {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * 4096, 4096).unwrap();
            let base = unsafe { alloc(layout) };
            assert!(!base.is_null());
            // Dirty the whole arena so un-zeroed tables are caught.
            unsafe { core::ptr::write_bytes(base, 0xA5, pages * 4096) };
            Self { base, layout, pages, next: 0 }
        }

        fn offset(&self) -> u64 {
            self.base as u64
        }

        fn alloc_fn(&mut self) -> impl FnMut() -> Option<PhysFrame<Size4KiB>> {
            let pages = self.pages;
            let next = &mut self.next;
            move || {
                if *next == pages {
                    return None;
                }
                let frame =
                    PhysFrame::from_start_address(PhysAddr::new((*next as u64) * 4096)).unwrap();
                *next += 1;
                Some(frame)
            }
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    /// Allocates and zeroes an L0 root, returning its physical address.
    fn make_root(arena: &mut TestArena) -> PhysAddr {
        let mapper = PageTableMapper::new(arena.offset());
        let root = arena.alloc_fn()().unwrap().start_address();
        unsafe { mapper.table_at(root).zero() };
        root
    }

    #[test]
    fn map_then_translate_single_page() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        let virt = VirtAddr::new(KERNEL_VBASE + 0x20_0000);
        unsafe {
            mapper
                .map_range(
                    root,
                    virt,
                    PhysAddr::new(0x8000),
                    4096,
                    VmFlags::READ | VmFlags::WRITE,
                    TableKind::Kernel,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            assert_eq!(
                mapper.translate_addr(root, virt + 0x123),
                Some(PhysAddr::new(0x8123))
            );
        }
    }

    #[test]
    fn unmapped_addresses_stay_unmapped() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        let virt = VirtAddr::new(KERNEL_VBASE + 0x40_0000);
        unsafe {
            mapper
                .map_range(
                    root,
                    virt,
                    PhysAddr::new(0x1_0000),
                    4096,
                    VmFlags::READ,
                    TableKind::Kernel,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            // Neighbors in the same freshly allocated leaf table must read
            // as invalid, proving new tables were zeroed.
            assert!(mapper.translate_addr(root, virt + 4096).is_none());
            assert!(mapper.translate_addr(root, virt - 4096).is_none());
            assert!(matches!(
                mapper.translate(root, VirtAddr::new(KERNEL_VBASE)),
                TranslateResult::NotMapped
            ));
        }
    }

    #[test]
    fn range_crosses_leaf_table_boundary() {
        let mut arena = TestArena::new(24);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        // Start two pages before an L3 table boundary and map four pages.
        let virt = VirtAddr::new(KERNEL_VBASE + 0x20_0000 - 2 * 4096);
        let phys = PhysAddr::new(0x10_0000);
        unsafe {
            mapper
                .map_range(
                    root,
                    virt,
                    phys,
                    4 * 4096,
                    VmFlags::READ | VmFlags::WRITE,
                    TableKind::Kernel,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            for i in 0..4u64 {
                assert_eq!(
                    mapper.translate_addr(root, virt + i * 4096),
                    Some(phys + i * 4096),
                    "page {i}"
                );
            }
        }
    }

    #[test]
    fn length_rounds_up_to_whole_pages() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        let virt = VirtAddr::new(KERNEL_VBASE);
        unsafe {
            mapper
                .map_range(
                    root,
                    virt,
                    PhysAddr::new(0x2000),
                    4097,
                    VmFlags::READ,
                    TableKind::Kernel,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            assert!(mapper.translate_addr(root, virt + 4096).is_some());
            assert!(mapper.translate_addr(root, virt + 2 * 4096).is_none());
        }
    }

    #[test]
    fn query_reports_permissions() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        let virt = VirtAddr::new(0x40_0000);
        let flags = VmFlags::READ | VmFlags::EXEC;
        unsafe {
            mapper
                .map_range(
                    root,
                    virt,
                    PhysAddr::new(0x6000),
                    4096,
                    flags,
                    TableKind::User,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            let (phys, got) = mapper.query(root, virt + 0x42, TableKind::User).unwrap();
            assert_eq!(phys, PhysAddr::new(0x6042));
            assert_eq!(got, flags);

            assert_eq!(
                mapper.query(root, virt + 4096, TableKind::User).unwrap_err(),
                MapError::NotMapped
            );
        }
    }

    #[test]
    fn out_of_table_pages_reports_oom() {
        // Root only; the first walk needs three more pages.
        let mut arena = TestArena::new(1);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        unsafe {
            let err = mapper
                .map_range(
                    root,
                    VirtAddr::new(KERNEL_VBASE),
                    PhysAddr::new(0x1000),
                    4096,
                    VmFlags::READ,
                    TableKind::Kernel,
                    &mut arena.alloc_fn(),
                )
                .unwrap_err();
            assert_eq!(err, MapError::OutOfMemory);
        }
    }

    #[test]
    fn translate_recognizes_block_mappings() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        // Hand-install a 1 GiB block at L1 and a 2 MiB block at L2, the way
        // boot identity mapping does.
        let gib_virt = VirtAddr::new(KERNEL_VBASE);
        let mib_virt = VirtAddr::new(KERNEL_VBASE + 0x4000_0000);
        unsafe {
            let mut alloc = arena.alloc_fn();
            let l1 = mapper.ensure_table(root, gib_virt.l0_index(), &mut alloc).unwrap();
            mapper.table_at(l1).entries[gib_virt.l1_index()] = PageTableEntry::new_block(
                PhysAddr::new(0x4000_0000),
                VmFlags::READ | VmFlags::WRITE,
                TableKind::Kernel,
            );
            let l2 = mapper.ensure_table(l1, mib_virt.l1_index(), &mut alloc).unwrap();
            mapper.table_at(l2).entries[mib_virt.l2_index()] = PageTableEntry::new_block(
                PhysAddr::new(0x20_0000),
                VmFlags::READ | VmFlags::WRITE,
                TableKind::Kernel,
            );

            assert!(matches!(
                mapper.translate(root, gib_virt),
                TranslateResult::Block1GiB { phys_start, .. }
                    if phys_start.as_u64() == 0x4000_0000
            ));
            assert_eq!(
                mapper.translate_addr(root, gib_virt + 0x12_3456),
                Some(PhysAddr::new(0x4000_0000 + 0x12_3456))
            );

            assert!(matches!(
                mapper.translate(root, mib_virt),
                TranslateResult::Block2MiB { phys_start, .. }
                    if phys_start.as_u64() == 0x20_0000
            ));
            assert_eq!(
                mapper.translate_addr(root, mib_virt + 0x1_0042),
                Some(PhysAddr::new(0x20_0000 + 0x1_0042))
            );
        }
    }

    #[test]
    #[should_panic(expected = "block descriptor")]
    fn mapping_over_block_panics() {
        let mut arena = TestArena::new(16);
        let mapper = PageTableMapper::new(arena.offset());
        let root = make_root(&mut arena);

        let virt = VirtAddr::new(KERNEL_VBASE);
        unsafe {
            let mut alloc = arena.alloc_fn();
            let l1 = mapper.ensure_table(root, virt.l0_index(), &mut alloc).unwrap();
            mapper.table_at(l1).entries[virt.l1_index()] = PageTableEntry::new_block(
                PhysAddr::new(0x4000_0000),
                VmFlags::READ | VmFlags::WRITE,
                TableKind::Kernel,
            );

            let _ = mapper.map_range(
                root,
                virt,
                PhysAddr::new(0x1000),
                4096,
                VmFlags::READ,
                TableKind::Kernel,
                &mut alloc,
            );
        }
    }

    #[test]
    fn separate_roots_are_independent() {
        let mut arena = TestArena::new(32);
        let mapper = PageTableMapper::new(arena.offset());
        let kernel_root = make_root(&mut arena);
        let user_root = make_root(&mut arena);

        let virt = VirtAddr::new(0x1000_0000);
        unsafe {
            mapper
                .map_range(
                    user_root,
                    virt,
                    PhysAddr::new(0x9000),
                    4096,
                    VmFlags::READ | VmFlags::WRITE,
                    TableKind::User,
                    &mut arena.alloc_fn(),
                )
                .unwrap();

            assert!(mapper.translate_addr(user_root, virt).is_some());
            assert!(mapper.translate_addr(kernel_root, virt).is_none());
        }
    }
}
