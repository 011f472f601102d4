//! aarch64 stage-1 translation-table structures (4 KiB granule, 48-bit VA).
//!
//! A table walk descends L0 -> L1 -> L2 -> L3. At L0..L2 an entry with bit 1
//! set references the next-level table; with bit 1 clear it is a terminal
//! block (1 GiB at L1, 2 MiB at L2). At L3 bit 1 must be set and the entry
//! is a 4 KiB page. The high-level [`VmFlags`] / [`TableKind`] pair encodes
//! into and decodes from the hardware bits here, so the mapper never touches
//! raw descriptor layout.

mod mapper;

pub use mapper::{PageTableMapper, TranslateResult};

use crate::addr::PhysAddr;

/// Output-address field of a descriptor: bits 12..47.
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Number of entries in a translation table.
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags::bitflags! {
    /// Single-bit descriptor flags.
    ///
    /// Multi-bit fields (AttrIndx, AP, SH) are encoded by [`MemAttr`],
    /// [`AccessPerm`] and [`Shareability`] rather than named here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Descriptor is valid.
        const VALID       = 1 << 0;
        /// Table descriptor at L0..L2; page descriptor at L3.
        const TABLE_OR_PAGE = 1 << 1;
        /// Access flag. Pre-set on every mapping so the hardware never
        /// raises an access-flag fault.
        const ACCESS_FLAG = 1 << 10;
        /// Not global: the mapping is tagged with the current ASID.
        const NOT_GLOBAL  = 1 << 11;
        /// Privileged execute-never.
        const PXN         = 1 << 53;
        /// Unprivileged execute-never.
        const UXN         = 1 << 54;
    }
}

/// MAIR attribute index (descriptor bits 2..4).
///
/// The index values match the MAIR_EL1 layout programmed by boot code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MemAttr {
    /// Device-nGnRnE.
    Device = 0,
    /// Normal memory, inner and outer non-cacheable.
    NormalNoCache = 3,
    /// Normal memory, inner and outer write-back cacheable.
    Normal = 4,
}

impl MemAttr {
    const fn bits(self) -> u64 {
        (self as u64) << 2
    }
}

/// Data access permissions (descriptor bits 6..7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum AccessPerm {
    /// Read-write at EL1 and EL0.
    ReadWrite = 0b01,
    /// Read-only at EL1 and EL0.
    ReadOnly = 0b11,
}

impl AccessPerm {
    const fn bits(self) -> u64 {
        (self as u64) << 6
    }
}

/// Shareability field (descriptor bits 8..9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Shareability {
    /// Non-shareable (device memory).
    None = 0b00,
    /// Inner shareable (normal memory visible to all cores).
    Inner = 0b11,
}

impl Shareability {
    const fn bits(self) -> u64 {
        (self as u64) << 8
    }
}

bitflags::bitflags! {
    /// Architecture-independent mapping permissions and attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u64 {
        /// Mapping is readable.
        const READ    = 1 << 0;
        /// Mapping is writable.
        const WRITE   = 1 << 1;
        /// Mapping is executable (at the table's own privilege class).
        const EXEC    = 1 << 2;
        /// Device memory; implies uncached and non-shareable.
        const DEVICE  = 1 << 3;
        /// Normal memory with caching disabled.
        const NOCACHE = 1 << 4;
    }
}

/// Which half of the address space a table serves.
///
/// The two classes differ only in execute-never polarity: kernel tables
/// never allow EL0 execution, user tables never allow EL1 execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// TTBR1 high-half table.
    Kernel,
    /// TTBR0 low-half table.
    User,
}

/// Errors from mapping and translation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page allocator could not provide an intermediate table page.
    OutOfMemory,
    /// The virtual address has no mapping.
    NotMapped,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory for page-table pages"),
            Self::NotMapped => f.write_str("virtual address not mapped"),
        }
    }
}

/// A single 64-bit translation-table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An invalid (unmapped) descriptor.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a table descriptor referencing the next-level table at `next`.
    pub const fn new_table(next: PhysAddr) -> Self {
        Self((next.as_u64() & PTE_ADDR_MASK) | PteFlags::VALID.bits() | PteFlags::TABLE_OR_PAGE.bits())
    }

    /// Creates an L3 page descriptor mapping `frame` with the given
    /// permissions for a table of the given kind.
    ///
    /// # Panics
    ///
    /// Panics on a write-only request: the hardware AP field has no encoding
    /// for it, so asking is a caller contract violation.
    pub fn new_page(frame: PhysAddr, flags: VmFlags, kind: TableKind) -> Self {
        Self(
            (frame.as_u64() & PTE_ADDR_MASK)
                | PteFlags::TABLE_OR_PAGE.bits()
                | Self::encode_common(flags, kind),
        )
    }

    /// Creates a terminal block descriptor (1 GiB at L1, 2 MiB at L2).
    ///
    /// Block mappings are only produced by boot-time identity mapping;
    /// the regular mapper emits 4 KiB pages exclusively.
    pub fn new_block(frame: PhysAddr, flags: VmFlags, kind: TableKind) -> Self {
        Self((frame.as_u64() & PTE_ADDR_MASK) | Self::encode_common(flags, kind))
    }

    /// Bits shared by page and block descriptors: valid, AF, nG, AP,
    /// AttrIndx, SH, and the execute-never pair.
    fn encode_common(flags: VmFlags, kind: TableKind) -> u64 {
        let ap = match (flags.contains(VmFlags::READ), flags.contains(VmFlags::WRITE)) {
            (true, true) => AccessPerm::ReadWrite,
            (true, false) => AccessPerm::ReadOnly,
            _ => panic!("unrepresentable access permissions: {flags:?}"),
        };

        let (attr, sh) = if flags.contains(VmFlags::DEVICE) {
            (MemAttr::Device, Shareability::None)
        } else if flags.contains(VmFlags::NOCACHE) {
            (MemAttr::NormalNoCache, Shareability::Inner)
        } else {
            (MemAttr::Normal, Shareability::Inner)
        };

        let xn = match kind {
            TableKind::Kernel if flags.contains(VmFlags::EXEC) => PteFlags::UXN,
            TableKind::Kernel => PteFlags::UXN | PteFlags::PXN,
            TableKind::User if flags.contains(VmFlags::EXEC) => PteFlags::PXN,
            TableKind::User => PteFlags::PXN | PteFlags::UXN,
        };

        PteFlags::VALID.bits()
            | PteFlags::ACCESS_FLAG.bits()
            | PteFlags::NOT_GLOBAL.bits()
            | ap.bits()
            | attr.bits()
            | sh.bits()
            | xn.bits()
    }

    /// Returns the raw descriptor bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if the valid bit is set.
    pub const fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Returns `true` if this is a valid descriptor with bit 1 set: a
    /// next-level table at L0..L2, a 4 KiB page at L3.
    pub const fn is_table_or_page(self) -> bool {
        self.is_valid() && self.0 & PteFlags::TABLE_OR_PAGE.bits() != 0
    }

    /// Returns the output address (bits 12..47).
    pub const fn address(self) -> PhysAddr {
        // SAFETY: The masked value fits in 48 bits.
        unsafe { PhysAddr::new_unchecked(self.0 & PTE_ADDR_MASK) }
    }

    /// Returns the single-bit flags of this descriptor.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Decodes the [`VmFlags`] of a terminal descriptor.
    ///
    /// The execute bit depends on which table class the entry belongs to,
    /// so the caller supplies the [`TableKind`].
    pub fn vm_flags(self, kind: TableKind) -> VmFlags {
        let mut flags = VmFlags::READ;
        if (self.0 >> 6) & 0b11 == AccessPerm::ReadWrite as u64 {
            flags |= VmFlags::WRITE;
        }
        match (self.0 >> 2) & 0b111 {
            x if x == MemAttr::Device as u64 => flags |= VmFlags::DEVICE,
            x if x == MemAttr::NormalNoCache as u64 => flags |= VmFlags::NOCACHE,
            _ => {}
        }
        let xn = match kind {
            TableKind::Kernel => PteFlags::PXN,
            TableKind::User => PteFlags::UXN,
        };
        if !self.flags().contains(xn) {
            flags |= VmFlags::EXEC;
        }
        flags
    }
}

/// A 4 KiB-aligned translation table of 512 descriptors.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 descriptors of this table.
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Invalidates every descriptor.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}
