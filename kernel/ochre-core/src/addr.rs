//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] are newtypes that keep virtual and physical
//! addresses from being mixed up at the type level. The virtual flavor
//! enforces aarch64 canonical form (48-bit VA, sign-extended from bit 47, so
//! an address is either in the TTBR0 low half `0x0000_…` or the TTBR1 high
//! half `0xFFFF_…`); the physical flavor is masked to the 48-bit output
//! address space used by the 4 KiB-granule descriptors.

use core::fmt;
use core::ops::{Add, Sub};

/// Physical address space mask: bits 0..47.
const PHYS_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Mask for the 12-bit page offset.
const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// Mask for a 9-bit translation-table index (all four levels).
const TABLE_INDEX_MASK: usize = 0x1FF;

/// A canonical 64-bit virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address (masked to 48 bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl VirtAddr {
    /// Creates a new `VirtAddr`, asserting the address is already canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(
            canonical.0 == addr,
            "VirtAddr::new: address is not canonical"
        );
        canonical
    }

    /// Creates a new `VirtAddr`, forcing canonical form by sign-extending
    /// from bit 47.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this address to a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the L0 translation-table index (bits 39..47).
    #[inline]
    pub const fn l0_index(self) -> usize {
        ((self.0 >> 39) as usize) & TABLE_INDEX_MASK
    }

    /// Returns the L1 translation-table index (bits 30..38).
    #[inline]
    pub const fn l1_index(self) -> usize {
        ((self.0 >> 30) as usize) & TABLE_INDEX_MASK
    }

    /// Returns the L2 translation-table index (bits 21..29).
    #[inline]
    pub const fn l2_index(self) -> usize {
        ((self.0 >> 21) as usize) & TABLE_INDEX_MASK
    }

    /// Returns the L3 translation-table index (bits 12..20).
    #[inline]
    pub const fn l3_index(self) -> usize {
        ((self.0 >> 12) as usize) & TABLE_INDEX_MASK
    }

    /// Returns the offset within a 1 GiB block (bits 0..29), the remainder
    /// left by a terminal L1 entry.
    #[inline]
    pub const fn block_offset_1gib(self) -> u64 {
        self.0 & 0x3FFF_FFFF
    }

    /// Returns the offset within a 2 MiB block (bits 0..20), the remainder
    /// left by a terminal L2 entry.
    #[inline]
    pub const fn block_offset_2mib(self) -> u64 {
        self.0 & 0x1F_FFFF
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl PhysAddr {
    /// Creates a new `PhysAddr`, asserting the address fits in 48 bits.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let masked = addr & PHYS_ADDR_MASK;
        assert!(
            masked == addr,
            "PhysAddr::new: address exceeds the 48-bit physical address space"
        );
        Self(masked)
    }

    /// Creates a new `PhysAddr`, truncating to 48 bits.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Creates a new `PhysAddr` without any validation.
    ///
    /// # Safety
    ///
    /// The caller must ensure `addr` fits within 48 bits.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_low_half_canonical() {
        let addr = VirtAddr::new(0x0000_7F12_3456_7000);
        assert_eq!(addr.as_u64(), 0x0000_7F12_3456_7000);
    }

    #[test]
    fn virt_addr_high_half_canonical() {
        // The kernel direct-map base is a canonical high-half address.
        let addr = VirtAddr::new(0xFFFF_FF00_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_FF00_0000_0000);
    }

    #[test]
    fn virt_addr_truncate_sign_extends() {
        // Bit 47 set → bits 48..63 must follow.
        let addr = VirtAddr::new_truncate(0x0000_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn virt_addr_alignment() {
        let addr = VirtAddr::new(0x1234);
        assert!(!addr.is_aligned(4096));
        assert_eq!(addr.align_down(4096).as_u64(), 0x1000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x2000);
        assert_eq!(addr.align_up(2).as_u64(), 0x1234);
    }

    #[test]
    fn virt_addr_table_indices() {
        // 0xFFFF_FF00_0000_0000: bits 39..47 = 0x1FE, lower indices 0.
        let base = VirtAddr::new(0xFFFF_FF00_0000_0000);
        assert_eq!(base.l0_index(), 0x1FE);
        assert_eq!(base.l1_index(), 0);
        assert_eq!(base.l2_index(), 0);
        assert_eq!(base.l3_index(), 0);

        let addr = base + (5 << 30) + (7 << 21) + (9 << 12) + 0x123;
        assert_eq!(addr.l1_index(), 5);
        assert_eq!(addr.l2_index(), 7);
        assert_eq!(addr.l3_index(), 9);
        assert_eq!(addr.page_offset(), 0x123);
    }

    #[test]
    fn virt_addr_block_offsets() {
        let addr = VirtAddr::new((3 << 30) | 0x0012_3456);
        assert_eq!(addr.block_offset_1gib(), 0x0012_3456);
        assert_eq!(addr.block_offset_2mib(), 0x0012_3456 & 0x1F_FFFF);
    }

    #[test]
    fn virt_addr_arithmetic() {
        let addr = VirtAddr::new(0x4000);
        assert_eq!((addr + 0x800).as_u64(), 0x4800);
        assert_eq!((addr - 0x800).as_u64(), 0x3800);
        assert_eq!(addr - VirtAddr::new(0x1000), 0x3000);
    }

    #[test]
    fn phys_addr_masks_to_48_bits() {
        let addr = PhysAddr::new_truncate(u64::MAX);
        assert_eq!(addr.as_u64(), PHYS_ADDR_MASK);
    }

    #[test]
    fn phys_addr_alignment() {
        let addr = PhysAddr::new(0x3456);
        assert!(!addr.is_aligned(4096));
        assert_eq!(addr.align_down(4096).as_u64(), 0x3000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x4000);
    }

    #[test]
    fn phys_addr_arithmetic() {
        let addr = PhysAddr::new(0x2000);
        assert_eq!((addr + 0x100).as_u64(), 0x2100);
        assert_eq!((addr - 0x100).as_u64(), 0x1F00);
        assert_eq!(addr - PhysAddr::new(0x1000), 0x1000);
    }
}
