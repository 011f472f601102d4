//! Page-size traits and the typed physical-frame abstraction.
//!
//! The aarch64 4 KiB granule yields three mapping granularities: 4 KiB leaf
//! pages (L3), 2 MiB blocks (L2) and 1 GiB blocks (L1). [`PhysFrame<S>`]
//! carries the granularity in its type so a frame of one size cannot be
//! passed where another is expected.

use core::fmt;
use core::marker::PhantomData;

use crate::addr::PhysAddr;

/// Trait implemented by the supported mapping granularities.
pub trait PageSize: Copy + Eq + PartialOrd + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const SIZE_AS_DEBUG_STR: &'static str;
}

/// 4 KiB page size (L3 leaf entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 4096;
    const SIZE_AS_DEBUG_STR: &'static str = "4KiB";
}

/// 2 MiB block size (terminal L2 entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size2MiB;

impl PageSize for Size2MiB {
    const SIZE: u64 = 0x20_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "2MiB";
}

/// 1 GiB block size (terminal L1 entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size1GiB;

impl PageSize for Size1GiB {
    const SIZE: u64 = 0x4000_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "1GiB";
}

/// A physical memory frame of size `S`.
///
/// The contained [`PhysAddr`] is always aligned to `S::SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame<S: PageSize> {
    start: PhysAddr,
    _marker: PhantomData<S>,
}

/// Error returned when an address is not aligned to the frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

impl<S: PageSize> PhysFrame<S> {
    /// Returns the frame containing the given physical address (aligns down).
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a frame from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Returns the frame size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }
}

impl<S: PageSize> fmt::Debug for PhysFrame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysFrame[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_containing_address_aligns_down() {
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x5678));
        assert_eq!(frame.start_address().as_u64(), 0x5000);
        assert_eq!(frame.size(), 4096);
    }

    #[test]
    fn frame_from_aligned_start() {
        let frame = PhysFrame::<Size4KiB>::from_start_address(PhysAddr::new(0x3000));
        assert_eq!(frame.unwrap().start_address().as_u64(), 0x3000);
    }

    #[test]
    fn frame_from_unaligned_start_rejected() {
        let frame = PhysFrame::<Size4KiB>::from_start_address(PhysAddr::new(0x3001));
        assert_eq!(frame.unwrap_err(), AddressNotAligned);
    }

    #[test]
    fn block_frame_sizes() {
        let two_mib = PhysFrame::<Size2MiB>::containing_address(PhysAddr::new(0x30_0000));
        assert_eq!(two_mib.start_address().as_u64(), 0x20_0000);
        let one_gib = PhysFrame::<Size1GiB>::containing_address(PhysAddr::new(0x5000_0000));
        assert_eq!(one_gib.start_address().as_u64(), 0x4000_0000);
    }
}
