//! aarch64 support: translation tables, barriers, and address-space layout.

pub mod barrier;
pub mod paging;

/// Base of the kernel direct map of physical memory (TTBR1 high half).
///
/// Physical address `p` is accessible at virtual address `KERNEL_VBASE + p`
/// once the boot identity map is up. All pointer conversions in the memory
/// core go through this offset.
pub const KERNEL_VBASE: u64 = 0xFFFF_FF00_0000_0000;
