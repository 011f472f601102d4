//! Memory barriers and translation-table base register access.
//!
//! New mappings written to an in-memory table must be made visible to the
//! walker before any instruction depends on them: a `dsb ishst` orders the
//! stores, an `isb` resynchronizes the pipeline. Freshly created mappings
//! need no TLB invalidation because an unmapped VA cannot have a stale entry.
//!
//! On non-aarch64 hosts these are no-ops so the paging code can be unit
//! tested with tables in ordinary memory.

use crate::addr::PhysAddr;

/// Data synchronization barrier, inner-shareable, stores only.
#[inline]
pub fn dsb_ishst() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: A barrier has no side effects beyond ordering.
    unsafe {
        core::arch::asm!("dsb ishst", options(nostack, preserves_flags));
    }
}

/// Instruction synchronization barrier.
#[inline]
pub fn isb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: A barrier has no side effects beyond ordering.
    unsafe {
        core::arch::asm!("isb", options(nostack, preserves_flags));
    }
}

/// Installs `root` as the user (low half, TTBR0) translation-table base.
///
/// # Safety
///
/// `root` must be the physical address of a valid L0 table whose mappings
/// remain live for as long as it is installed. The caller is responsible for
/// any TLB maintenance the switch requires (e.g. when the new table reuses
/// an ASID with different mappings).
#[allow(unused_variables)]
pub unsafe fn set_user_page_table(root: PhysAddr) {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: Per the function contract, root points to a valid L0 table.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {0}",
            "isb",
            in(reg) root.as_u64(),
            options(nostack, preserves_flags),
        );
    }
}
