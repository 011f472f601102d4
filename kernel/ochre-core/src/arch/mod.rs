//! Architecture-specific code.
//!
//! Only aarch64 is supported. The paging structures are plain data and build
//! on any host, which is what the unit tests rely on; the handful of
//! instructions that only exist on the target (barriers, the TTBR0 write)
//! compile to no-ops elsewhere.

pub mod aarch64;
