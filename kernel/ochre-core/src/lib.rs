//! Core library for the ochre kernel, providing the foundation types shared
//! by every kernel crate: typed addresses, page/frame abstractions, spin
//! locks, logging macros, and the architecture page-table manager.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod log;
pub mod paging;
pub mod sync;
