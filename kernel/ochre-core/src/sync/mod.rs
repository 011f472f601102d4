//! Synchronization primitives.
//!
//! The memory core never blocks on I/O; the only waiting anywhere is the
//! bounded spin in [`SpinLock::lock`].

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
