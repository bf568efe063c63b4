//! Kernel Executive (ke)
//!
//! Synchronization primitives shared by the rest of the kernel. The
//! memory manager leans on [`spinlock::SpinLock`] for its per-frame,
//! per-pmap, and global-list mutexes.

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
