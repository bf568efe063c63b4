//! Kernel Spinlock Implementation
//!
//! Spinlocks provide mutual exclusion for short critical sections.
//! They busy-wait (spin) until the lock becomes available.
//!
//! Interrupts are disabled while a lock is held so that an interrupt
//! handler cannot deadlock against its own CPU. The interrupt toggling
//! goes through `hal::cpu`, so the same lock works on bare metal and
//! under the host test harness.
//!
//! # Usage
//! ```ignore
//! let lock = SpinLock::new(data);
//! let guard = lock.lock();
//! // ... critical section ...
//! // guard dropped, lock released
//! ```

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::cpu;

/// A spinlock for mutual exclusion
pub struct SpinLock<T> {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// Protected data
    data: UnsafeCell<T>,
}

// SpinLock is Sync if T is Send (data can be sent between threads)
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the spinlock, returning a guard that releases on drop
    ///
    /// Interrupts are disabled while the lock is held to prevent
    /// deadlock from interrupt handlers trying to acquire the same lock.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts_enabled = cpu::intr_save();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            interrupts_enabled,
        }
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns Some(guard) if successful, None if the lock is held
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let interrupts_enabled = cpu::intr_save();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                interrupts_enabled,
            })
        } else {
            cpu::intr_restore(interrupts_enabled);
            None
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard for spinlock
///
/// Releases the lock and restores interrupt state when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    interrupts_enabled: bool,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        cpu::intr_restore(self.interrupts_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_basic() {
        let lock = SpinLock::new(5u32);
        assert!(!lock.is_locked());

        {
            let mut guard = lock.lock();
            assert!(lock.is_locked());
            *guard += 1;
        }

        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(());

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none()); // Should fail

        drop(guard);
        assert!(lock.try_lock().is_some()); // Should succeed now
    }
}
