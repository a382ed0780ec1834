//! Sleep locks: long-term locks that yield the CPU while contended.
//!
//! A contended acquire parks the process on the lock's address as a sleep
//! channel; release wakes every sleeper and each re-checks the flag. The
//! flag itself is guarded by a spinlock so the check-then-sleep step
//! cannot lose a wakeup to an interrupt arriving in between.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::proc;
use crate::sync::spinlock::SpinLock;

struct LockState {
    locked: bool,
    /// pid of the holder, 0 when free. Diagnostic only.
    holder: i32,
}

/// The bare locking discipline, without a protected value.
///
/// Used where the guarded state cannot live inside the lock object (the
/// write-ahead log holds its own state and brackets whole filesystem
/// operations between acquire and release).
pub struct RawSleepLock {
    state: SpinLock<LockState>,
    name: &'static str,
}

impl RawSleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            state: SpinLock::new(name, LockState {
                locked: false,
                holder: 0,
            }),
            name,
        }
    }

    /// Sleep channel identifying this lock.
    fn chan(&self) -> usize {
        self as *const _ as usize
    }

    /// Acquire, sleeping while another holder has the lock.
    pub fn acquire(&self) {
        let mut st = self.state.lock();
        while st.locked {
            st = proc::sleep(self.chan(), st);
        }
        st.locked = true;
        st.holder = proc::current_pid().unwrap_or(0);
    }

    /// Release and wake every process sleeping on this lock.
    pub fn release(&self) {
        {
            let mut st = self.state.lock();
            if !st.locked {
                panic!("sleeplock {}: release while free", self.name);
            }
            st.locked = false;
            st.holder = 0;
        }
        proc::wakeup(self.chan());
    }

    /// Does the current process hold this lock? Diagnostic only.
    pub fn holding(&self) -> bool {
        let st = self.state.lock();
        st.locked && proc::current_pid().map_or(false, |pid| pid == st.holder)
    }
}

/// A sleep lock protecting a value of type `T`.
pub struct SleepLock<T> {
    raw: RawSleepLock,
    value: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes all access to the inner value exactly
// like a mutex; guards borrow the lock.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            raw: RawSleepLock::new(name),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, sleeping while contended.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.raw.acquire();
        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }
}

/// RAII guard for [`SleepLock`].
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the sleep lock is held for the guard's lifetime, so no
        // other reference to the value exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_round_trips() {
        let lock = SleepLock::new("buf", [0u8; 8]);
        {
            let mut g = lock.lock();
            g[0] = 0xAA;
        }
        assert_eq!(lock.lock()[0], 0xAA);
    }

    #[test]
    fn raw_lock_tracks_state() {
        let raw = RawSleepLock::new("log");
        raw.acquire();
        raw.release();
        raw.acquire();
        raw.release();
    }
}
