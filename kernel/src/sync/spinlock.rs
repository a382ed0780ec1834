//! Spinlock with interrupt-depth tracking.
//!
//! Acquiring disables interrupts on this hart before touching the lock
//! word, so a critical section can never be re-entered from an interrupt
//! handler. Disable requests nest: `push_off` remembers the enable state
//! at the outermost level and `pop_off` restores it only when the nesting
//! count returns to zero.
//!
//! On the single bare-metal hart a contended acquire is by definition a
//! re-acquisition bug (nobody else could hold the lock while interrupts
//! are off), so it panics. Hosted unit tests run threads, so there the
//! lock really spins.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

#[cfg(target_os = "none")]
mod depth {
    //! Per-hart interrupt-off nesting state. Single hart, so a static.

    use core::cell::Cell;

    struct HartState {
        /// Depth of push_off nesting.
        noff: Cell<i32>,
        /// Interrupt-enable state before the outermost push_off.
        intena: Cell<bool>,
    }

    // SAFETY: the kernel runs one hart and every access happens with
    // interrupts disabled, so no concurrent access is possible.
    unsafe impl Sync for HartState {}

    static HART: HartState = HartState {
        noff: Cell::new(0),
        intena: Cell::new(false),
    };

    pub fn enter(prior_enable: bool) {
        if HART.noff.get() == 0 {
            HART.intena.set(prior_enable);
        }
        HART.noff.set(HART.noff.get() + 1);
    }

    /// Returns true if the caller should re-enable interrupts.
    pub fn leave() -> bool {
        let n = HART.noff.get() - 1;
        if n < 0 {
            panic!("pop_off: unbalanced");
        }
        HART.noff.set(n);
        n == 0 && HART.intena.get()
    }

    pub fn save() -> (i32, bool) {
        (HART.noff.get(), HART.intena.get())
    }

    pub fn restore(state: (i32, bool)) {
        HART.noff.set(state.0);
        HART.intena.set(state.1);
    }

    pub fn count() -> i32 {
        HART.noff.get()
    }
}

#[cfg(not(target_os = "none"))]
mod depth {
    //! Hosted variant: per-thread nesting so parallel tests don't share
    //! a counter.

    use core::cell::Cell;

    std::thread_local! {
        static NOFF: Cell<i32> = const { Cell::new(0) };
        static INTENA: Cell<bool> = const { Cell::new(false) };
    }

    pub fn enter(prior_enable: bool) {
        NOFF.with(|noff| {
            if noff.get() == 0 {
                INTENA.with(|i| i.set(prior_enable));
            }
            noff.set(noff.get() + 1);
        });
    }

    pub fn leave() -> bool {
        NOFF.with(|noff| {
            let n = noff.get() - 1;
            if n < 0 {
                panic!("pop_off: unbalanced");
            }
            noff.set(n);
            n == 0 && INTENA.with(|i| i.get())
        })
    }

    pub fn save() -> (i32, bool) {
        (NOFF.with(|n| n.get()), INTENA.with(|i| i.get()))
    }

    pub fn restore(state: (i32, bool)) {
        NOFF.with(|n| n.set(state.0));
        INTENA.with(|i| i.set(state.1));
    }

    pub fn count() -> i32 {
        NOFF.with(|n| n.get())
    }
}

/// Disable interrupts and push one level of the interrupt-off stack.
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    depth::enter(old);
}

/// Pop one level; re-enable interrupts only at the outermost pop when
/// they were enabled before the outermost push.
pub fn pop_off() {
    if arch::intr_get() {
        panic!("pop_off: interruptible");
    }
    if depth::leave() {
        arch::intr_on();
    }
}

/// Snapshot the interrupt-off nesting state. The scheduler saves this
/// around a context switch because the switched-to kernel path has its
/// own nesting depth.
pub fn intr_depth_save() -> (i32, bool) {
    depth::save()
}

/// Restore a snapshot taken by [`intr_depth_save`].
pub fn intr_depth_restore(state: (i32, bool)) {
    depth::restore(state)
}

/// Current push_off nesting depth (diagnostic).
pub fn intr_depth() -> i32 {
    depth::count()
}

/// A mutual-exclusion lock protecting `T`, held with interrupts off.
pub struct SpinLock<T> {
    locked: AtomicBool,
    name: &'static str,
    value: UnsafeCell<T>,
}

// SAFETY: the lock word serializes all access to the inner value, and
// the guard borrows the lock, so `&SpinLock<T>` can be shared between
// contexts whenever the protected value itself can be sent.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts for the guard's lifetime.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // One hart with interrupts off: the only way the word can be
            // set is that we set it ourselves.
            #[cfg(target_os = "none")]
            panic!("spinlock {}: re-acquisition", self.name);

            #[cfg(not(target_os = "none"))]
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Is the lock currently held? Diagnostic only.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// RAII guard; releases the lock and pops the interrupt-off stack on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard belongs to. Lets sleep() re-acquire after the
    /// guard has been dropped across a context switch.
    pub(crate) fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the lock word is set and no
        // other reference to the value exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; the guard is unique while held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        pop_off();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn guards_value_and_restores_interrupts() {
        let lock = SpinLock::new("test", 7u32);
        crate::arch::intr_on();
        {
            let mut g = lock.lock();
            assert!(!crate::arch::intr_get(), "interrupts stay off inside");
            *g += 1;
        }
        assert!(crate::arch::intr_get(), "outermost pop_off restores");
        assert_eq!(*lock.lock(), 8);
        crate::arch::intr_off();
    }

    #[test]
    fn nesting_restores_only_at_outermost() {
        let a = SpinLock::new("a", ());
        let b = SpinLock::new("b", ());
        crate::arch::intr_on();
        let ga = a.lock();
        let gb = b.lock();
        drop(gb);
        assert!(
            !crate::arch::intr_get(),
            "inner release must not re-enable interrupts"
        );
        drop(ga);
        assert!(crate::arch::intr_get());
        crate::arch::intr_off();
    }

    #[test]
    fn excludes_across_threads() {
        use std::sync::Arc;

        let lock = Arc::new(SpinLock::new("counter", 0u64));
        let mut handles = std::vec::Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("worker thread should not panic");
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
