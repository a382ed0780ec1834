//! Synchronization primitives.
//!
//! Three tiers, from cheapest to most patient:
//!
//! - [`SpinLock`] — mutual exclusion with interrupts disabled; never
//!   blocks, never yields. For short critical sections only.
//! - [`SleepLock`] — yields the CPU while contended, built on the
//!   scheduler's sleep/wakeup channels. The discipline for anything that
//!   can block (disk I/O, long filesystem operations).
//! - [`Semaphore`] — user-visible counting semaphores.

pub mod semaphore;
pub mod sleeplock;
pub mod spinlock;

pub use semaphore::SemTable;
pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{pop_off, push_off, SpinLock, SpinLockGuard};
