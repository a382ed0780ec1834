//! Counting semaphores, handed to user space as small integer handles.
//!
//! `sem_open` claims a slot from a fixed table and returns its index.
//! `sem_wait` sleeps on the slot's address while the count is zero;
//! `sem_signal` increments and wakes every waiter, each of which
//! re-checks the count (wakeups carry no hand-off guarantee).

use crate::error::{KernelError, KernelResult};
use crate::param::NSEM;
use crate::proc;
use crate::sync::spinlock::SpinLock;

#[derive(Clone, Copy)]
struct Sem {
    used: bool,
    value: u32,
}

/// The semaphore table. One global instance lives in this module; tests
/// construct their own.
pub struct SemTable {
    sems: SpinLock<[Sem; NSEM]>,
}

impl SemTable {
    pub const fn new() -> Self {
        Self {
            sems: SpinLock::new(
                "semtable",
                [Sem {
                    used: false,
                    value: 0,
                }; NSEM],
            ),
        }
    }

    /// Sleep channel for slot `id`: the slot's address within the table.
    fn chan(&self, id: usize) -> usize {
        self as *const _ as usize + id
    }

    /// Claim a free slot with the given initial count.
    pub fn open(&self, init_value: u32) -> KernelResult<usize> {
        let mut sems = self.sems.lock();
        for (id, sem) in sems.iter_mut().enumerate() {
            if !sem.used {
                sem.used = true;
                sem.value = init_value;
                return Ok(id);
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "semaphores",
        })
    }

    /// Decrement the count, sleeping while it is zero.
    ///
    /// Returns `Err(Interrupted)` if the process was killed while
    /// waiting.
    pub fn wait(&self, id: usize) -> KernelResult<()> {
        let mut sems = self.sems.lock();
        if id >= NSEM || !sems[id].used {
            return Err(KernelError::InvalidArgument { name: "sem_id" });
        }
        while sems[id].value == 0 {
            sems = proc::sleep(self.chan(id), sems);
            if proc::current_killed() {
                return Err(KernelError::Interrupted);
            }
        }
        sems[id].value -= 1;
        Ok(())
    }

    /// Increment the count and wake every waiter.
    pub fn signal(&self, id: usize) -> KernelResult<()> {
        {
            let mut sems = self.sems.lock();
            if id >= NSEM || !sems[id].used {
                return Err(KernelError::InvalidArgument { name: "sem_id" });
            }
            sems[id].value += 1;
        }
        proc::wakeup(self.chan(id));
        Ok(())
    }
}

/// Global semaphore table backing the sem_* syscalls.
static SEM_TABLE: SemTable = SemTable::new();

/// The global semaphore table.
pub fn table() -> &'static SemTable {
    &SEM_TABLE
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn open_returns_distinct_handles() {
        let t = SemTable::new();
        let a = t.open(1).expect("first slot should be free");
        let b = t.open(0).expect("second slot should be free");
        assert_ne!(a, b);
    }

    #[test]
    fn wait_consumes_and_signal_restores() {
        let t = SemTable::new();
        let id = t.open(2).expect("open should succeed");
        t.wait(id).expect("count 2 -> no blocking");
        t.wait(id).expect("count 1 -> no blocking");
        t.signal(id).expect("signal should succeed");
        t.wait(id).expect("count restored to 1");
    }

    #[test]
    fn bad_handle_is_rejected() {
        let t = SemTable::new();
        assert!(t.wait(0).is_err(), "unopened slot must be rejected");
        assert!(t.signal(NSEM).is_err(), "out-of-range id must be rejected");
    }

    #[test]
    fn table_exhaustion_reported() {
        let t = SemTable::new();
        for _ in 0..NSEM {
            t.open(0).expect("slots up to NSEM should open");
        }
        assert_eq!(
            t.open(0),
            Err(KernelError::ResourceExhausted {
                resource: "semaphores"
            })
        );
    }
}
