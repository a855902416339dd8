// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary semaphore with FIFO waiters and timeout.
//!
//! The permit count lives in a single atomic word, so an uncontended wait
//! is one compare-and-swap. Contended waits park the task on a FIFO and
//! rely on *handoff*: a signal that finds a waiter passes the permit
//! straight to the FIFO head through its `wake_signal`, without routing
//! it through the shared count. A task that calls `wait` between the
//! signal and the woken waiter's next turn therefore cannot steal the
//! permit, and the woken waiter succeeds unconditionally on its next run.
//!
//! `signal` is safe to call from interrupt handlers configured at or
//! numerically above the maximum-syscall priority. `wait` with a nonzero
//! timeout assumes task context.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{KernelError, TaskState};

use crate::arch;
use crate::kcell::KCell;
use crate::list::List;
use crate::startup::{with_kernel, Kernel};
use crate::task::Task;
use crate::time::{Ticks, MAX_DELAY};

pub struct Semaphore {
    /// 0 or 1. Only ever 1 while no waiter exists.
    available: AtomicU32,
    waiters: KCell<List<Task>>,
}

impl Semaphore {
    pub const fn new(initially_available: bool) -> Self {
        Self {
            available: AtomicU32::new(initially_available as u32),
            waiters: KCell::new(List::new()),
        }
    }

    /// Consumes the permit if one is present.
    fn try_acquire(&self) -> bool {
        self.available
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Waits for the permit, up to `timeout_ticks`. Zero means a single
    /// try; expiry reports `SemaphoreTimeout`.
    pub fn wait(&self, timeout_ticks: u32) -> Result<(), KernelError> {
        if timeout_ticks > MAX_DELAY {
            return Err(KernelError::BadParameter);
        }
        if self.try_acquire() {
            return Ok(());
        }
        if timeout_ticks == 0 {
            return Err(KernelError::SemaphoreTimeout);
        }

        let deadline = arch::now().offset(timeout_ticks);
        if with_kernel(|k| self.begin_wait(k, deadline))? {
            return Ok(());
        }
        loop {
            // Control returns here each time the scheduler runs us again:
            // either a signal handed us the permit, or our timeout
            // promoted us.
            if let Some(result) = with_kernel(|k| self.finish_wait(k, arch::now(), deadline)) {
                return result;
            }
            arch::pend_context_switch();
        }
    }

    /// Posts the permit. Hands it to the FIFO-head waiter when one
    /// exists; `SemaphoreBusy` when the semaphore is already set.
    pub fn signal(&self) -> Result<(), KernelError> {
        with_kernel(|k| self.signal_in(k))
    }

    /// Lock-held phase of `wait`: retries the acquire (a signal may have
    /// landed since the fast path) and otherwise parks the caller.
    /// Returns whether the permit was acquired outright.
    fn begin_wait(&self, k: &mut Kernel, deadline: Ticks) -> Result<bool, KernelError> {
        if self.try_acquire() {
            return Ok(true);
        }
        // Safety: kernel lock held by `with_kernel`.
        let waiters = unsafe { self.waiters.get_mut() };
        k.block_current(waiters, TaskState::BlockedOnSemaphore, deadline, 0)?;
        Ok(false)
    }

    /// Lock-held resume phase of `wait`: consumes a handoff or a timeout.
    /// `None` means neither has happened yet.
    fn finish_wait(
        &self,
        k: &mut Kernel,
        now: Ticks,
        deadline: Ticks,
    ) -> Option<Result<(), KernelError>> {
        let cur = match k.current_ptr() {
            Some(c) => c,
            None => return Some(Err(KernelError::BadParameter)),
        };
        // Safety: the current task is live; kernel lock held.
        let task = unsafe { &mut *cur.as_ptr() };
        if task.take_wake_signal() {
            return Some(Ok(()));
        }
        if now.has_reached(deadline) {
            if !task.blocked_on.is_null() {
                // Safety: non-null `blocked_on` is this semaphore's
                // waiter list, which holds the task.
                unsafe {
                    (*task.blocked_on).remove(&mut k.heap, cur);
                }
                task.blocked_on = core::ptr::null_mut();
            }
            return Some(Err(KernelError::SemaphoreTimeout));
        }
        None
    }

    pub(crate) fn signal_in(&self, k: &mut Kernel) -> Result<(), KernelError> {
        // Safety: kernel lock held by the caller.
        let waiters = unsafe { self.waiters.get_mut() };
        if k.wake_one(waiters).is_some() {
            // Handoff: the permit went straight to the woken task; the
            // shared count stays 0.
            return Ok(());
        }
        if self.available.swap(1, Ordering::Release) == 1 {
            return Err(KernelError::SemaphoreBusy);
        }
        Ok(())
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        // Safety: single-threaded test.
        unsafe { self.waiters.get_mut().len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_support::fresh_kernel;
    use core::ptr::{null_mut, NonNull};

    fn nop_entry(_: *mut ()) {}

    fn spawn_running(k: &mut Kernel, name: &str) -> NonNull<Task> {
        let t = k
            .create_task(nop_entry, name, 128, null_mut(), 4)
            .unwrap()
            .raw();
        k.current = Some(t);
        // Safety: single-threaded test, task is live.
        unsafe {
            (*t.as_ptr()).state = TaskState::Running;
        }
        t
    }

    #[test]
    fn uncontended_wait_consumes_the_permit() {
        let sem = Semaphore::new(true);
        assert_eq!(sem.wait(0), Ok(()));
        assert_eq!(sem.wait(0), Err(KernelError::SemaphoreTimeout));
    }

    #[test]
    fn signal_sets_then_reports_busy() {
        let mut k = fresh_kernel(8 * 1024);
        let sem = Semaphore::new(false);
        assert_eq!(sem.signal_in(&mut k), Ok(()));
        assert_eq!(sem.signal_in(&mut k), Err(KernelError::SemaphoreBusy));
        assert_eq!(sem.wait(0), Ok(()));
        assert_eq!(sem.signal_in(&mut k), Ok(()));
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let sem = Semaphore::new(false);
        assert_eq!(sem.wait(MAX_DELAY + 1), Err(KernelError::BadParameter));
    }

    #[test]
    fn begin_wait_blocks_and_recheck_catches_races() {
        let mut k = fresh_kernel(16 * 1024);
        let sem = Semaphore::new(false);
        let t = spawn_running(&mut k, "w");

        // A permit that arrived between the fast path and the lock is
        // picked up without blocking.
        sem.available.store(1, Ordering::Relaxed);
        assert_eq!(sem.begin_wait(&mut k, Ticks(100)), Ok(true));

        assert_eq!(sem.begin_wait(&mut k, Ticks(100)), Ok(false));
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*t.as_ptr()).state, TaskState::BlockedOnSemaphore);
        }
        assert_eq!(sem.waiter_count(), 1);
    }

    #[test]
    fn handoff_bypasses_the_count_and_defeats_stealing() {
        let mut k = fresh_kernel(16 * 1024);
        let sem = Semaphore::new(false);
        let waiter = spawn_running(&mut k, "w");
        sem.begin_wait(&mut k, Ticks(1000)).unwrap();

        assert_eq!(sem.signal_in(&mut k), Ok(()));
        // The permit went to the waiter, not the count: an interloper's
        // immediate wait fails.
        assert_eq!(sem.wait(0), Err(KernelError::SemaphoreTimeout));
        assert_eq!(sem.waiter_count(), 0);

        // The woken waiter's resume path succeeds.
        k.current = Some(waiter);
        assert_eq!(
            sem.finish_wait(&mut k, Ticks(0), Ticks(1000)),
            Some(Ok(()))
        );
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let mut k = fresh_kernel(32 * 1024);
        let sem = Semaphore::new(false);
        let w1 = spawn_running(&mut k, "w1");
        sem.begin_wait(&mut k, Ticks(1000)).unwrap();
        let w2 = spawn_running(&mut k, "w2");
        sem.begin_wait(&mut k, Ticks(1000)).unwrap();
        let w3 = spawn_running(&mut k, "w3");
        sem.begin_wait(&mut k, Ticks(1000)).unwrap();
        k.current = None;

        for expected in [w1, w2, w3] {
            sem.signal_in(&mut k).unwrap();
            // Safety: single-threaded test, tasks are live.
            unsafe {
                assert!((*expected.as_ptr()).take_wake_signal());
                assert_eq!((*expected.as_ptr()).state, TaskState::Ready);
            }
        }
        assert_eq!(sem.waiter_count(), 0);
    }

    #[test]
    fn timeout_resume_cleans_up_the_waiter() {
        let mut k = fresh_kernel(16 * 1024);
        let sem = Semaphore::new(false);
        let _t = spawn_running(&mut k, "w");
        sem.begin_wait(&mut k, Ticks(10)).unwrap();

        // Before the deadline: keep waiting.
        assert_eq!(sem.finish_wait(&mut k, Ticks(9), Ticks(10)), None);
        // At the deadline: timeout, fully unlinked.
        assert_eq!(
            sem.finish_wait(&mut k, Ticks(10), Ticks(10)),
            Some(Err(KernelError::SemaphoreTimeout))
        );
        assert_eq!(sem.waiter_count(), 0);
    }
}
