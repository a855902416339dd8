// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling decisions and the context-switch driver.
//!
//! The decision procedure (run from the pended switch handler, and in
//! reduced form from the tick ISR) is:
//!
//! 1. Promote every Delayed task whose wake instant has arrived, and
//!    every Blocked task whose timeout has expired, to Ready. Timed-out
//!    waiters are unlinked from their waiter set here, through the task's
//!    `blocked_on` back-pointer, so waiter sets only ever contain Blocked
//!    tasks.
//! 2. Demote the running task to Ready if it is still Running.
//! 3. Pick the most urgent Ready task; ties go to registry order. With
//!    nothing Ready, pick the idle task.
//! 4. Account cycles out of the old task and into the new one, publish
//!    the switch latency, and free any zombies -- this runs on the
//!    handler stack, so a deleted task's stack is no longer in use.
//!
//! Blocking and waking for all synchronization primitives also live
//! here: a blocked task parks itself on the object's waiter list with a
//! deadline, and wakers pop the FIFO head and hand it its result through
//! the task's `wake_signal`.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use abi::{KernelError, TaskState};

use crate::arch;
use crate::list::List;
use crate::startup::{self, with_kernel, Kernel};
use crate::task::{self, Task};
use crate::time::Ticks;

/// Cycle delta between the last switch-out and the following switch-in,
/// as an observable scheduling metric.
static LAST_SWITCH_LATENCY: AtomicU32 = AtomicU32::new(0);

/// Returns the most recent switch-out to switch-in latency, in cycles.
pub fn last_switch_latency() -> u32 {
    LAST_SWITCH_LATENCY.load(Ordering::Relaxed)
}

impl Kernel {
    /// Promotes expired Delayed and Blocked tasks to Ready. Returns
    /// whether anything changed.
    pub(crate) fn promote_expired(&mut self, now: Ticks) -> bool {
        let mut any = false;
        for t in self.tasks.iter() {
            // Safety: registry members are live; kernel lock held.
            let task = unsafe { &mut *t.as_ptr() };
            match task.state {
                TaskState::Delayed if now.has_reached(task.wake_at) => {
                    task.state = TaskState::Ready;
                    any = true;
                }
                s if s.is_blocked() && now.has_reached(task.deadline) => {
                    if !task.blocked_on.is_null() {
                        // Safety: a non-null `blocked_on` names the waiter
                        // list of a live object holding this task.
                        unsafe {
                            (*task.blocked_on).remove(&mut self.heap, t);
                        }
                        task.blocked_on = ptr::null_mut();
                    }
                    task.state = TaskState::Ready;
                    any = true;
                }
                _ => {}
            }
        }
        any
    }

    /// Checks whether any task other than idle is Ready.
    pub(crate) fn any_ready(&self) -> bool {
        self.tasks.iter().any(|t| {
            // Safety: registry members are live; kernel lock held.
            Some(t) != self.idle && unsafe { (*t.as_ptr()).state.is_ready() }
        })
    }

    /// Parks the calling task on `waiters` in `state` until `deadline`,
    /// and pends the switch away. `transfer` records a byte requirement
    /// for circular-buffer waits (zero elsewhere).
    pub(crate) fn block_current(
        &mut self,
        waiters: *mut List<Task>,
        state: TaskState,
        deadline: Ticks,
        transfer: usize,
    ) -> Result<(), KernelError> {
        let cur = self.current.ok_or(KernelError::BadParameter)?;
        // Safety: `waiters` names a live object's waiter list, disjoint
        // from the kernel structure; kernel lock held.
        unsafe {
            (*waiters).push_tail(&mut self.heap, cur)?;
        }
        // Safety: the current task is live; kernel lock held.
        let task = unsafe { &mut *cur.as_ptr() };
        task.state = state;
        task.deadline = deadline;
        task.blocked_on = waiters;
        task.pending_transfer = transfer;
        task.wake_signal = false;
        arch::pend_context_switch();
        Ok(())
    }

    /// Wakes the FIFO-head waiter of `waiters`, handing it its result via
    /// `wake_signal`, and pends a switch if it outranks the running task.
    pub(crate) fn wake_one(&mut self, waiters: *mut List<Task>) -> Option<NonNull<Task>> {
        // Safety: as in `block_current`.
        let woken = unsafe { (*waiters).pop_head(&mut self.heap) }?;
        // Safety: waiter-set members are live registry members.
        let task = unsafe { &mut *woken.as_ptr() };
        task.blocked_on = ptr::null_mut();
        task.wake_signal = true;
        task.state = TaskState::Ready;
        self.preempt_if_outranked(woken);
        Some(woken)
    }

    /// Frees every descriptor parked on the zombie list. Runs from the
    /// switch handler, where the freed stacks are guaranteed not in use.
    pub(crate) fn reap_zombies(&mut self) {
        while let Some(z) = self.zombies.pop_head(&mut self.heap) {
            self.release_task(z);
        }
    }

    /// The scheduling decision proper: housekeeping, demotion, selection.
    /// Returns the task to run; `cycles_out` is charged to the outgoing
    /// task.
    pub(crate) fn reschedule(&mut self, now: Ticks, cycles_out: u32) -> NonNull<Task> {
        self.promote_expired(now);

        if let Some(cur) = self.current {
            // Safety: the outgoing task is live -- deleted tasks sit on
            // the zombie list unfreed until `reap_zombies` below.
            let task = unsafe { &mut *cur.as_ptr() };
            task.timing.record_switch_out(cycles_out);
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        // With nothing Ready, the idle task runs. If even that is absent
        // the kernel was never started; there is nothing sane to do.
        let next = match task::select(&self.tasks, self.idle).or(self.idle) {
            Some(t) => t,
            None => panic!(),
        };
        // Safety: `select` returns live registry members.
        unsafe {
            (*next.as_ptr()).state = TaskState::Running;
        }
        self.current = Some(next);
        next
    }

    /// Completes a switch: charges entry cycles to the incoming task and
    /// publishes the exit-to-entry latency. `outgoing` is the task that
    /// held the CPU before the decision (still unfreed even if deleted --
    /// zombies are reaped after this).
    pub(crate) fn finish_switch(
        &mut self,
        outgoing: Option<NonNull<Task>>,
        next: NonNull<Task>,
        cycles_in: u32,
    ) {
        // Safety: `next` came out of `reschedule`; `outgoing` is either a
        // registry member or a zombie that has not been reaped yet.
        unsafe {
            (*next.as_ptr()).timing.record_switch_in(cycles_in);
            if let Some(out) = outgoing {
                let out_cycles = (*out.as_ptr()).timing.switched_out;
                LAST_SWITCH_LATENCY
                    .store(cycles_in.wrapping_sub(out_cycles), Ordering::Relaxed);
            }
        }
    }
}

/// Entry point for the pended switch handler. By the time this runs the
/// outgoing task's context is saved and its stack cursor recorded.
pub fn switch_context() {
    with_kernel(|k| {
        let now = arch::now();
        let outgoing = k.current_ptr();
        let next = k.reschedule(now, arch::cycle_count());
        k.finish_switch(outgoing, next, arch::cycle_count());
        // Freed stacks are certainly not in use here: execution is on the
        // handler stack and the outgoing context has been saved.
        k.reap_zombies();
        // Safety: `next` is a live registry member and stays live at
        // least until the next switch decision.
        unsafe { arch::set_current_task(next) };
    })
}

/// Entry point for the tick interrupt, after the tick count has been
/// advanced: wake expired sleepers, and pend a switch if any task (other
/// than idle) is now Ready.
pub fn on_tick() {
    crate::profiling::event_timer_isr_enter();
    with_kernel(|k| {
        k.promote_expired(arch::now());
        if k.any_ready() {
            arch::pend_context_switch();
        }
    });
    crate::profiling::event_timer_isr_exit();
}

/// Recomputes the CPU load figure if at least one second has passed since
/// the previous sample, and returns (percent, hundredths of a percent) of
/// non-idle time. Cycle counters wrap; deltas are wrapping differences.
pub(crate) fn sample_load(k: &mut Kernel, now: Ticks) -> (u32, u32) {
    let interval = startup::tick_rate_hz();
    if !k.load.primed || now.has_reached(k.load.last_sample.offset(interval)) {
        let idle_total = k
            .idle
            // Safety: the idle task is a live registry member.
            .map(|i| unsafe { (*i.as_ptr()).timing.total_cycles })
            .unwrap_or(0);
        let mut total: u32 = 0;
        for t in k.tasks.iter() {
            // Safety: registry members are live; kernel lock held.
            total = total.wrapping_add(unsafe { (*t.as_ptr()).timing.total_cycles });
        }

        if k.load.primed {
            let idle_delta = u64::from(idle_total.wrapping_sub(k.load.idle_cycles));
            let total_delta = u64::from(total.wrapping_sub(k.load.total_cycles));
            if total_delta == 0 {
                k.load.percent = 0;
                k.load.hundredths = 0;
            } else {
                let busy = total_delta - idle_delta.min(total_delta);
                let permyriad = (busy * 10_000 / total_delta) as u32;
                k.load.percent = permyriad / 100;
                k.load.hundredths = permyriad % 100;
            }
        }
        k.load.idle_cycles = idle_total;
        k.load.total_cycles = total;
        k.load.last_sample = now;
        k.load.primed = true;
    }
    (k.load.percent, k.load.hundredths)
}

/// CPU load sampling state; lives in the kernel singleton.
pub(crate) struct LoadSampler {
    pub(crate) last_sample: Ticks,
    pub(crate) idle_cycles: u32,
    pub(crate) total_cycles: u32,
    pub(crate) percent: u32,
    pub(crate) hundredths: u32,
    pub(crate) primed: bool,
}

impl LoadSampler {
    pub(crate) const fn new() -> Self {
        Self {
            last_sample: Ticks(0),
            idle_cycles: 0,
            total_cycles: 0,
            percent: 0,
            hundredths: 0,
            primed: false,
        }
    }
}
