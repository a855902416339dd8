// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A task is a heap-allocated descriptor plus a heap-allocated stack. The
//! registry (the kernel's list of all live tasks) owns both; everything
//! else -- waiter sets, the current-task pointer, handles given to
//! applications -- refers to tasks without owning them. Deletion
//! therefore cleans the waiter sets first and the registry last, and
//! defers the actual free across the context switch when the victim is
//! the running task (see the zombie list in `sched`).

use core::ptr::{self, NonNull};

use abi::{KernelError, Priority, TaskName, TaskState};

use crate::arch;
use crate::ipc::{self, Message};
use crate::list::List;
use crate::sched;
use crate::startup::{self, with_kernel, Kernel};
use crate::time::{Ticks, MAX_DELAY};

/// Task entry point: one opaque argument, no return. Returning from the
/// entry function lands in the kernel's exit path and deletes the task.
pub type TaskEntry = fn(*mut ());

/// Word written into every stack slot at creation, so the high-water mark
/// can be recovered later by scanning for where the pattern breaks.
pub(crate) const STACK_SENTINEL: u32 = 0xBADD_CAFE;

/// Internal representation of a task.
///
/// The fields are private to this module so task invariants (stack cursor
/// inside the owned region, state consistent with waiter-set membership)
/// stay maintainable in one place.
#[repr(C)] // so the location of the stack cursor is predictable
pub struct Task {
    // NOTE: it is critical that this field appear first! The context
    // switch assembly stores the saved-context cursor through the bare
    // descriptor pointer.
    stack_top: *mut u32,
    /// Low end of the owned stack region.
    stack_base: NonNull<u32>,
    /// Length of the stack region, in 32-bit words.
    stack_words: usize,
    entry: TaskEntry,
    arg: *mut (),
    /// Fixed after creation.
    priority: Priority,
    pub(crate) state: TaskState,
    /// Absolute wake instant; meaningful in `Delayed`.
    pub(crate) wake_at: Ticks,
    /// Absolute timeout instant; meaningful in the `BlockedOn*` states.
    pub(crate) deadline: Ticks,
    /// The waiter set this task currently occupies, or null. Lets timeout
    /// promotion and deletion unlink the waiter node eagerly.
    pub(crate) blocked_on: *mut List<Task>,
    /// Set when a waker hands this task the thing it was blocked for;
    /// consumed by the blocked operation's resume path.
    pub(crate) wake_signal: bool,
    /// Byte count a circular-buffer waiter is blocked for.
    pub(crate) pending_transfer: usize,
    pub(crate) timing: Timing,
    /// Inbound IPC messages, oldest first. Owned by this task.
    pub(crate) mailbox: List<Message>,
    name: TaskName,
}

impl Task {
    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn name(&self) -> TaskName {
        self.name
    }

    pub(crate) fn entry(&self) -> TaskEntry {
        self.entry
    }

    pub(crate) fn arg(&self) -> *mut () {
        self.arg
    }

    pub(crate) fn stack_region(&self) -> (NonNull<u32>, usize) {
        (self.stack_base, self.stack_words)
    }

    /// Records the saved-context cursor. Only the architecture layer and
    /// the context switch assembly move this.
    pub(crate) fn set_stack_top(&mut self, top: *mut u32) {
        self.stack_top = top;
    }

    /// Consumes a pending wake handoff, if any.
    pub(crate) fn take_wake_signal(&mut self) -> bool {
        core::mem::replace(&mut self.wake_signal, false)
    }

    /// Counts stack words never touched since creation, scanning from the
    /// low end until the sentinel pattern breaks.
    pub(crate) fn unused_stack_words(&self) -> usize {
        let base = self.stack_base.as_ptr();
        let mut n = 0;
        // Safety: the scan stays within the owned stack region.
        unsafe {
            while n < self.stack_words && base.add(n).read() == STACK_SENTINEL {
                n += 1;
            }
        }
        n
    }
}

/// Per-task execution time accounting, in core cycles. All values wrap;
/// consumers take wrapping differences.
#[derive(Default)]
pub(crate) struct Timing {
    pub(crate) switched_in: u32,
    pub(crate) switched_out: u32,
    pub(crate) total_cycles: u32,
}

impl Timing {
    pub(crate) fn record_switch_in(&mut self, cycles: u32) {
        self.switched_in = cycles;
    }

    pub(crate) fn record_switch_out(&mut self, cycles: u32) {
        self.switched_out = cycles;
        self.total_cycles = self
            .total_cycles
            .wrapping_add(cycles.wrapping_sub(self.switched_in));
    }
}

/// Opaque reference to a task, as handed to applications.
///
/// A handle stays pointer-stable for the task's lifetime but can go
/// stale: operations validate it against the registry and report
/// `TaskNotFound` for a deleted task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskHandle(NonNull<Task>);

/// Safety: a handle is an opaque token; every dereference happens inside
/// the kernel after registry validation.
unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

impl TaskHandle {
    pub(crate) fn new(task: NonNull<Task>) -> Self {
        Self(task)
    }

    pub(crate) fn raw(self) -> NonNull<Task> {
        self.0
    }
}

impl Kernel {
    /// Allocates and registers a new task, Ready to run. See [`create`].
    pub(crate) fn create_task(
        &mut self,
        entry: TaskEntry,
        name: &str,
        stack_words: usize,
        arg: *mut (),
        priority: u8,
    ) -> Result<TaskHandle, KernelError> {
        if name.is_empty() || stack_words < arch::MIN_STACK_WORDS {
            return Err(KernelError::BadParameter);
        }
        if !self.heap.is_initialized() {
            return Err(KernelError::MemoryNotInitialized);
        }

        let priority = Priority(priority.min(startup::max_task_priority() - 1));

        let descriptor = self
            .heap
            .allocate(core::mem::size_of::<Task>())
            .ok_or(KernelError::NoMemory)?
            .cast::<Task>();
        let stack = match self.heap.allocate(stack_words * 4) {
            Some(p) => p.cast::<u32>(),
            None => {
                self.heap.deallocate(descriptor.as_ptr().cast());
                return Err(KernelError::NoMemory);
            }
        };

        // Safety: `stack` is a fresh allocation of `stack_words` words.
        unsafe {
            for i in 0..stack_words {
                stack.as_ptr().add(i).write(STACK_SENTINEL);
            }
        }

        // Safety: `descriptor` is a fresh, sufficiently aligned
        // allocation; we fully initialize it before anything reads it.
        unsafe {
            descriptor.as_ptr().write(Task {
                stack_top: ptr::null_mut(),
                stack_base: stack,
                stack_words,
                entry,
                arg,
                priority,
                state: TaskState::Ready,
                wake_at: Ticks::ZERO,
                deadline: Ticks::ZERO,
                blocked_on: ptr::null_mut(),
                wake_signal: false,
                pending_transfer: 0,
                timing: Timing::default(),
                mailbox: List::new(),
                name: TaskName::new(name),
            });
            arch::reinitialize(&mut *descriptor.as_ptr());
        }

        if let Err(e) = self.tasks.push_tail(&mut self.heap, descriptor) {
            self.heap.deallocate(stack.as_ptr().cast());
            self.heap.deallocate(descriptor.as_ptr().cast());
            return Err(e);
        }

        // A fresh task that outranks the running one takes the CPU at the
        // next switch opportunity.
        if self.started {
            self.preempt_if_outranked(descriptor);
        }

        Ok(TaskHandle::new(descriptor))
    }

    /// Looks a handle up in the registry.
    pub(crate) fn find_task(&self, handle: TaskHandle) -> Option<NonNull<Task>> {
        let target = handle.raw();
        self.tasks.iter().find(|&t| t == target)
    }

    /// Removes `victim` from the system: waiter set first, then mailbox,
    /// then the registry. Resources are freed immediately for a bystander
    /// and deferred through the zombie list for the running task (its
    /// stack is still in use until the pended switch completes).
    pub(crate) fn delete_task(&mut self, victim: NonNull<Task>) -> Result<(), KernelError> {
        if Some(victim) == self.idle {
            return Err(KernelError::BadParameter);
        }

        // Safety: `victim` was validated against the registry by the
        // caller and the kernel lock is held, so we have exclusive access.
        let task = unsafe { &mut *victim.as_ptr() };
        if !task.blocked_on.is_null() {
            // Safety: a non-null `blocked_on` names the waiter list of a
            // live synchronization object holding this task.
            unsafe {
                (*task.blocked_on).remove(&mut self.heap, victim);
            }
            task.blocked_on = ptr::null_mut();
        }
        ipc::drain_mailbox(&mut self.heap, &mut task.mailbox);
        self.tasks.remove(&mut self.heap, victim);

        if self.current == Some(victim) {
            self.zombies.push_tail(&mut self.heap, victim)?;
            arch::pend_context_switch();
        } else {
            self.release_task(victim);
        }
        Ok(())
    }

    /// Frees a task's stack and descriptor. The task must already be out
    /// of the registry with its mailbox drained.
    pub(crate) fn release_task(&mut self, task: NonNull<Task>) {
        // Safety: exclusive access under the kernel lock; the task is
        // unreachable from every kernel structure except the caller.
        let stack = unsafe { (*task.as_ptr()).stack_base };
        self.heap.deallocate(stack.as_ptr().cast());
        self.heap.deallocate(task.as_ptr().cast());
    }

    pub(crate) fn current_ptr(&self) -> Option<NonNull<Task>> {
        self.current
    }

    /// Pends a context switch if `candidate` outranks the running task,
    /// or if the idle task is running.
    pub(crate) fn preempt_if_outranked(&mut self, candidate: NonNull<Task>) {
        let Some(cur) = self.current else { return };
        // Safety: registry members are live; kernel lock held.
        let (cand_prio, cur_prio) = unsafe {
            ((*candidate.as_ptr()).priority(), (*cur.as_ptr()).priority())
        };
        if Some(cur) == self.idle || cand_prio.is_more_important_than(cur_prio) {
            arch::pend_context_switch();
        }
    }
}

/// Scans the registry for the most urgent Ready task.
///
/// Ties go to the task encountered first in registry order; since new
/// tasks enter at the tail, that is the oldest task at that priority.
/// The idle task is held out of the scan -- it runs only when this
/// returns `None`.
pub(crate) fn select(tasks: &List<Task>, idle: Option<NonNull<Task>>) -> Option<NonNull<Task>> {
    let mut choice: Option<(NonNull<Task>, Priority)> = None;
    for t in tasks.iter() {
        if Some(t) == idle {
            continue;
        }
        // Safety: registry members are live; kernel lock held by caller.
        let task = unsafe { t.as_ref() };
        if !task.state.is_ready() {
            continue;
        }
        if let Some((_, best)) = choice {
            if !task.priority().is_more_important_than(best) {
                continue;
            }
        }
        choice = Some((t, task.priority()));
    }
    choice.map(|(t, _)| t)
}

/// Creates a task and returns its handle.
///
/// The stack is `stack_words` 32-bit words, at least
/// `arch::MIN_STACK_WORDS`. `priority` is clamped to the configured
/// maximum minus one. The name is truncated to 19 bytes.
pub fn create(
    entry: TaskEntry,
    name: &str,
    stack_words: usize,
    arg: *mut (),
    priority: u8,
) -> Result<TaskHandle, KernelError> {
    with_kernel(|k| k.create_task(entry, name, stack_words, arg, priority))
}

/// Deletes the calling task and switches away. Never returns.
pub fn exit() -> ! {
    with_kernel(|k| {
        if let Some(cur) = k.current_ptr() {
            // The running task can always be deleted; failures here would
            // mean the kernel heap cannot even hold a zombie node.
            k.delete_task(cur).ok();
        }
    });
    loop {
        arch::wait_for_interrupt();
    }
}

/// Deletes the task named by `handle`.
///
/// When `handle` names the calling task this does not return: the switch
/// away happens as soon as the interrupt mask permits. Deleting a task
/// that has been woken from a queue but has not yet run leaks that wake's
/// reservation; delete blocked tasks from their own context if you can.
pub fn delete(handle: TaskHandle) -> Result<(), KernelError> {
    with_kernel(|k| {
        let victim = k.find_task(handle).ok_or(KernelError::TaskNotFound)?;
        k.delete_task(victim)
    })
}

/// Moves the calling task to Delayed until `ticks` from now have elapsed.
/// `ticks` must be in `1..=MAX_DELAY`.
pub fn delay(ticks: u32) -> Result<(), KernelError> {
    if ticks == 0 || ticks > MAX_DELAY {
        return Err(KernelError::BadParameter);
    }
    with_kernel(|k| {
        let cur = k.current_ptr().ok_or(KernelError::BadParameter)?;
        // Safety: the current task is live; kernel lock held.
        let task = unsafe { &mut *cur.as_ptr() };
        task.state = TaskState::Delayed;
        task.wake_at = arch::now().offset(ticks);
        arch::pend_context_switch();
        Ok(())
    })
}

/// Pauses a Running or Ready task. Pausing the running task switches
/// away immediately; pausing an already-Paused task is a no-op.
pub fn pause(handle: TaskHandle) -> Result<(), KernelError> {
    with_kernel(|k| {
        let t = k.find_task(handle).ok_or(KernelError::TaskNotFound)?;
        if Some(t) == k.idle {
            return Err(KernelError::BadParameter);
        }
        // Safety: registry member, kernel lock held.
        let task = unsafe { &mut *t.as_ptr() };
        match task.state {
            TaskState::Paused => Ok(()),
            TaskState::Running => {
                task.state = TaskState::Paused;
                arch::pend_context_switch();
                Ok(())
            }
            TaskState::Ready => {
                task.state = TaskState::Paused;
                Ok(())
            }
            _ => Err(KernelError::BadParameter),
        }
    })
}

/// Returns a Paused task to Ready. A no-op for a task in any other state.
pub fn resume(handle: TaskHandle) -> Result<(), KernelError> {
    with_kernel(|k| {
        let t = k.find_task(handle).ok_or(KernelError::TaskNotFound)?;
        // Safety: registry member, kernel lock held.
        let task = unsafe { &mut *t.as_ptr() };
        if task.state == TaskState::Paused {
            task.state = TaskState::Ready;
            k.preempt_if_outranked(t);
        }
        Ok(())
    })
}

/// Offers the CPU: requests a switch if some Ready task outranks the
/// caller.
pub fn yield_now() {
    with_kernel(|k| {
        let Some(cur) = k.current_ptr() else { return };
        if let Some(best) = select(&k.tasks, k.idle) {
            if best != cur {
                // Safety: registry members, kernel lock held.
                let (best_prio, cur_prio) = unsafe {
                    ((*best.as_ptr()).priority(), (*cur.as_ptr()).priority())
                };
                if best_prio.is_more_important_than(cur_prio) || Some(cur) == k.idle {
                    arch::pend_context_switch();
                }
            }
        }
    })
}

/// Counts never-used words of the calling task's stack.
pub fn free_stack() -> usize {
    with_kernel(|k| {
        k.current_ptr()
            // Safety: current task is live; kernel lock held.
            .map(|t| unsafe { (*t.as_ptr()).unused_stack_words() })
            .unwrap_or(0)
    })
}

/// Returns the calling task's accumulated execution cycles, as of its
/// last switch-out.
pub fn cycles() -> u32 {
    with_kernel(|k| {
        k.current_ptr()
            // Safety: current task is live; kernel lock held.
            .map(|t| unsafe { (*t.as_ptr()).timing.total_cycles })
            .unwrap_or(0)
    })
}

/// Returns the calling task's handle, once the scheduler is running.
pub fn current_handle() -> Option<TaskHandle> {
    with_kernel(|k| k.current_ptr().map(TaskHandle::new))
}

/// Returns a copy of the calling task's name.
pub fn current_name() -> Option<TaskName> {
    with_kernel(|k| {
        k.current_ptr()
            // Safety: current task is live; kernel lock held.
            .map(|t| unsafe { (*t.as_ptr()).name() })
    })
}

/// Reports CPU load over the most recent sampling interval as whole
/// percent plus hundredths. Recomputed at most once per second.
pub fn core_load() -> (u32, u32) {
    with_kernel(|k| sched::sample_load(k, arch::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_support::fresh_kernel;

    fn nop_entry(_: *mut ()) {}

    #[test]
    fn create_requires_memory_init() {
        let mut k = Kernel::new();
        assert_eq!(
            k.create_task(nop_entry, "t", 128, ptr::null_mut(), 1),
            Err(KernelError::MemoryNotInitialized)
        );
    }

    #[test]
    fn create_validates_parameters() {
        let mut k = fresh_kernel(16 * 1024);
        assert_eq!(
            k.create_task(nop_entry, "", 128, ptr::null_mut(), 1),
            Err(KernelError::BadParameter)
        );
        assert_eq!(
            k.create_task(nop_entry, "t", arch::MIN_STACK_WORDS - 1, ptr::null_mut(), 1),
            Err(KernelError::BadParameter)
        );
    }

    #[test]
    fn create_clamps_priority_to_max() {
        let mut k = fresh_kernel(16 * 1024);
        let h = k
            .create_task(nop_entry, "hot", 128, ptr::null_mut(), 200)
            .unwrap();
        let max = startup::max_task_priority();
        // Safety: single-threaded test, task is live.
        let prio = unsafe { (*h.raw().as_ptr()).priority() };
        assert_eq!(prio, Priority(max - 1));
    }

    #[test]
    fn create_fills_stack_with_sentinel() {
        let mut k = fresh_kernel(16 * 1024);
        let h = k
            .create_task(nop_entry, "wm", 128, ptr::null_mut(), 1)
            .unwrap();
        // Safety: single-threaded test, task is live.
        let unused = unsafe { (*h.raw().as_ptr()).unused_stack_words() };
        assert_eq!(unused, 128 - arch::FRAME_WORDS);
    }

    #[test]
    fn name_is_stored_truncated() {
        let mut k = fresh_kernel(16 * 1024);
        let h = k
            .create_task(nop_entry, "a-task-name-that-overflows", 128, ptr::null_mut(), 1)
            .unwrap();
        // Safety: single-threaded test, task is live.
        let name = unsafe { (*h.raw().as_ptr()).name() };
        assert_eq!(name.as_str(), "a-task-name-that-ov");
    }

    #[test]
    fn delete_returns_memory_and_forgets_handle() {
        let mut k = fresh_kernel(16 * 1024);
        let before = k.heap.free_bytes();
        let h = k
            .create_task(nop_entry, "gone", 128, ptr::null_mut(), 1)
            .unwrap();
        assert!(k.find_task(h).is_some());
        let victim = k.find_task(h).unwrap();
        k.delete_task(victim).unwrap();
        assert!(k.find_task(h).is_none());
        assert_eq!(k.heap.free_bytes(), before);
    }

    #[test]
    fn select_prefers_urgency_then_age() {
        let mut k = fresh_kernel(32 * 1024);
        let a = k.create_task(nop_entry, "a", 128, ptr::null_mut(), 3).unwrap();
        let b = k.create_task(nop_entry, "b", 128, ptr::null_mut(), 5).unwrap();
        let c = k.create_task(nop_entry, "c", 128, ptr::null_mut(), 5).unwrap();
        // Highest priority wins.
        assert_eq!(select(&k.tasks, k.idle), Some(b.raw()));
        // Tie between b and c goes to b, the older registration.
        // Safety: single-threaded test, tasks are live.
        unsafe {
            (*b.raw().as_ptr()).state = TaskState::Delayed;
        }
        assert_eq!(select(&k.tasks, k.idle), Some(c.raw()));
        unsafe {
            (*c.raw().as_ptr()).state = TaskState::Delayed;
        }
        assert_eq!(select(&k.tasks, k.idle), Some(a.raw()));
        unsafe {
            (*a.raw().as_ptr()).state = TaskState::Paused;
        }
        assert_eq!(select(&k.tasks, k.idle), None);
    }

    #[test]
    fn timing_accumulates_with_wrapping() {
        let mut t = Timing::default();
        t.record_switch_in(u32::MAX - 5);
        t.record_switch_out(10); // 16 cycles across the wrap
        assert_eq!(t.total_cycles, 16);
        t.record_switch_in(100);
        t.record_switch_out(150);
        assert_eq!(t.total_cycles, 66);
    }
}
