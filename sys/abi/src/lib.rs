// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application tasks.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Result of every fallible kernel operation.
///
/// This is the kernel's only error channel: each operation reports its
/// outcome through a `Result` carrying one of these, and nothing is logged
/// out of band. Timeout variants do not indicate corrupted state -- a timed
/// out waiter is fully cleaned up before its result is returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// A parameter was null, zero where a nonzero value is required, or
    /// otherwise out of the operation's domain.
    BadParameter,
    /// The heap could not satisfy an allocation.
    NoMemory,
    /// An operation that needs the heap ran before `init_memory`.
    MemoryNotInitialized,
    /// `signal` was called on a binary semaphore that is already set.
    SemaphoreBusy,
    /// A semaphore wait expired, or an immediate wait found no permit.
    SemaphoreTimeout,
    /// `start` was called on a timer that is already running.
    TimerAlreadyActive,
    /// `stop` was called on a timer that is not running.
    TimerAlreadyStopped,
    /// An immediate send found the queue full.
    QueueFull,
    /// A queue operation expired, or an immediate receive found it empty.
    QueueTimeout,
    /// An immediate send would not fit the circular buffer.
    CircularBufferFull,
    /// A circular buffer operation expired, or an immediate receive found
    /// too few bytes available.
    CircularBufferTimeout,
    /// A task handle does not name a live task.
    TaskNotFound,
    /// A message receive expired with an empty mailbox.
    IpcTimeout,
}

/// Indicates the urgency of a task.
///
/// Priorities are small numbers starting from zero, and numerically
/// *greater* priorities are more urgent -- priority `MAX-1` is the most
/// likely to be scheduled. Keep this polarity in mind when comparing; the
/// `is_more_important_than` operation exists so call sites don't have to.
///
/// Note that this type *deliberately* does not implement
/// `PartialOrd`/`Ord`, to keep us from confusing ourselves on whether `>`
/// means more urgent or merely numerically greater.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more urgent than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Task lifecycle states.
///
/// Exactly one task is `Running` at any time once the scheduler has
/// started. The `BlockedOn*` states each correspond to membership in one
/// synchronization object's waiter set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// Eligible to be picked by the scheduler.
    #[default]
    Ready,
    /// Currently owns the CPU.
    Running,
    /// Sleeping until an absolute wake tick.
    Delayed,
    /// Parked by `pause`; ignored by the scheduler until resumed.
    Paused,
    /// Waiting on a semaphore, with a timeout deadline.
    BlockedOnSemaphore,
    /// Waiting to send to or receive from a bounded queue.
    BlockedOnQueue,
    /// Waiting for space in or bytes from a circular buffer.
    BlockedOnCircularBuffer,
}

impl TaskState {
    /// Checks whether this state means the task sits in some waiter set.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            TaskState::BlockedOnSemaphore
                | TaskState::BlockedOnQueue
                | TaskState::BlockedOnCircularBuffer
        )
    }

    /// Checks whether the scheduler may pick a task in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskState::Ready)
    }
}

/// Number of name bytes available to a task, excluding the terminator.
pub const TASK_NAME_CAPACITY: usize = 19;

/// Fixed-size task name storage: up to [`TASK_NAME_CAPACITY`] bytes,
/// NUL-terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct TaskName([u8; TASK_NAME_CAPACITY + 1]);

impl TaskName {
    /// Builds a name from `s`, truncating to the longest prefix that fits
    /// [`TASK_NAME_CAPACITY`] bytes without splitting a UTF-8 sequence.
    pub fn new(s: &str) -> Self {
        let mut bytes = [0; TASK_NAME_CAPACITY + 1];
        let mut len = s.len().min(TASK_NAME_CAPACITY);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self(bytes)
    }

    /// Returns the name as a string slice, up to the first NUL.
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        // `new` only ever stores a valid UTF-8 prefix, so this can't fail
        // on names the kernel built; tolerate garbage anyway.
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_polarity() {
        assert!(Priority(5).is_more_important_than(Priority(3)));
        assert!(!Priority(3).is_more_important_than(Priority(5)));
        assert!(!Priority(4).is_more_important_than(Priority(4)));
    }

    #[test]
    fn task_name_round_trip() {
        let n = TaskName::new("sensor-poll");
        assert_eq!(n.as_str(), "sensor-poll");
        assert!(!n.is_empty());
    }

    #[test]
    fn task_name_truncates_to_capacity() {
        let n = TaskName::new("a-very-long-task-name-indeed");
        assert_eq!(n.as_str().len(), TASK_NAME_CAPACITY);
        assert_eq!(n.as_str(), "a-very-long-task-na");
    }

    #[test]
    fn task_name_truncation_respects_utf8_boundaries() {
        // 10 two-byte characters; byte 19 would split the last one.
        let n = TaskName::new("éééééééééé");
        assert_eq!(n.as_str(), "ééééééééé");
    }

    #[test]
    fn empty_name() {
        assert!(TaskName::new("").is_empty());
        assert_eq!(TaskName::new("").as_str(), "");
    }

    #[test]
    fn blocked_states() {
        assert!(TaskState::BlockedOnQueue.is_blocked());
        assert!(!TaskState::Delayed.is_blocked());
        assert!(TaskState::Ready.is_ready());
        assert!(!TaskState::Running.is_ready());
    }
}
