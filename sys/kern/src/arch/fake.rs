// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in architecture for builds that are not targeting bare metal --
//! i.e. the host, where the test suite runs.
//!
//! This provides the same names as the real port with observable,
//! deterministic behavior: the tick counter and cycle counter are plain
//! atomics that tests advance explicitly, "pending a context switch" sets
//! a flag that tests can consume, and the interrupt mask is a nesting
//! counter. Nothing here ever actually transfers control between tasks;
//! the portable kernel logic is exercised by driving its decision
//! functions directly.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::task::Task;
use crate::time::Ticks;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Smallest stack, in words, that can hold an initial context frame with
/// a little room to run. Kept equal to the real port's requirement so
/// host-tested creation limits match hardware.
pub const MIN_STACK_WORDS: usize = 64;

/// Number of words the fake initial "frame" occupies, mirroring the real
/// port's 34-word layout so stack watermark behavior matches.
pub const FRAME_WORDS: usize = 34;

static CURRENT_TASK_PTR: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());
static TICKS: AtomicU32 = AtomicU32::new(0);
static CYCLES: AtomicU32 = AtomicU32::new(0);
static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);
static SWITCH_PENDED: AtomicBool = AtomicBool::new(false);

/// Lays out an initial saved-context frame at the top of `task`'s stack
/// and records the cursor, like the real port -- except the "frame" is
/// just a recognizable fill.
pub fn reinitialize(task: &mut Task) {
    let (base, words) = task.stack_region();
    uassert!(words >= FRAME_WORDS);
    // Align the top down to 8 bytes as the hardware would require.
    let top = (base.as_ptr() as usize + words * 4) & !7;
    let frame = (top - FRAME_WORDS * 4) as *mut u32;
    // Safety: the frame range lies within the task's owned stack, which
    // `create` allocated `words` words long.
    unsafe {
        for i in 0..FRAME_WORDS {
            frame.add(i).write(0);
        }
    }
    task.set_stack_top(frame);
}

pub fn start_first_task(_tick_divisor: u32, _task: &mut Task) -> ! {
    panic!("entering userland");
}

/// Records `task` as the current user task.
///
/// # Safety
///
/// This records a pointer that aliases `task`; the caller must ensure the
/// task outlives its tenure as current.
pub unsafe fn set_current_task(task: NonNull<Task>) {
    CURRENT_TASK_PTR.store(task.as_ptr(), Ordering::Relaxed);
    crate::profiling::event_context_switch(task.as_ptr() as usize);
}

pub fn pend_context_switch() {
    SWITCH_PENDED.store(true, Ordering::Relaxed);
}

pub fn now() -> Ticks {
    Ticks(TICKS.load(Ordering::Relaxed))
}

pub fn cycle_count() -> u32 {
    CYCLES.load(Ordering::Relaxed)
}

pub fn raise_syscall_mask() -> u32 {
    MASK_DEPTH.fetch_add(1, Ordering::Acquire)
}

pub fn restore_syscall_mask(prev: u32) {
    MASK_DEPTH.store(prev, Ordering::Release);
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

// Test controls. These have no counterpart in the real port; tests use
// them to script time and observe kernel requests.

pub fn advance_ticks(n: u32) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

pub fn advance_cycles(n: u32) {
    CYCLES.fetch_add(n, Ordering::Relaxed);
}

pub fn take_pended_switch() -> bool {
    SWITCH_PENDED.swap(false, Ordering::Relaxed)
}

pub fn mask_depth() -> u32 {
    MASK_DEPTH.load(Ordering::Relaxed)
}
