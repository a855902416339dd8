// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software timers: many virtual one-shot/periodic timers multiplexed
//! over one kernel-owned driver task.
//!
//! Timer records are caller-owned (`&'static`); registration only
//! inserts a pointer into the kernel's timer list. The driver task loops
//! forever: delay one tick, advance every active timer, then run the
//! callbacks of any that expired. Callbacks therefore execute in the
//! driver task's context -- never in an interrupt -- and outside the
//! kernel critical section, so they may use any non-blocking kernel API
//! (signal a semaphore, try-send on a queue, start another timer).
//!
//! An auto-reload timer rearms itself after firing; a one-shot timer
//! deactivates.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::KernelError;

use crate::startup::{with_kernel, Kernel};
use crate::task;

/// Timer expiry callback: runs in the timer service task.
pub type TimerCallback = fn(*mut ());

pub struct SoftwareTimer {
    /// Period, in ticks. Fixed at construction.
    timeout_ticks: u32,
    elapsed_ticks: AtomicU32,
    active: AtomicBool,
    /// Latched on expiry; cleared when the service task runs the
    /// callback.
    fired: AtomicBool,
    auto_reload: bool,
    callback: TimerCallback,
    callback_arg: *mut (),
    registered: AtomicBool,
}

/// Safety: the raw callback argument is only ever handed to the callback
/// in the timer service task; sharing it is the registrant's contract.
unsafe impl Sync for SoftwareTimer {}

impl SoftwareTimer {
    pub const fn new(
        timeout_ticks: u32,
        callback: TimerCallback,
        callback_arg: *mut (),
        auto_reload: bool,
    ) -> Self {
        Self {
            timeout_ticks,
            elapsed_ticks: AtomicU32::new(0),
            active: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            auto_reload,
            callback,
            callback_arg,
            registered: AtomicBool::new(false),
        }
    }

    /// Arms the timer from zero elapsed ticks.
    pub fn start(&self) -> Result<(), KernelError> {
        if self.active.load(Ordering::Relaxed) {
            return Err(KernelError::TimerAlreadyActive);
        }
        self.elapsed_ticks.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Disarms the timer and resets its elapsed count.
    pub fn stop(&self) -> Result<(), KernelError> {
        if !self.active.load(Ordering::Relaxed) {
            return Err(KernelError::TimerAlreadyStopped);
        }
        self.active.store(false, Ordering::Relaxed);
        self.elapsed_ticks.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// One tick's worth of progress: bump elapsed, latch expiry, rearm
    /// or deactivate.
    fn advance_one_tick(&self) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        let elapsed = self.elapsed_ticks.load(Ordering::Relaxed) + 1;
        if elapsed >= self.timeout_ticks {
            self.elapsed_ticks.store(0, Ordering::Relaxed);
            if !self.auto_reload {
                self.active.store(false, Ordering::Relaxed);
            }
            self.fired.store(true, Ordering::Relaxed);
        } else {
            self.elapsed_ticks.store(elapsed, Ordering::Relaxed);
        }
    }
}

/// Adds `timer` to the kernel's timer list. A record can be registered
/// once; a zero period is rejected.
pub fn register(timer: &'static SoftwareTimer) -> Result<(), KernelError> {
    with_kernel(|k| register_in(k, timer))
}

pub(crate) fn register_in(k: &mut Kernel, timer: &SoftwareTimer) -> Result<(), KernelError> {
    if timer.timeout_ticks == 0 {
        return Err(KernelError::BadParameter);
    }
    if timer.registered.swap(true, Ordering::Relaxed) {
        return Err(KernelError::BadParameter);
    }
    let ptr = NonNull::from(timer);
    if let Err(e) = k.timers.push_head(&mut k.heap, ptr) {
        timer.registered.store(false, Ordering::Relaxed);
        return Err(e);
    }
    Ok(())
}

/// Advances every registered timer by one tick.
pub(crate) fn advance_timers(k: &mut Kernel) {
    for t in k.timers.iter() {
        // Safety: registered records are caller-owned `&'static`.
        unsafe { t.as_ref() }.advance_one_tick();
    }
}

/// Pops one expired timer's callback, if any.
pub(crate) fn take_fired(k: &mut Kernel) -> Option<(TimerCallback, *mut ())> {
    for t in k.timers.iter() {
        // Safety: registered records are caller-owned `&'static`.
        let timer = unsafe { t.as_ref() };
        if timer.fired.swap(false, Ordering::Relaxed) {
            return Some((timer.callback, timer.callback_arg));
        }
    }
    None
}

/// Body of the timer service task, created at scheduler start.
pub(crate) fn service_main(_: *mut ()) {
    loop {
        task::delay(1).ok();
        with_kernel(advance_timers);
        while let Some((callback, arg)) = with_kernel(take_fired) {
            callback(arg);
        }
    }
}
