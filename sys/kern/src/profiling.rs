// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events --
//! context switches, the tick interrupt, application ISRs -- as an aid to
//! debugging or optimization work.
//!
//! The kernel is SoC-independent, so this module does not assume any
//! particular way of getting profiling information out. A target that
//! wants profiling populates an [`EventsTable`] and hands it to
//! [`configure_events_table`] from its startup routine. A typical
//! implementation sets and clears GPIOs that an external logic analyzer
//! watches; keep the handlers fast either way. With no table installed,
//! every event is a null-check and a fall-through.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks provided by board setup code. If you provide a table you have
/// to provide every hook; stub the ones you don't care about with
/// `|_| ()` / `|| ()`.
pub struct EventsTable {
    /// Called whenever the current task changes, with an opaque token
    /// identifying the incoming task.
    pub context_switch: fn(usize),
    /// Called on entry to the kernel's tick ISR.
    pub timer_isr_enter: fn(),
    /// Called on exit from the kernel's tick ISR.
    pub timer_isr_exit: fn(),
    /// Called on entry to a non-kernel ISR that chooses to report itself.
    pub isr_enter: fn(),
    /// Called on exit from such an ISR.
    pub isr_exit: fn(),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table`. Null means no
/// table has been provided.
///
/// All accesses use `Relaxed` ordering: the table is written once at
/// startup and read many times, and memory barriers have nonzero cost.
static EVENTS_TABLE: AtomicPtr<EventsTable> = AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // Safety: only ever written from a valid `&'static`.
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_context_switch(token: usize) {
    if let Some(t) = table() {
        (t.context_switch)(token)
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

/// Signals entry to an ISR. This is `pub` so application interrupt
/// handlers can include themselves in ISR statistics.
pub fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

/// Signals exit from an ISR.
pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}
