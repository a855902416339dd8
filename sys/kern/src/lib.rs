// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keel kernel.
//!
//! A preemptive priority-based real-time kernel for ARMv7-M/v8-M-class
//! microcontrollers: dynamic tasks over a fixed-pool heap, a tick-driven
//! time base, blocking synchronization primitives with timeouts, and a
//! software-timer service -- with the context switch deferred to the
//! pendable supervisor exception.
//!
//! Code outside of the `arch` module is portable; it builds and runs its
//! test suite on the host against `arch::fake`.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic
//! ideas that appear consistently.
//!
//! 1. One lock. All kernel state lives in a single structure guarded by
//!    one interrupt-masking critical section (`startup::with_kernel`);
//!    there is no fine-grained locking to get wrong.
//! 2. Errors by value. Every fallible operation returns the shared
//!    result enumeration from `abi`; nothing is logged out of band.
//! 3. A strong preference for safe code where reasonable, and for small,
//!    clear algorithms over clever ones -- most clever kernel algorithms
//!    wind up requiring `unsafe`.
//! 4. Blocking is state, not control flow: a waiting task parks itself in
//!    a waiter set and pends a switch; its stack always holds a frame the
//!    scheduler can dispatch through.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

mod heap;
mod kcell;
mod list;

pub mod fail;
pub mod ipc;
pub mod mutex;
pub mod profiling;
pub mod queue;
pub mod ring;
pub mod sched;
pub mod semaphore;
pub mod startup;
pub mod task;
pub mod time;
pub mod timer;
