// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interior mutability for kernel-shared state.
//!
//! The kernel runs on a single core and serializes all access to its data
//! structures by raising the interrupt mask to the maximum-syscall level
//! (see `startup::with_kernel`). Within such a critical section there is
//! exactly one thread of control, so handing out `&mut` references from a
//! shared cell is sound -- but the type system can't see that, hence this
//! cell with an `unsafe` accessor that states the obligation.

use core::cell::UnsafeCell;

/// A cell whose contents may only be touched inside the kernel critical
/// section.
#[derive(Debug)]
pub(crate) struct KCell<T>(UnsafeCell<T>);

/// Safety: all access goes through `get_mut`, whose contract limits it to
/// the kernel critical section, where only one context can execute.
unsafe impl<T> Sync for KCell<T> {}

impl<T> KCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Produces a mutable reference to the contents.
    ///
    /// # Safety
    ///
    /// The caller must be executing inside the kernel critical section
    /// (interrupt mask at the maximum-syscall level, no reentry), and must
    /// not let the returned reference outlive that section or overlap
    /// another reference produced from the same cell.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Produces a mutable reference through an exclusive borrow; no
    /// critical-section obligation applies.
    pub fn get_exclusive(&mut self) -> &mut T {
        self.0.get_mut()
    }
}
