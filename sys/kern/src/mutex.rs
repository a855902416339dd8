// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt-masking spin mutex for bounded critical sections.
//!
//! Locking captures the interrupt mask, raises it to the maximum-syscall
//! level, and spins on a test-and-set flag with acquire ordering; the
//! guard's drop clears the flag with release ordering and restores the
//! captured mask. There is no scheduling while held -- this is for short
//! sections protecting application invariants, not for waiting.
//!
//! Calling anything that may block (`delay`, a semaphore wait, a queue
//! operation with a nonzero timeout) or deleting the calling task while
//! holding a guard is a usage error: the mask is up and no other task
//! can run to release anything.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

pub struct SpinMutex {
    locked: AtomicBool,
}

impl SpinMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the mutex, returning a guard that releases it on drop.
    pub fn lock(&self) -> SpinMutexGuard<'_> {
        let restore_mask = arch::raise_syscall_mask();
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        SpinMutexGuard {
            mutex: self,
            restore_mask,
        }
    }
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinMutexGuard<'a> {
    mutex: &'a SpinMutex,
    restore_mask: u32,
}

impl Drop for SpinMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
        arch::restore_syscall_mask(self.restore_mask);
    }
}
