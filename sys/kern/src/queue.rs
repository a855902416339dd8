// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded FIFO queue of fixed-size elements with blocking send/receive.
//!
//! Storage is one contiguous heap block of `capacity * elem_size` bytes
//! with front/rear cursors taken modulo the capacity; element boundaries
//! are always respected -- a partial element is never observable.
//!
//! Senders and receivers block on separate FIFOs (at most one of which is
//! ever populated: senders wait only on a full queue, receivers only on
//! an empty one). A wake *claims* the item or slot it stands for, so a
//! fast-path caller arriving between the wake and the woken task's next
//! turn cannot take it out from under the waiter. This is what makes the
//! queue FIFO over waiters as well as over elements.
//!
//! Timeout zero means try: `QueueFull` for a send that doesn't fit,
//! `QueueTimeout` for a receive with nothing claimable. Blocking expiry
//! reports `QueueTimeout` either way.

use core::ptr::NonNull;

use abi::{KernelError, TaskState};

use crate::arch;
use crate::kcell::KCell;
use crate::list::List;
use crate::startup::{with_kernel, Kernel};
use crate::task::Task;
use crate::time::{Ticks, MAX_DELAY};

pub struct Queue {
    inner: KCell<QueueInner>,
}

struct QueueInner {
    storage: NonNull<u8>,
    capacity: usize,
    elem_size: usize,
    front: usize,
    rear: usize,
    len: usize,
    rx_waiters: List<Task>,
    tx_waiters: List<Task>,
    /// Elements already promised to woken receivers.
    rx_claims: usize,
    /// Free slots already promised to woken senders.
    tx_claims: usize,
}

impl QueueInner {
    fn deposit(&mut self, item: &[u8]) {
        // Safety: `rear` is in-range and the slot lies within the storage
        // block allocated for `capacity * elem_size` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                item.as_ptr(),
                self.storage.as_ptr().add(self.rear * self.elem_size),
                self.elem_size,
            );
        }
        self.rear = (self.rear + 1) % self.capacity;
        self.len += 1;
    }

    fn extract(&mut self, out: &mut [u8]) {
        // Safety: as in `deposit`, for `front`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.storage.as_ptr().add(self.front * self.elem_size),
                out.as_mut_ptr(),
                self.elem_size,
            );
        }
        self.front = (self.front + 1) % self.capacity;
        self.len -= 1;
    }
}

impl Queue {
    /// Creates a queue of `capacity` elements of `elem_size` bytes each,
    /// with storage from the kernel heap.
    pub fn new(capacity: usize, elem_size: usize) -> Result<Self, KernelError> {
        with_kernel(|k| Self::new_in(k, capacity, elem_size))
    }

    pub(crate) fn new_in(
        k: &mut Kernel,
        capacity: usize,
        elem_size: usize,
    ) -> Result<Self, KernelError> {
        if capacity == 0 || elem_size == 0 {
            return Err(KernelError::BadParameter);
        }
        if !k.heap.is_initialized() {
            return Err(KernelError::MemoryNotInitialized);
        }
        let storage = k
            .heap
            .allocate(capacity * elem_size)
            .ok_or(KernelError::NoMemory)?;
        Ok(Self {
            inner: KCell::new(QueueInner {
                storage,
                capacity,
                elem_size,
                front: 0,
                rear: 0,
                len: 0,
                rx_waiters: List::new(),
                tx_waiters: List::new(),
                rx_claims: 0,
                tx_claims: 0,
            }),
        })
    }

    /// Sends one element, waiting up to `timeout_ticks` for space.
    /// `item` must be exactly the element size.
    pub fn send(&self, item: &[u8], timeout_ticks: u32) -> Result<(), KernelError> {
        if timeout_ticks > MAX_DELAY {
            return Err(KernelError::BadParameter);
        }
        let deadline = arch::now().offset(timeout_ticks);
        if !with_kernel(|k| self.try_send_or_block(k, item, timeout_ticks, deadline))? {
            return Ok(());
        }
        loop {
            if let Some(r) = with_kernel(|k| self.finish_send(k, item, arch::now(), deadline)) {
                return r;
            }
            arch::pend_context_switch();
        }
    }

    /// Receives one element into `out`, waiting up to `timeout_ticks`.
    /// `out` must be exactly the element size.
    pub fn receive(&self, out: &mut [u8], timeout_ticks: u32) -> Result<(), KernelError> {
        if timeout_ticks > MAX_DELAY {
            return Err(KernelError::BadParameter);
        }
        let deadline = arch::now().offset(timeout_ticks);
        if !with_kernel(|k| self.try_receive_or_block(k, out, timeout_ticks, deadline))? {
            return Ok(());
        }
        loop {
            if let Some(r) = with_kernel(|k| self.finish_receive(k, out, arch::now(), deadline)) {
                return r;
            }
            arch::pend_context_switch();
        }
    }

    /// Lock-held send attempt. `Ok(true)` means the caller is now parked
    /// on the sender FIFO.
    fn try_send_or_block(
        &self,
        k: &mut Kernel,
        item: &[u8],
        timeout_ticks: u32,
        deadline: Ticks,
    ) -> Result<bool, KernelError> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        if item.len() != inner.elem_size {
            return Err(KernelError::BadParameter);
        }
        if inner.len + inner.tx_claims < inner.capacity {
            inner.deposit(item);
            if !inner.rx_waiters.is_empty() {
                k.wake_one(&mut inner.rx_waiters);
                inner.rx_claims += 1;
            }
            return Ok(false);
        }
        if timeout_ticks == 0 {
            return Err(KernelError::QueueFull);
        }
        k.block_current(&mut inner.tx_waiters, TaskState::BlockedOnQueue, deadline, 0)?;
        Ok(true)
    }

    /// Lock-held resume phase of a blocking send.
    fn finish_send(
        &self,
        k: &mut Kernel,
        item: &[u8],
        now: Ticks,
        deadline: Ticks,
    ) -> Option<Result<(), KernelError>> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        let cur = match k.current_ptr() {
            Some(c) => c,
            None => return Some(Err(KernelError::BadParameter)),
        };
        // Safety: the current task is live; kernel lock held.
        let task = unsafe { &mut *cur.as_ptr() };
        if task.take_wake_signal() {
            // A receiver reserved this slot for us.
            inner.tx_claims -= 1;
            inner.deposit(item);
            return Some(Ok(()));
        }
        if now.has_reached(deadline) {
            if !task.blocked_on.is_null() {
                // Safety: non-null `blocked_on` is this queue's sender
                // FIFO, which holds the task.
                unsafe {
                    (*task.blocked_on).remove(&mut k.heap, cur);
                }
                task.blocked_on = core::ptr::null_mut();
            }
            return Some(Err(KernelError::QueueTimeout));
        }
        None
    }

    /// Lock-held receive attempt. `Ok(true)` means the caller is now
    /// parked on the receiver FIFO.
    fn try_receive_or_block(
        &self,
        k: &mut Kernel,
        out: &mut [u8],
        timeout_ticks: u32,
        deadline: Ticks,
    ) -> Result<bool, KernelError> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        if out.len() != inner.elem_size {
            return Err(KernelError::BadParameter);
        }
        if inner.len > inner.rx_claims {
            inner.extract(out);
            if !inner.tx_waiters.is_empty() && inner.len + inner.tx_claims < inner.capacity {
                k.wake_one(&mut inner.tx_waiters);
                inner.tx_claims += 1;
            }
            return Ok(false);
        }
        if timeout_ticks == 0 {
            return Err(KernelError::QueueTimeout);
        }
        k.block_current(&mut inner.rx_waiters, TaskState::BlockedOnQueue, deadline, 0)?;
        Ok(true)
    }

    /// Lock-held resume phase of a blocking receive.
    fn finish_receive(
        &self,
        k: &mut Kernel,
        out: &mut [u8],
        now: Ticks,
        deadline: Ticks,
    ) -> Option<Result<(), KernelError>> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        let cur = match k.current_ptr() {
            Some(c) => c,
            None => return Some(Err(KernelError::BadParameter)),
        };
        // Safety: the current task is live; kernel lock held.
        let task = unsafe { &mut *cur.as_ptr() };
        if task.take_wake_signal() {
            // A sender deposited an item and reserved it for us.
            inner.rx_claims -= 1;
            inner.extract(out);
            if !inner.tx_waiters.is_empty() && inner.len + inner.tx_claims < inner.capacity {
                k.wake_one(&mut inner.tx_waiters);
                inner.tx_claims += 1;
            }
            return Some(Ok(()));
        }
        if now.has_reached(deadline) {
            if !task.blocked_on.is_null() {
                // Safety: non-null `blocked_on` is this queue's receiver
                // FIFO, which holds the task.
                unsafe {
                    (*task.blocked_on).remove(&mut k.heap, cur);
                }
                task.blocked_on = core::ptr::null_mut();
            }
            return Some(Err(KernelError::QueueTimeout));
        }
        None
    }

    /// Tears the queue down inside an existing kernel section; test use.
    #[cfg(test)]
    pub(crate) fn destroy_in(mut self, k: &mut Kernel) {
        let inner = self.inner.get_exclusive();
        k.heap.deallocate(inner.storage.as_ptr());
        core::mem::forget(self);
    }
}

impl Drop for Queue {
    /// Returns the storage to the kernel heap. Dropping a queue that
    /// still has blocked waiters is a usage error.
    fn drop(&mut self) {
        let storage = self.inner.get_exclusive().storage;
        with_kernel(|k| k.heap.deallocate(storage.as_ptr()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_support::fresh_kernel;
    use core::ptr::null_mut;
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

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

    #[derive(Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    struct Reading {
        channel: u16,
        flags: u16,
        value: u32,
    }

    #[test]
    fn new_validates_parameters() {
        let mut k = fresh_kernel(8 * 1024);
        assert!(matches!(
            Queue::new_in(&mut k, 0, 4),
            Err(KernelError::BadParameter)
        ));
        assert!(matches!(
            Queue::new_in(&mut k, 4, 0),
            Err(KernelError::BadParameter)
        ));
        let mut cold = Kernel::new();
        assert!(matches!(
            Queue::new_in(&mut cold, 4, 4),
            Err(KernelError::MemoryNotInitialized)
        ));
    }

    #[test]
    fn typed_payload_round_trips_bit_identical() {
        let mut k = fresh_kernel(8 * 1024);
        let q = Queue::new_in(&mut k, 4, core::mem::size_of::<Reading>()).unwrap();
        let sent = Reading {
            channel: 7,
            flags: 0xA5A5,
            value: 0xDEAD_BEEF,
        };
        assert_eq!(q.try_send_or_block(&mut k, sent.as_bytes(), 0, Ticks(0)), Ok(false));
        let mut got = Reading {
            channel: 0,
            flags: 0,
            value: 0,
        };
        assert_eq!(
            q.try_receive_or_block(&mut k, got.as_mut_bytes(), 0, Ticks(0)),
            Ok(false)
        );
        assert_eq!(got, sent);
        q.destroy_in(&mut k);
    }

    #[test]
    fn elements_come_out_in_order_across_the_wrap() {
        let mut k = fresh_kernel(8 * 1024);
        let q = Queue::new_in(&mut k, 2, 4).unwrap();
        let mut out = [0u8; 4];
        // Enough traffic to wrap the cursors a few times.
        for round in 0u32..5 {
            let a = (2 * round).to_le_bytes();
            let b = (2 * round + 1).to_le_bytes();
            q.try_send_or_block(&mut k, &a, 0, Ticks(0)).unwrap();
            q.try_send_or_block(&mut k, &b, 0, Ticks(0)).unwrap();
            q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
            assert_eq!(out, a);
            q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
            assert_eq!(out, b);
        }
        q.destroy_in(&mut k);
    }

    #[test]
    fn immediate_operations_report_full_and_empty() {
        let mut k = fresh_kernel(8 * 1024);
        let q = Queue::new_in(&mut k, 2, 1).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(
            q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)),
            Err(KernelError::QueueTimeout)
        );
        q.try_send_or_block(&mut k, &[1], 0, Ticks(0)).unwrap();
        q.try_send_or_block(&mut k, &[2], 0, Ticks(0)).unwrap();
        assert_eq!(
            q.try_send_or_block(&mut k, &[3], 0, Ticks(0)),
            Err(KernelError::QueueFull)
        );
        q.destroy_in(&mut k);
    }

    #[test]
    fn wrong_length_is_a_parameter_error() {
        let mut k = fresh_kernel(8 * 1024);
        let q = Queue::new_in(&mut k, 2, 4).unwrap();
        assert_eq!(
            q.try_send_or_block(&mut k, &[0; 3], 0, Ticks(0)),
            Err(KernelError::BadParameter)
        );
        let mut short = [0u8; 3];
        assert_eq!(
            q.try_receive_or_block(&mut k, &mut short, 0, Ticks(0)),
            Err(KernelError::BadParameter)
        );
        q.destroy_in(&mut k);
    }

    #[test]
    fn send_hands_an_item_to_the_blocked_receiver() {
        let mut k = fresh_kernel(16 * 1024);
        let q = Queue::new_in(&mut k, 2, 1).unwrap();
        let receiver = spawn_running(&mut k, "rx");
        let mut out = [0u8; 1];
        assert_eq!(
            q.try_receive_or_block(&mut k, &mut out, 100, Ticks(100)),
            Ok(true)
        );
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*receiver.as_ptr()).state, TaskState::BlockedOnQueue);
        }

        // Producer context: the deposit wakes and claims for the waiter.
        let producer = spawn_running(&mut k, "tx");
        q.try_send_or_block(&mut k, &[42], 0, Ticks(0)).unwrap();
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*receiver.as_ptr()).state, TaskState::Ready);
        }

        // The item is claimed: a try-receive by anyone else comes up dry.
        let mut steal = [0u8; 1];
        assert_eq!(
            q.try_receive_or_block(&mut k, &mut steal, 0, Ticks(0)),
            Err(KernelError::QueueTimeout)
        );
        let _ = producer;

        // The woken receiver collects its element.
        k.current = Some(receiver);
        assert_eq!(
            q.finish_receive(&mut k, &mut out, Ticks(1), Ticks(100)),
            Some(Ok(()))
        );
        assert_eq!(out, [42]);
        q.destroy_in(&mut k);
    }

    #[test]
    fn receive_frees_a_slot_for_the_blocked_sender() {
        let mut k = fresh_kernel(16 * 1024);
        let q = Queue::new_in(&mut k, 2, 1).unwrap();
        let sender = spawn_running(&mut k, "tx");
        q.try_send_or_block(&mut k, &[0xAA], 0, Ticks(0)).unwrap();
        q.try_send_or_block(&mut k, &[0xBB], 0, Ticks(0)).unwrap();
        // Queue full: the third message blocks.
        assert_eq!(
            q.try_send_or_block(&mut k, &[0xCC], 50, Ticks(50)),
            Ok(true)
        );

        // Consumer drains one element; the blocked sender gets the slot.
        let consumer = spawn_running(&mut k, "rx");
        let mut out = [0u8; 1];
        q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(out, [0xAA]);
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*sender.as_ptr()).state, TaskState::Ready);
        }

        // The freed slot is reserved: another fast sender bounces.
        assert_eq!(
            q.try_send_or_block(&mut k, &[0xEE], 0, Ticks(0)),
            Err(KernelError::QueueFull)
        );
        let _ = consumer;

        // The woken sender lands its element; order is preserved.
        k.current = Some(sender);
        assert_eq!(
            q.finish_send(&mut k, &[0xCC], Ticks(1), Ticks(50)),
            Some(Ok(()))
        );
        q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(out, [0xBB]);
        q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(out, [0xCC]);
        q.destroy_in(&mut k);
    }

    #[test]
    fn blocking_receive_times_out_clean() {
        let mut k = fresh_kernel(16 * 1024);
        let q = Queue::new_in(&mut k, 2, 1).unwrap();
        let _rx = spawn_running(&mut k, "rx");
        let mut out = [0u8; 1];
        assert_eq!(
            q.try_receive_or_block(&mut k, &mut out, 10, Ticks(10)),
            Ok(true)
        );
        assert_eq!(q.finish_receive(&mut k, &mut out, Ticks(9), Ticks(10)), None);
        assert_eq!(
            q.finish_receive(&mut k, &mut out, Ticks(10), Ticks(10)),
            Some(Err(KernelError::QueueTimeout))
        );
        // Fully unlinked: a later send goes to storage, not a ghost.
        q.try_send_or_block(&mut k, &[7], 0, Ticks(0)).unwrap();
        q.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(out, [7]);
        q.destroy_in(&mut k);
    }

    #[test]
    fn storage_returns_to_the_heap() {
        let mut k = fresh_kernel(8 * 1024);
        let before = k.heap.free_bytes();
        let q = Queue::new_in(&mut k, 8, 16).unwrap();
        assert!(k.heap.free_bytes() < before);
        q.destroy_in(&mut k);
        assert_eq!(k.heap.free_bytes(), before);
    }
}
