// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Circular buffer: the byte-granular sibling of the bounded queue.
//!
//! Transfers are arbitrary byte runs, copied in at the head cursor and
//! out at the tail cursor in up to two segments around the wrap point.
//! Sent and received lengths need not match, but each receive is atomic:
//! it completes only when the full requested length is available, never
//! partially.
//!
//! Because requirements vary per waiter, a blocked task records its byte
//! count and is woken only when the whole amount can be *claimed* for it;
//! claimed bytes (or claimed free space, for blocked senders) are
//! invisible to fast-path callers until the woken task collects them.
//!
//! Timeout zero means try: `CircularBufferFull` for a send beyond the
//! free capacity, `CircularBufferTimeout` for a receive short of bytes.
//! Blocking expiry reports `CircularBufferTimeout` either way.

use core::ptr::NonNull;

use abi::{KernelError, TaskState};

use crate::arch;
use crate::kcell::KCell;
use crate::list::List;
use crate::startup::{with_kernel, Kernel};
use crate::task::Task;
use crate::time::{Ticks, MAX_DELAY};

pub struct CircularBuffer {
    inner: KCell<RingInner>,
}

struct RingInner {
    storage: NonNull<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    len: usize,
    rx_waiters: List<Task>,
    tx_waiters: List<Task>,
    /// Bytes already promised to woken receivers.
    rx_claimed: usize,
    /// Free bytes already promised to woken senders.
    tx_claimed: usize,
}

impl RingInner {
    fn unclaimed_bytes(&self) -> usize {
        self.len - self.rx_claimed
    }

    fn unclaimed_space(&self) -> usize {
        self.capacity - self.len - self.tx_claimed
    }

    /// Copies `data` in at the head cursor, splitting at the wrap point.
    fn write_wrapped(&mut self, data: &[u8]) {
        let first = data.len().min(self.capacity - self.head);
        // Safety: both segments lie within the storage block; `head` and
        // `len` bookkeeping guarantees no live byte is overwritten.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.storage.as_ptr().add(self.head),
                first,
            );
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(first),
                self.storage.as_ptr(),
                data.len() - first,
            );
        }
        self.head = (self.head + data.len()) % self.capacity;
        self.len += data.len();
    }

    /// Copies `out.len()` bytes out at the tail cursor, splitting at the
    /// wrap point.
    fn read_wrapped(&mut self, out: &mut [u8]) {
        let first = out.len().min(self.capacity - self.tail);
        // Safety: as in `write_wrapped`, for the tail side.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.storage.as_ptr().add(self.tail),
                out.as_mut_ptr(),
                first,
            );
            core::ptr::copy_nonoverlapping(
                self.storage.as_ptr(),
                out.as_mut_ptr().add(first),
                out.len() - first,
            );
        }
        self.tail = (self.tail + out.len()) % self.capacity;
        self.len -= out.len();
    }
}

impl CircularBuffer {
    /// Creates a buffer of `capacity` bytes from the kernel heap.
    pub fn new(capacity: usize) -> Result<Self, KernelError> {
        with_kernel(|k| Self::new_in(k, capacity))
    }

    pub(crate) fn new_in(k: &mut Kernel, capacity: usize) -> Result<Self, KernelError> {
        if capacity == 0 {
            return Err(KernelError::BadParameter);
        }
        if !k.heap.is_initialized() {
            return Err(KernelError::MemoryNotInitialized);
        }
        let storage = k.heap.allocate(capacity).ok_or(KernelError::NoMemory)?;
        Ok(Self {
            inner: KCell::new(RingInner {
                storage,
                capacity,
                head: 0,
                tail: 0,
                len: 0,
                rx_waiters: List::new(),
                tx_waiters: List::new(),
                rx_claimed: 0,
                tx_claimed: 0,
            }),
        })
    }

    /// Writes all of `data`, waiting up to `timeout_ticks` for room.
    pub fn send(&self, data: &[u8], timeout_ticks: u32) -> Result<(), KernelError> {
        if timeout_ticks > MAX_DELAY {
            return Err(KernelError::BadParameter);
        }
        let deadline = arch::now().offset(timeout_ticks);
        if !with_kernel(|k| self.try_send_or_block(k, data, timeout_ticks, deadline))? {
            return Ok(());
        }
        loop {
            if let Some(r) = with_kernel(|k| self.finish_send(k, data, arch::now(), deadline)) {
                return r;
            }
            arch::pend_context_switch();
        }
    }

    /// Reads exactly `out.len()` bytes, waiting up to `timeout_ticks`
    /// for them to arrive.
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

    fn try_send_or_block(
        &self,
        k: &mut Kernel,
        data: &[u8],
        timeout_ticks: u32,
        deadline: Ticks,
    ) -> Result<bool, KernelError> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        if data.is_empty() || data.len() > inner.capacity {
            return Err(KernelError::BadParameter);
        }
        if data.len() <= inner.unclaimed_space() {
            inner.write_wrapped(data);
            Self::service_waiters(k, inner);
            return Ok(false);
        }
        if timeout_ticks == 0 {
            return Err(KernelError::CircularBufferFull);
        }
        k.block_current(
            &mut inner.tx_waiters,
            TaskState::BlockedOnCircularBuffer,
            deadline,
            data.len(),
        )?;
        Ok(true)
    }

    fn finish_send(
        &self,
        k: &mut Kernel,
        data: &[u8],
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
            // Space for the whole run was reserved when we were woken.
            inner.tx_claimed -= data.len();
            inner.write_wrapped(data);
            Self::service_waiters(k, inner);
            return Some(Ok(()));
        }
        if now.has_reached(deadline) {
            if !task.blocked_on.is_null() {
                // Safety: non-null `blocked_on` is one of this buffer's
                // waiter FIFOs, which holds the task.
                unsafe {
                    (*task.blocked_on).remove(&mut k.heap, cur);
                }
                task.blocked_on = core::ptr::null_mut();
            }
            return Some(Err(KernelError::CircularBufferTimeout));
        }
        None
    }

    fn try_receive_or_block(
        &self,
        k: &mut Kernel,
        out: &mut [u8],
        timeout_ticks: u32,
        deadline: Ticks,
    ) -> Result<bool, KernelError> {
        // Safety: kernel lock held by `with_kernel`.
        let inner = unsafe { self.inner.get_mut() };
        if out.is_empty() || out.len() > inner.capacity {
            return Err(KernelError::BadParameter);
        }
        if out.len() <= inner.unclaimed_bytes() {
            inner.read_wrapped(out);
            Self::service_waiters(k, inner);
            return Ok(false);
        }
        if timeout_ticks == 0 {
            return Err(KernelError::CircularBufferTimeout);
        }
        k.block_current(
            &mut inner.rx_waiters,
            TaskState::BlockedOnCircularBuffer,
            deadline,
            out.len(),
        )?;
        Ok(true)
    }

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
            // Our whole byte run was claimed when we were woken.
            inner.rx_claimed -= out.len();
            inner.read_wrapped(out);
            Self::service_waiters(k, inner);
            return Some(Ok(()));
        }
        if now.has_reached(deadline) {
            if !task.blocked_on.is_null() {
                // Safety: as in `finish_send`.
                unsafe {
                    (*task.blocked_on).remove(&mut k.heap, cur);
                }
                task.blocked_on = core::ptr::null_mut();
            }
            return Some(Err(KernelError::CircularBufferTimeout));
        }
        None
    }

    /// Wakes the head waiter on each side if its whole requirement can
    /// now be claimed. Runs after every successful transfer, so deferred
    /// requirements are revisited as bytes and space flow.
    fn service_waiters(k: &mut Kernel, inner: &mut RingInner) {
        if let Some(w) = inner.rx_waiters.head() {
            // Safety: waiter-set members are live registry members.
            let need = unsafe { (*w.as_ptr()).pending_transfer };
            if need <= inner.unclaimed_bytes() {
                k.wake_one(&mut inner.rx_waiters);
                inner.rx_claimed += need;
            }
        }
        if let Some(w) = inner.tx_waiters.head() {
            // Safety: as above.
            let need = unsafe { (*w.as_ptr()).pending_transfer };
            if need <= inner.unclaimed_space() {
                k.wake_one(&mut inner.tx_waiters);
                inner.tx_claimed += need;
            }
        }
    }

    /// Tears the buffer down inside an existing kernel section; test use.
    #[cfg(test)]
    pub(crate) fn destroy_in(mut self, k: &mut Kernel) {
        let inner = self.inner.get_exclusive();
        k.heap.deallocate(inner.storage.as_ptr());
        core::mem::forget(self);
    }
}

impl Drop for CircularBuffer {
    /// Returns the storage to the kernel heap. Dropping a buffer that
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

    #[test]
    fn copies_split_correctly_at_the_wrap_point() {
        let mut k = fresh_kernel(8 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 8).unwrap();
        // Fill 6, drain 4: the next 5-byte write must wrap.
        rb.try_send_or_block(&mut k, &[1, 2, 3, 4, 5, 6], 0, Ticks(0))
            .unwrap();
        let mut four = [0u8; 4];
        rb.try_receive_or_block(&mut k, &mut four, 0, Ticks(0)).unwrap();
        assert_eq!(four, [1, 2, 3, 4]);
        rb.try_send_or_block(&mut k, &[7, 8, 9, 10, 11], 0, Ticks(0))
            .unwrap();
        let mut seven = [0u8; 7];
        rb.try_receive_or_block(&mut k, &mut seven, 0, Ticks(0)).unwrap();
        assert_eq!(seven, [5, 6, 7, 8, 9, 10, 11]);
        rb.destroy_in(&mut k);
    }

    #[test]
    fn lengths_need_not_match_between_sides() {
        let mut k = fresh_kernel(8 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 16).unwrap();
        rb.try_send_or_block(&mut k, &[0xAA; 3], 0, Ticks(0)).unwrap();
        rb.try_send_or_block(&mut k, &[0xBB; 5], 0, Ticks(0)).unwrap();
        let mut out = [0u8; 8];
        rb.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(&out[..3], &[0xAA; 3]);
        assert_eq!(&out[3..], &[0xBB; 5]);
        rb.destroy_in(&mut k);
    }

    #[test]
    fn immediate_operations_report_full_and_short() {
        let mut k = fresh_kernel(8 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 4).unwrap();
        rb.try_send_or_block(&mut k, &[1, 2, 3], 0, Ticks(0)).unwrap();
        assert_eq!(
            rb.try_send_or_block(&mut k, &[4, 5], 0, Ticks(0)),
            Err(KernelError::CircularBufferFull)
        );
        let mut big = [0u8; 4];
        assert_eq!(
            rb.try_receive_or_block(&mut k, &mut big, 0, Ticks(0)),
            Err(KernelError::CircularBufferTimeout)
        );
        rb.destroy_in(&mut k);
    }

    #[test]
    fn degenerate_lengths_are_parameter_errors() {
        let mut k = fresh_kernel(8 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 4).unwrap();
        assert_eq!(
            rb.try_send_or_block(&mut k, &[], 0, Ticks(0)),
            Err(KernelError::BadParameter)
        );
        assert_eq!(
            rb.try_send_or_block(&mut k, &[0; 5], 0, Ticks(0)),
            Err(KernelError::BadParameter)
        );
        assert!(matches!(
            CircularBuffer::new_in(&mut k, 0),
            Err(KernelError::BadParameter)
        ));
        rb.destroy_in(&mut k);
    }

    #[test]
    fn receiver_wakes_only_when_its_whole_run_is_there() {
        let mut k = fresh_kernel(16 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 16).unwrap();
        let receiver = spawn_running(&mut k, "rx");
        let mut out = [0u8; 6];
        assert_eq!(
            rb.try_receive_or_block(&mut k, &mut out, 100, Ticks(100)),
            Ok(true)
        );

        let _producer = spawn_running(&mut k, "tx");
        // Four bytes are not enough for a six-byte requirement.
        rb.try_send_or_block(&mut k, &[1, 2, 3, 4], 0, Ticks(0)).unwrap();
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!(
                (*receiver.as_ptr()).state,
                TaskState::BlockedOnCircularBuffer
            );
        }
        // Two more complete the run and claim all six bytes.
        rb.try_send_or_block(&mut k, &[5, 6], 0, Ticks(0)).unwrap();
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*receiver.as_ptr()).state, TaskState::Ready);
        }

        // Claimed bytes are invisible to a fast-path receive.
        let mut steal = [0u8; 1];
        assert_eq!(
            rb.try_receive_or_block(&mut k, &mut steal, 0, Ticks(0)),
            Err(KernelError::CircularBufferTimeout)
        );

        k.current = Some(receiver);
        assert_eq!(
            rb.finish_receive(&mut k, &mut out, Ticks(1), Ticks(100)),
            Some(Ok(()))
        );
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        rb.destroy_in(&mut k);
    }

    #[test]
    fn sender_wakes_when_space_opens() {
        let mut k = fresh_kernel(16 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 8).unwrap();
        let sender = spawn_running(&mut k, "tx");
        rb.try_send_or_block(&mut k, &[0x11; 6], 0, Ticks(0)).unwrap();
        assert_eq!(
            rb.try_send_or_block(&mut k, &[0x22; 4], 50, Ticks(50)),
            Ok(true)
        );

        let _consumer = spawn_running(&mut k, "rx");
        let mut out = [0u8; 5];
        rb.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        // 7 bytes free, 4 claimed for the woken sender.
        // Safety: single-threaded test, task is live.
        unsafe {
            assert_eq!((*sender.as_ptr()).state, TaskState::Ready);
        }
        // Only 3 unclaimed bytes of space remain.
        assert_eq!(
            rb.try_send_or_block(&mut k, &[0x33; 4], 0, Ticks(0)),
            Err(KernelError::CircularBufferFull)
        );

        k.current = Some(sender);
        assert_eq!(
            rb.finish_send(&mut k, &[0x22; 4], Ticks(1), Ticks(50)),
            Some(Ok(()))
        );
        let mut rest = [0u8; 5];
        rb.try_receive_or_block(&mut k, &mut rest, 0, Ticks(0)).unwrap();
        assert_eq!(rest, [0x11, 0x22, 0x22, 0x22, 0x22]);
        rb.destroy_in(&mut k);
    }

    #[test]
    fn blocked_receive_timeout_cleans_up() {
        let mut k = fresh_kernel(16 * 1024);
        let rb = CircularBuffer::new_in(&mut k, 8).unwrap();
        let _rx = spawn_running(&mut k, "rx");
        let mut out = [0u8; 4];
        assert_eq!(
            rb.try_receive_or_block(&mut k, &mut out, 10, Ticks(10)),
            Ok(true)
        );
        assert_eq!(rb.finish_receive(&mut k, &mut out, Ticks(9), Ticks(10)), None);
        assert_eq!(
            rb.finish_receive(&mut k, &mut out, Ticks(10), Ticks(10)),
            Some(Err(KernelError::CircularBufferTimeout))
        );
        // The waiter FIFO is empty again; traffic flows normally.
        rb.try_send_or_block(&mut k, &[9, 9, 9, 9], 0, Ticks(0)).unwrap();
        rb.try_receive_or_block(&mut k, &mut out, 0, Ticks(0)).unwrap();
        assert_eq!(out, [9, 9, 9, 9]);
        rb.destroy_in(&mut k);
    }
}
