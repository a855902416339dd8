// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-to-task message passing.
//!
//! A send copies the payload into a heap-allocated message and appends it
//! to the receiving task's mailbox FIFO. Receives poll the caller's own
//! mailbox, ceding the CPU between polls; they do not introduce a new
//! blocked state. The returned [`Envelope`] owns the heap storage and
//! returns it when dropped.
//!
//! Mailboxes are drained -- storage and all -- when their task is
//! deleted.

use core::ptr::{self, NonNull};

use abi::KernelError;

use crate::arch;
use crate::heap::Heap;
use crate::list::List;
use crate::startup::{with_kernel, Kernel};
use crate::task::TaskHandle;
use crate::time::MAX_DELAY;

/// A delivered message, kernel-side. Lives on the kernel heap along with
/// its payload copy.
pub(crate) struct Message {
    /// The sending task, when the send happened in task context.
    sender: Option<TaskHandle>,
    message_id: u32,
    /// Payload copy; null when `len` is zero.
    data: *mut u8,
    len: usize,
}

/// Copies `payload` to `receiver`'s mailbox under `message_id`.
pub fn send(receiver: TaskHandle, message_id: u32, payload: &[u8]) -> Result<(), KernelError> {
    with_kernel(|k| send_in(k, receiver, message_id, payload))
}

pub(crate) fn send_in(
    k: &mut Kernel,
    receiver: TaskHandle,
    message_id: u32,
    payload: &[u8],
) -> Result<(), KernelError> {
    if !k.heap.is_initialized() {
        return Err(KernelError::MemoryNotInitialized);
    }
    let target = k.find_task(receiver).ok_or(KernelError::TaskNotFound)?;
    let sender = k.current_ptr().map(TaskHandle::new);

    let message = k
        .heap
        .allocate(core::mem::size_of::<Message>())
        .ok_or(KernelError::NoMemory)?
        .cast::<Message>();
    let data = if payload.is_empty() {
        ptr::null_mut()
    } else {
        match k.heap.allocate(payload.len()) {
            Some(p) => {
                // Safety: fresh allocation of `payload.len()` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(payload.as_ptr(), p.as_ptr(), payload.len());
                }
                p.as_ptr()
            }
            None => {
                k.heap.deallocate(message.as_ptr().cast());
                return Err(KernelError::NoMemory);
            }
        }
    };
    // Safety: fresh, sufficiently aligned allocation.
    unsafe {
        message.as_ptr().write(Message {
            sender,
            message_id,
            data,
            len: payload.len(),
        });
    }

    // Safety: `target` is a live registry member; its mailbox is disjoint
    // from the kernel heap borrow.
    let mailbox = unsafe { &mut (*target.as_ptr()).mailbox };
    if let Err(e) = mailbox.push_tail(&mut k.heap, message) {
        k.heap.deallocate(data);
        k.heap.deallocate(message.as_ptr().cast());
        return Err(e);
    }
    Ok(())
}

/// Takes the oldest message from the caller's mailbox, polling for up to
/// `timeout_ticks`. Zero means a single poll.
pub fn receive(timeout_ticks: u32) -> Result<Envelope, KernelError> {
    if timeout_ticks > MAX_DELAY {
        return Err(KernelError::BadParameter);
    }
    // Only a running task has a mailbox to poll.
    if with_kernel(|k| k.current_ptr().is_none()) {
        return Err(KernelError::BadParameter);
    }
    let deadline = arch::now().offset(timeout_ticks);
    loop {
        if let Some(message) = with_kernel(receive_in) {
            return Ok(Envelope { message });
        }
        if timeout_ticks == 0 || arch::now().has_reached(deadline) {
            return Err(KernelError::IpcTimeout);
        }
        arch::pend_context_switch();
    }
}

pub(crate) fn receive_in(k: &mut Kernel) -> Option<NonNull<Message>> {
    let cur = k.current_ptr()?;
    // Safety: the current task is live; its mailbox is disjoint from the
    // kernel heap borrow.
    let mailbox = unsafe { &mut (*cur.as_ptr()).mailbox };
    mailbox.pop_head(&mut k.heap)
}

/// Frees one message and its payload copy.
pub(crate) fn free_message(heap: &mut Heap, message: NonNull<Message>) {
    // Safety: messages are only reachable from one mailbox or envelope,
    // so this runs once per message.
    let data = unsafe { (*message.as_ptr()).data };
    heap.deallocate(data);
    heap.deallocate(message.as_ptr().cast());
}

/// Releases every queued message; used when a task is deleted.
pub(crate) fn drain_mailbox(heap: &mut Heap, mailbox: &mut List<Message>) {
    while let Some(m) = mailbox.pop_head(heap) {
        free_message(heap, m);
    }
}

/// A received message. Holds the kernel-heap storage until dropped.
pub struct Envelope {
    message: NonNull<Message>,
}

impl Envelope {
    pub fn sender(&self) -> Option<TaskHandle> {
        // Safety: the envelope owns the message allocation.
        unsafe { (*self.message.as_ptr()).sender }
    }

    pub fn message_id(&self) -> u32 {
        // Safety: as in `sender`.
        unsafe { (*self.message.as_ptr()).message_id }
    }

    pub fn data(&self) -> &[u8] {
        // Safety: the envelope owns the message and its payload; `data`
        // is null only when `len` is zero.
        unsafe {
            let m = &*self.message.as_ptr();
            if m.len == 0 {
                &[]
            } else {
                core::slice::from_raw_parts(m.data, m.len)
            }
        }
    }

    /// Frees the message inside an existing kernel section; test use.
    #[cfg(test)]
    pub(crate) fn release_in(self, k: &mut Kernel) {
        free_message(&mut k.heap, self.message);
        core::mem::forget(self);
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        let message = self.message;
        with_kernel(|k| free_message(&mut k.heap, message));
    }
}
