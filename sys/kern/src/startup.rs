// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, configuration, and the kernel singleton.
//!
//! All mutable kernel state -- the heap, the task registry, the current
//! task, the timer list -- lives in one [`Kernel`] value constructed at
//! boot and destroyed only by reset. Access goes through [`with_kernel`],
//! which raises the interrupt mask to the maximum-syscall level and
//! detects reentry, forming an ad-hoc mutex around the whole structure.
//! Interrupt handlers that call kernel entry points must therefore be
//! configured at or numerically above that priority level, or they could
//! preempt a critical section and trip the reentry check.

use core::convert::Infallible;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use abi::{KernelError, TaskState};

use crate::arch;
use crate::heap::Heap;
use crate::kcell::KCell;
use crate::list::List;
use crate::sched::LoadSampler;
use crate::task::{self, Task};
use crate::timer::{self, SoftwareTimer};

/// Stack sizes for the two tasks the kernel creates on its own behalf.
const IDLE_STACK_WORDS: usize = 64;
const TIMER_SVC_STACK_WORDS: usize = 256;

/// The whole of the kernel's mutable state.
pub(crate) struct Kernel {
    pub(crate) heap: Heap,
    /// Registry of every live task, oldest first. Owns the descriptors.
    pub(crate) tasks: List<Task>,
    /// Deleted-while-running descriptors awaiting a safe free.
    pub(crate) zombies: List<Task>,
    /// Registered software timers. Storage is caller-owned.
    pub(crate) timers: List<SoftwareTimer>,
    pub(crate) current: Option<NonNull<Task>>,
    pub(crate) idle: Option<NonNull<Task>>,
    pub(crate) started: bool,
    pub(crate) load: LoadSampler,
}

impl Kernel {
    pub(crate) const fn new() -> Self {
        Self {
            heap: Heap::new(),
            tasks: List::new(),
            zombies: List::new(),
            timers: List::new(),
            current: None,
            idle: None,
            started: false,
            load: LoadSampler::new(),
        }
    }
}

static KERNEL: KCell<Kernel> = KCell::new(Kernel::new());

/// Tracks when a mutable reference to the kernel is floating around in
/// kernel code, to prevent production of a second one.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(false);

/// Runs `body` with exclusive access to the kernel singleton, inside the
/// kernel critical section.
///
/// Panics on reentry; see the module docs for the priority discipline
/// that makes reentry impossible in correct configurations.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    let restore = arch::raise_syscall_mask();
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel
    }
    // Safety: the mask is raised and the reentry flag held, so this
    // reference is unique for the duration of `body`.
    let r = body(unsafe { KERNEL.get_mut() });
    KERNEL_IN_USE.store(false, Ordering::Release);
    arch::restore_syscall_mask(restore);
    r
}

// Configuration, set before `start` and read-only afterwards.

static CORE_CLOCK_HZ: AtomicU32 = AtomicU32::new(150_000_000);
static TICK_RATE_HZ: AtomicU32 = AtomicU32::new(1_000);
static MAX_TASK_PRIORITY: AtomicU8 = AtomicU8::new(10);

/// Sets the core clock used to program the tick timer. Accepted above
/// 1 MHz.
pub fn set_core_clock(hz: u32) -> Result<(), KernelError> {
    if hz <= 1_000_000 {
        return Err(KernelError::BadParameter);
    }
    CORE_CLOCK_HZ.store(hz, Ordering::Relaxed);
    Ok(())
}

/// Sets the kernel tick rate. Accepted below 1 MHz.
pub fn set_tick_rate(hz: u32) -> Result<(), KernelError> {
    if hz == 0 || hz >= 1_000_000 {
        return Err(KernelError::BadParameter);
    }
    TICK_RATE_HZ.store(hz, Ordering::Relaxed);
    Ok(())
}

/// Sets the number of priority levels; task priorities are clamped to
/// one below this. Needs at least 3 so the kernel's own tasks fit below
/// the application's most urgent level.
pub fn set_max_task_priority(max: u8) -> Result<(), KernelError> {
    if max < 3 {
        return Err(KernelError::BadParameter);
    }
    MAX_TASK_PRIORITY.store(max, Ordering::Relaxed);
    Ok(())
}

pub(crate) fn max_task_priority() -> u8 {
    MAX_TASK_PRIORITY.load(Ordering::Relaxed)
}

/// Ticks per second; doubles as the CPU-load sampling interval.
pub(crate) fn tick_rate_hz() -> u32 {
    TICK_RATE_HZ.load(Ordering::Relaxed)
}

/// Installs the heap pool. Required before any allocating operation;
/// rejects a second installation.
pub fn init_memory(pool: &'static mut [MaybeUninit<u8>]) -> Result<(), KernelError> {
    with_kernel(|k| k.heap.init(pool))
}

/// Exact count of free heap payload bytes.
pub fn free_memory() -> usize {
    with_kernel(|k| k.heap.free_bytes())
}

/// Exact count of allocated heap payload bytes.
pub fn allocated_memory() -> usize {
    with_kernel(|k| k.heap.allocated_bytes())
}

/// The idle task: runs when nothing else is Ready, at a priority below
/// every application task, and cedes the CPU the moment the tick ISR
/// finds other work.
fn idle_main(_: *mut ()) {
    loop {
        arch::wait_for_interrupt();
    }
}

/// Starts the scheduler. On success this never returns: the most urgent
/// Ready task is dispatched and the kernel runs until reset.
///
/// Creates the idle task and the software-timer service task, then
/// programs the tick source from the configured core clock and tick
/// rate.
pub fn start() -> Result<Infallible, KernelError> {
    let first = with_kernel(|k| {
        if k.started {
            return Err(KernelError::BadParameter);
        }
        if !k.heap.is_initialized() {
            return Err(KernelError::MemoryNotInitialized);
        }

        let idle = k.create_task(idle_main, "idle", IDLE_STACK_WORDS, core::ptr::null_mut(), 0)?;
        k.idle = Some(idle.raw());
        k.create_task(
            timer::service_main,
            "timer-svc",
            TIMER_SVC_STACK_WORDS,
            core::ptr::null_mut(),
            max_task_priority() - 2,
        )?;

        let first = task::select(&k.tasks, k.idle).unwrap_or(idle.raw());
        // Safety: `first` is a live registry member; kernel lock held.
        unsafe {
            (*first.as_ptr()).state = TaskState::Running;
        }
        k.current = Some(first);
        k.started = true;
        Ok(first)
    })?;

    let divisor = CORE_CLOCK_HZ.load(Ordering::Relaxed) / tick_rate_hz();
    // Safety: `first` is a live registry member, and stays live: tasks
    // are only freed through the registry or zombie paths.
    unsafe {
        arch::set_current_task(first);
        arch::start_first_task(divisor, &mut *first.as_ptr())
    }
}
