// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M (mainline, FPU present).
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel time base. Its counter is
//! small and only counts down, so at each SysTick interrupt we increment
//! the `TICKS` global that contains the real kernel tick count. The
//! reload value is programmed from the configured core clock and tick
//! rate at scheduler start.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses three service routines:
//!
//! - `SVCall` implements the one-shot trap that launches the first task.
//! - `SysTick` maintains the tick count and runs tick housekeeping
//!   (waking expired sleepers).
//! - `PendSV` performs deferred context switches.
//!
//! The split exists because of interrupt latency: a full context save is
//! only worth paying for when a switch will actually happen. Any code --
//! task-level API or ISR -- that decides a switch is needed pokes the
//! PendSV pending bit and carries on; PendSV is configured at the lowest
//! exception priority, so it runs once every other handler has drained,
//! saves the outgoing task's state onto its own stack, asks the scheduler
//! for the next task, and restores that task's state.
//!
//! We didn't invent this idea -- it's covered in most books on the
//! Cortex-M.
//!
//! # Saved context layout
//!
//! On exception entry the hardware stacks `r0-r3, r12, lr, pc, xpsr` (and
//! the caller-saved half of the FPU registers when the task has touched
//! the FPU). PendSV pushes the rest below it, giving this ascending
//! layout starting at the descriptor's stack-top cursor:
//!
//! ```text
//! psplim, exc_return, r4-r11, s16-s31, | r0-r3, r12, lr, pc, xpsr
//! ```
//!
//! The cursor lives in the first word of the task descriptor so the
//! assembly can reach it without knowing the rest of the layout. On
//! ARMv7-M, which has no PSPLIM register, the first slot is kept (as
//! zero) so both profiles share one frame shape.
//!
//! # Interrupt priorities
//!
//! All three kernel exceptions run at the lowest priority and thus never
//! preempt other ISRs or each other. Kernel data is guarded by raising
//! `BASEPRI` to [`MAX_SYSCALL_PRIORITY`]; interrupt handlers that call
//! into kernel entry points (e.g. semaphore signal) must be configured at
//! that priority or numerically above it.

use core::arch::global_asm;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::task::Task;
use crate::time::Ticks;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed");
        }
    };
}

cfg_if::cfg_if! {
    if #[cfg(not(any(armv7m, armv8m)))] {
        compile_error!("this port supports ARMv7-M and mainline ARMv8-M only");
    }
}

/// On ARMvx-M we have to use a global to record the current task pointer,
/// since we don't have a scratch register; the exception handlers address
/// it by name.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());

/// Kernel tick count. 32 bits, free-running, expected to wrap; all
/// consumers compare with wrapping arithmetic (see `time`).
static TICKS: AtomicU32 = AtomicU32::new(0);

/// `BASEPRI` value delimiting the maximum-syscall interrupt priority.
/// Interrupts at this priority or numerically above cannot preempt kernel
/// critical sections.
pub const MAX_SYSCALL_PRIORITY: u32 = 2 << 5;

/// Initial xPSR: just the Thumb mode bit.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN for the first dispatch of every task: return to Thread
/// mode, Process stack, standard (non-FP) frame. Once a task touches the
/// FPU the hardware updates this on subsequent exception entries.
const INITIAL_EXC_RETURN: u32 = 0xFFFF_FFFD;

/// Smallest stack, in words, that can hold an initial context frame with
/// a little room to run.
pub const MIN_STACK_WORDS: usize = 64;

/// Stuff the hardware places on the stack at exception entry whether or
/// not an FPU is present.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// The complete initial frame: the software-saved area PendSV/SVCall pop,
/// followed by the hardware frame popped on exception return.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct InitialFrame {
    psplim: u32,
    exc_return: u32,
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    fpu_regs: [u32; 16],
    base: BaseExceptionFrame,
}

/// Lays out an initial saved-context frame on `task`'s stack such that
/// the first dispatch is equivalent to calling `entry(arg)`, and records
/// the frame address as the task's stack-top cursor.
///
/// If the entry function ever returns, control lands in
/// `task_exit_landing`, which deletes the task.
pub fn reinitialize(task: &mut Task) {
    let (base, words) = task.stack_region();
    uassert!(words >= MIN_STACK_WORDS);

    // Modern ARMvX-M machines require 8-byte stack alignment.
    let top = (base.as_ptr() as usize + words * 4) & !7;
    let frame_addr = top - core::mem::size_of::<InitialFrame>();
    uassert!(frame_addr >= base.as_ptr() as usize);
    uassert!(frame_addr & 7 == 0);

    let mut frame = InitialFrame::default();
    frame.psplim = base.as_ptr() as u32;
    frame.exc_return = INITIAL_EXC_RETURN;
    frame.base.r0 = task.arg() as u32;
    frame.base.lr = (task_exit_landing as usize as u32) | 1; // thumb
    frame.base.pc = (task.entry() as usize as u32) | 1; // thumb
    frame.base.xpsr = INITIAL_PSR;

    // Safety: the frame range lies within the task's owned stack; the
    // alignment was just established.
    unsafe {
        (frame_addr as *mut InitialFrame).write(frame);
    }
    task.set_stack_top(frame_addr as *mut u32);
}

/// Where tasks land if their entry function returns: the task deletes
/// itself, which never returns.
extern "C" fn task_exit_landing() -> ! {
    crate::task::exit()
}

/// Records `task` as the current user task.
///
/// # Safety
///
/// This records a pointer that aliases `task`. The caller must ensure the
/// task stays live for as long as it is current -- in practice, that
/// deleted tasks go through the zombie list rather than being freed while
/// the pointer can still be observed.
pub unsafe fn set_current_task(task: NonNull<Task>) {
    CURRENT_TASK_PTR.store(task.as_ptr(), Ordering::Relaxed);
    crate::profiling::event_context_switch(task.as_ptr() as usize);
}

/// Sets the PendSV pending bit. The switch happens once the current
/// handler chain drains and `BASEPRI` permits.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Reads the tick counter.
pub fn now() -> Ticks {
    Ticks(TICKS.load(Ordering::Relaxed))
}

/// Reads the DWT cycle counter, enabled at scheduler start. Wraps; all
/// consumers use wrapping differences.
pub fn cycle_count() -> u32 {
    // Safety: reading CYCCNT has no side effects.
    unsafe { (*cortex_m::peripheral::DWT::PTR).cyccnt.read() }
}

/// Raises `BASEPRI` to the maximum-syscall level and returns the previous
/// value for `restore_syscall_mask`.
pub fn raise_syscall_mask() -> u32 {
    let prev: u32;
    // Safety: raising BASEPRI only defers interrupts; the paired restore
    // puts the previous value back.
    unsafe {
        core::arch::asm!(
            "mrs {prev}, BASEPRI",
            "msr BASEPRI, {new}",
            "dsb",
            "isb",
            prev = out(reg) prev,
            new = in(reg) MAX_SYSCALL_PRIORITY,
            options(preserves_flags),
        );
    }
    prev
}

/// Restores a `BASEPRI` value captured by `raise_syscall_mask`.
pub fn restore_syscall_mask(prev: u32) {
    // Safety: `prev` came from the paired raise, so this only ever lowers
    // the mask back to where it was.
    unsafe {
        core::arch::asm!(
            "msr BASEPRI, {prev}",
            "dsb",
            "isb",
            prev = in(reg) prev,
            options(preserves_flags),
        );
    }
}

/// Idles the core until the next interrupt.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Starts the kernel: configures exception priorities, the cycle counter
/// and the tick timer, records `task` as current, and traps into the
/// SVCall handler, which dispatches it. Never returns.
///
/// `tick_divisor` is core-clock cycles per kernel tick.
pub fn start_first_task(tick_divisor: u32, task: &mut Task) -> ! {
    uassert!(tick_divisor > 0);

    // Safety: we're purely lowering exception priorities from their reset
    // defaults, which can't cause surprise preemption; the register API
    // is just conservatively unsafe.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Set priority of SVCall to the lowest configurable.
        scb.shpr[7].write(0xFF);
        // SysTick and PendSV also to the lowest, so the kernel is
        // non-preemptive with respect to itself and every other ISR.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);
    }

    // Turn the DWT cycle counter on for execution-time accounting.
    //
    // Safety: enabling trace units and the cycle counter has no memory
    // safety implications.
    unsafe {
        let dcb = &*cortex_m::peripheral::DCB::PTR;
        const TRCENA: u32 = 1 << 24;
        dcb.demcr.modify(|v| v | TRCENA);
        let dwt = &*cortex_m::peripheral::DWT::PTR;
        dwt.cyccnt.write(0);
        const CYCCNTENA: u32 = 1;
        dwt.ctrl.modify(|v| v | CYCCNTENA);
    }

    // Safety: programming SysTick before interrupts are live.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Processor clock, interrupt on, counter on.
        syst.csr.modify(|v| v | 0b111);
    }

    CURRENT_TASK_PTR.store(task, Ordering::Relaxed);

    // Trap into handler mode; the SVCall handler restores the first
    // task's context and drops to Thread mode on the process stack.
    //
    // Safety: this is the one-way door out of kernel startup.
    unsafe {
        core::arch::asm!(
            "cpsie i",
            "cpsie f",
            "dsb",
            "isb",
            "svc #0",
            options(noreturn),
        );
    }
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::on_tick();
}

// SVCall: used exactly once, to dispatch the first task at scheduler
// start. It restores the context frame that `reinitialize` built for the
// task in CURRENT_TASK_PTR, switches Thread mode onto the process stack,
// and unmasks interrupts.
cfg_if::cfg_if! {
    if #[cfg(armv8m)] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r0, [r0]
                @ first descriptor word is the stack-top cursor.
                ldr r0, [r0]
                @ pop psplim (r2), exc_return (r3), then r4-r11.
                ldmia r0!, {{r2-r11}}
                msr PSPLIM, r2
                vldmia r0!, {{s16-s31}}
                msr PSP, r0
                @ Thread mode uses PSP, stays privileged.
                movs r1, #2
                msr CONTROL, r1
                isb
                movs r1, #0
                msr BASEPRI, r1
                bx r3
            ",
        }
    } else {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r0, [r0]
                @ first descriptor word is the stack-top cursor.
                ldr r0, [r0]
                @ pop the psplim slot (ignored on v7-M), exc_return, r4-r11.
                ldmia r0!, {{r2-r11}}
                vldmia r0!, {{s16-s31}}
                msr PSP, r0
                @ Thread mode uses PSP, stays privileged.
                movs r1, #2
                msr CONTROL, r1
                isb
                movs r1, #0
                msr BASEPRI, r1
                bx r3
            ",
        }
    }
}

// PendSV: the deferred context switch. Saves the outgoing task's state
// below its hardware-stacked frame, records the cursor in the descriptor,
// lets the scheduler pick the next task, and restores symmetrically.
cfg_if::cfg_if! {
    if #[cfg(armv8m)] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                isb
                @ callee-saved half of the FPU state; the rest is in the
                @ hardware frame.
                vstmdb r0!, {{s16-s31}}
                mrs r2, PSPLIM
                mov r3, lr
                @ stores psplim, exc_return, r4-r11 below the FP area.
                stmdb r0!, {{r2-r11}}
                @ write the cursor into the outgoing descriptor.
                movw r1, #:lower16:CURRENT_TASK_PTR
                movt r1, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r1]
                str r0, [r1]

                bl pendsv_entry

                @ we're returning into *some* task, maybe not the same one.
                movw r1, #:lower16:CURRENT_TASK_PTR
                movt r1, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r1]
                ldr r0, [r1]
                ldmia r0!, {{r2-r11}}
                msr PSPLIM, r2
                mov lr, r3
                vldmia r0!, {{s16-s31}}
                msr PSP, r0
                bx lr
            ",
        }
    } else {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                isb
                @ callee-saved half of the FPU state; the rest is in the
                @ hardware frame.
                vstmdb r0!, {{s16-s31}}
                @ no PSPLIM on v7-M; keep the slot so frames line up.
                movs r2, #0
                mov r3, lr
                @ stores the psplim slot, exc_return, r4-r11.
                stmdb r0!, {{r2-r11}}
                @ write the cursor into the outgoing descriptor.
                movw r1, #:lower16:CURRENT_TASK_PTR
                movt r1, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r1]
                str r0, [r1]

                bl pendsv_entry

                @ we're returning into *some* task, maybe not the same one.
                movw r1, #:lower16:CURRENT_TASK_PTR
                movt r1, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r1]
                ldr r0, [r1]
                ldmia r0!, {{r2-r11}}
                mov lr, r3
                vldmia r0!, {{s16-s31}}
                msr PSP, r0
                bx lr
            ",
        }
    }
}

/// The Rust side of the PendSV handler, after the outgoing task's state
/// has been saved and its cursor recorded.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    // A switch cannot be pended before the kernel has started.
    uassert!(NonNull::new(CURRENT_TASK_PTR.load(Ordering::Relaxed)).is_some());
    crate::sched::switch_context();
}
