//! Interrupt dispatch.
//!
//! [`dispatch`] is the single entry point every one of the 256 assembly
//! stubs in [`crate::arch::x86::idt`] funnels into. It classifies the
//! vector (CPU exception, hardware IRQ, or the syscall gate), runs the
//! matching handler, sends end-of-interrupt to the PIC for hardware IRQs,
//! and otherwise panics on anything left unhandled - there is no graceful
//! degradation from an unexpected trap on this kernel.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86::idt::{InterruptFrame, IRQ_BASE, SYSCALL_VECTOR};
use crate::arch::x86::PICS;
use crate::mm::page_fault::{self, PageFaultInfo, PageFaultOutcome};

/// Exception vectors 0-31 that CPUs raise without any device involved.
const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point exception",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection exception",
    "VMM communication exception",
    "security exception",
    "reserved",
];

const PAGE_FAULT_VECTOR: u32 = 14;

/// Guards against a fault happening while `dispatch` is already servicing
/// one. The CPU has its own double-fault vector for the hardware version
/// of this; this flag catches the software case, where a bug in a handler
/// itself re-enters `dispatch` before the first call returns.
static IN_DISPATCH: AtomicBool = AtomicBool::new(false);

/// Clears the re-entrancy guard ahead of a context switch that leaves a
/// dispatch call frame parked partway through (the scheduler switching the
/// current task out from under a timer tick, or away from one being
/// killed). Without this, the parked frame's half-finished `dispatch` call
/// would leave the guard set, and the next task's first interrupt would
/// read it as a genuine re-entrant fault.
pub(crate) fn clear_dispatch_guard() {
    IN_DISPATCH.store(false, Ordering::Release);
}

type IrqHandler = fn(&InterruptFrame);

/// One slot per hardware IRQ line (0-15, after the PIC remap maps them to
/// vectors 32-47). `None` means "no driver registered"; an unexpected IRQ
/// on such a line is logged and EOI'd, not treated as fatal - spurious
/// IRQs happen on real hardware.
static mut IRQ_HANDLERS: [Option<IrqHandler>; 16] = [None; 16];

/// Registers `handler` to run whenever hardware IRQ line `line` (0-15)
/// fires. Replaces any previously registered handler for that line.
///
/// # Safety
/// Must only be called during single-threaded driver initialization,
/// before interrupts are enabled.
pub unsafe fn register_irq(line: u8, handler: IrqHandler) {
    assert!(line < 16, "irq: line {line} out of range");
    // SAFETY: caller's contract guarantees no concurrent access.
    unsafe {
        IRQ_HANDLERS[line as usize] = Some(handler);
    }
}

/// The common interrupt entry point, called by every vector's assembly
/// stub with a pointer to the frame it just built on the interrupted
/// task's kernel stack.
///
/// # Safety
/// Must only be called by the assembly stubs in `arch::x86::idt`, with a
/// `frame` pointing at a validly constructed `InterruptFrame` on the
/// current stack.
#[no_mangle]
pub extern "C" fn dispatch(frame: *mut InterruptFrame) {
    // SAFETY: frame was just constructed by the calling assembly stub and
    // is live for the duration of this call.
    let frame = unsafe { &mut *frame };

    if IN_DISPATCH.swap(true, Ordering::Acquire) {
        panic!("irq: re-entrant dispatch while servicing vector {}", frame.vector);
    }

    match frame.vector {
        v if v == PAGE_FAULT_VECTOR => handle_page_fault(frame),
        v if v == SYSCALL_VECTOR as u32 => crate::syscall::dispatch(frame),
        0..=31 => handle_exception(frame),
        v if (IRQ_BASE as u32..IRQ_BASE as u32 + 16).contains(&v) => {
            let line = (v - IRQ_BASE as u32) as u8;
            handle_irq(line, frame);
        }
        v => {
            crate::println!("irq: ignoring unexpected vector {v}");
        }
    }

    IN_DISPATCH.store(false, Ordering::Release);
}

fn handle_exception(frame: &InterruptFrame) {
    let name = EXCEPTION_NAMES[frame.vector as usize];
    panic!(
        "unhandled CPU exception {} ({name}) at eip {:#x}, error code {:#x}",
        frame.vector, frame.eip, frame.error_code
    );
}

fn handle_page_fault(frame: &InterruptFrame) {
    let cr2 = read_cr2();
    let info = PageFaultInfo::from_error_code(frame.error_code, cr2, frame.eip);

    let outcome = match crate::sched::current_vas() {
        Some(vas) => page_fault::handle(vas, info),
        None => crate::mm::vas::with_kernel_vas(|vas| page_fault::handle(vas, info)),
    };

    match outcome {
        Ok(PageFaultOutcome::Resolved) => {}
        Ok(PageFaultOutcome::KillTask) => crate::sched::kill_current(1),
        Err(e) => panic!("page fault handling failed: {e}"),
    }
}

fn handle_irq(line: u8, frame: &InterruptFrame) {
    if line == 0 {
        crate::arch::x86::timer::tick();
    }

    // SAFETY: IRQ_HANDLERS is only written during single-threaded driver
    // init, before interrupts are enabled; this read happens with
    // interrupts active but the table itself is immutable by that point.
    let handler = unsafe { IRQ_HANDLERS[line as usize] };
    if let Some(handler) = handler {
        handler(frame);
    }

    // SAFETY: PICS is the one global chained-PIC instance, and EOI is
    // always safe to send for an IRQ that line just raised.
    unsafe {
        PICS.lock().notify_end_of_interrupt(IRQ_BASE + line);
    }
}

fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {0}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}
