//! Ring 0 -> ring 3 transition.
//!
//! The only way into user mode is `iretd`: built with a fabricated interrupt
//! frame, it behaves exactly like returning from a hardware interrupt taken
//! in user mode, which is also how every subsequent re-entry into a task
//! happens (the scheduler never calls [`enter_usermode`] again after the
//! first transition; later switches go through [`crate::arch::x86::context`]
//! and the common ISR return path in `idt.rs`).

use core::arch::asm;

use crate::arch::x86::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::arch::x86::idt::InterruptFrame;

/// `eflags` with interrupts enabled (bit 9) and the mandatory reserved bit 1
/// set; everything else cleared.
const USER_EFLAGS: u32 = 0x202;

/// Transfers control to a freshly loaded user program. Never returns: the
/// task runs until it is preempted by a timer tick or it exits via a
/// syscall, both of which are serviced by the interrupt path, not by
/// returning from this function.
///
/// # Safety
/// - `entry` must be a user-mapped, executable address in the currently
///   loaded address-space context.
/// - `user_stack` must be a user-writable address within the same context,
///   with enough room below it for the initial `argc`/`argv`/`envp` layout
///   the ELF loader already wrote.
/// - The context's page directory must already be loaded into CR3.
/// - The TSS `esp0` field must already point at this task's kernel stack
///   (via [`crate::arch::x86::gdt::set_kernel_stack`]) so a subsequent
///   interrupt or syscall trap has a valid ring-0 stack to land on.
pub unsafe fn enter_usermode(entry: u32, user_stack: u32) -> ! {
    // SAFETY: builds the same frame layout the CPU pushes when it takes an
    // interrupt in user mode (SS, ESP, EFLAGS, CS, EIP, deepest to
    // shallowest), then executes `iretd` to pop it and jump to ring 3. The
    // data segment registers are reloaded to the user data selector first
    // so DS/ES/FS/GS are consistent with the ring we are entering.
    unsafe {
        asm!(
            "mov ax, {user_data:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push {user_data}",
            "push {stack}",
            "push {eflags}",
            "push {user_code}",
            "push {entry}",
            "iretd",
            user_data = in(reg) USER_DATA_SELECTOR as u32,
            stack = in(reg) user_stack,
            eflags = const USER_EFLAGS,
            user_code = in(reg) USER_CODE_SELECTOR as u32,
            entry = in(reg) entry,
            out("ax") _,
            options(noreturn),
        );
    }
}

/// Resumes a task from a previously captured [`InterruptFrame`], restoring
/// every general-purpose register the frame carries before the same
/// `iretd` transition [`enter_usermode`] uses. This is how a forked child
/// begins life: its frame is a copy of the parent's at the moment of the
/// `fork` syscall, with `eax` already patched to 0 by the caller, so the
/// child "returns" from the same trap the parent did, just with a
/// different return value.
///
/// `InterruptFrame`'s field order is exactly the layout
/// [`crate::arch::x86::idt`]'s `isr_common_stub` leaves on the stack before
/// its own `pop ds; popa; add esp,8; iretd` tail - so rather than shuffle
/// each field through a register, this just repoints `esp` at the frame
/// itself and runs that same tail.
///
/// # Safety
/// - `frame`'s `cs`/`user_ss` selectors must be the user code/data
///   selectors and `eip`/`user_esp` must be valid in the currently loaded
///   address space.
/// - The context's page directory must already be loaded into CR3 and the
///   TSS `esp0` field must already point at this task's kernel stack, same
///   preconditions as [`enter_usermode`].
/// - Nothing on the current kernel stack below `frame` is live, since this
///   never returns to it.
pub unsafe fn resume_from_frame(frame: &InterruptFrame) -> ! {
    // SAFETY: repoints esp at `frame`'s own memory (a boxed InterruptFrame
    // the caller owns, not the live kernel stack) and unwinds it exactly as
    // isr_common_stub's tail unwinds a real trap frame: restore ds/es/fs/gs
    // from the saved selector, popa for the eight GPRs, skip vector and
    // error_code, then iretd into user mode.
    unsafe {
        asm!(
            "mov esp, {frame_ptr}",
            "pop eax",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "popa",
            "add esp, 8",
            "iretd",
            frame_ptr = in(reg) frame as *const InterruptFrame as u32,
            out("ax") _,
            options(noreturn),
        );
    }
}
