//! 32-bit task context switching.
//!
//! Every task switch happens inside the timer interrupt handler (or a
//! voluntary yield), which has already pushed the interrupted task's full
//! register state onto its kernel stack via the common ISR stub
//! ([`crate::arch::x86::idt`]). The only state a switch needs to save and
//! restore across tasks, then, is the callee-saved registers plus the
//! kernel stack pointer itself: everything else is already on the stack or
//! gets reloaded from it on the way back out through `iretd`.

use core::arch::global_asm;

/// Saved callee-saved registers and stack pointer for one task. `esp` points
/// into the task's kernel stack at the point [`switch_to`] suspended it;
/// resuming the task is simply a matter of restoring these registers and
/// returning, which unwinds back into whatever called `switch_to` the first
/// time (the ISR common stub, or [`bootstrap_stack`]'s trampoline for a
/// brand new task).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
}

global_asm!(
    r#"
.section .text
.global switch_to
switch_to:
    mov eax, [esp + 4]
    mov edx, [esp + 8]
    mov [eax + 0], ebx
    mov [eax + 4], esi
    mov [eax + 8], edi
    mov [eax + 12], ebp
    mov [eax + 16], esp
    mov ebx, [edx + 0]
    mov esi, [edx + 4]
    mov edi, [edx + 8]
    mov ebp, [edx + 12]
    mov esp, [edx + 16]
    ret
"#
);

extern "C" {
    /// Switches the CPU from the task described by `from` to `to`: saves
    /// the current callee-saved registers and stack pointer into `*from`,
    /// loads `to`'s, and returns into whatever address is on top of its
    /// stack.
    ///
    /// # Safety
    /// `from` must point at a valid, writable `Context` belonging to the
    /// task currently running on this stack. `to.esp` must point into a
    /// stack previously saved by a prior `switch_to` call or prepared by
    /// [`bootstrap_stack`]; an arbitrary stack pointer here corrupts
    /// control flow on the next return.
    pub fn switch_to(from: *mut Context, to: *const Context);
}

/// Prepares a brand new task's kernel stack so that the first [`switch_to`]
/// into it lands at `entry`. `stack_top` must be the highest address of the
/// task's allocated kernel stack (stacks grow down).
///
/// Returns the `Context` to install as the task's saved state.
///
/// # Safety
/// `stack_top` must be 4-byte aligned and the word below it must belong to
/// a stack the task owns exclusively and that stays mapped until the task
/// exits.
pub unsafe fn bootstrap_stack(stack_top: usize, entry: extern "C" fn() -> !) -> Context {
    // The trampoline above is entered via `ret` from `switch_to`, so the
    // first word on the new stack must be the address to jump to.
    let mut sp = stack_top & !0xF;
    sp -= core::mem::size_of::<usize>();
    // SAFETY: sp is within the caller-owned stack region per this
    // function's safety contract.
    unsafe {
        core::ptr::write(sp as *mut usize, entry as usize);
    }

    Context {
        ebx: 0,
        esi: 0,
        edi: 0,
        ebp: 0,
        esp: sp as u32,
    }
}
