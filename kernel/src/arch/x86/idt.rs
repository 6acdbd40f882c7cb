//! 256-entry Interrupt Descriptor Table and the common interrupt entry path.
//!
//! Every vector gets a small assembly stub (generated once, at assemble
//! time, via a GAS `.rept` loop rather than 256 hand-written blocks) that
//! pushes a uniform register frame and falls into `isr_common_stub`, which
//! calls [`crate::irq::dispatch`] with a pointer to the frame. CPU
//! exceptions that push a hardware error code skip the dummy push; every
//! other vector gets a zero pushed in its place so the frame layout is
//! identical for all 256 entries.

use core::arch::global_asm;
use core::mem::size_of;

use crate::arch::x86::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

/// Vector of the user-mode syscall trap gate (DPL 3).
pub const SYSCALL_VECTOR: u8 = 0x80;
/// First hardware IRQ vector after the PIC remap.
pub const IRQ_BASE: u8 = crate::config::PIC_VECTOR_BASE;

/// Register frame pushed by the common stub, in push order (so the layout
/// here is the reverse of the assembly's push sequence read top-to-bottom).
/// `ds` is the segment the interrupted code was using, saved so the stub
/// can restore it after forcing `ds`/`es`/`fs`/`gs` to the kernel data
/// selector for the duration of `dispatch`; it is the last thing pushed
/// before the frame pointer itself, so it sits at the lowest address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

// Vectors that push a hardware error code: 8, 10-14, 17, 21, 29, 30.
global_asm!(
    r#"
.section .text
.altmacro

.macro isr_stub_err n
isr_stub_\n:
    push \n
    jmp isr_common_stub
.endm

.macro isr_stub_noerr n
isr_stub_\n:
    push 0
    push \n
    jmp isr_common_stub
.endm

.set i, 0
.rept 256
    .ifc \i,8
        isr_stub_err %i
    .else
        .if ((i==10)||(i==11)||(i==12)||(i==13)||(i==14)||(i==17)||(i==21)||(i==29)||(i==30))
            isr_stub_err %i
        .else
            isr_stub_noerr %i
        .endif
    .endif
    .set i, i+1
.endr

.section .rodata
.align 4
.global isr_stub_table
isr_stub_table:
.set i, 0
.rept 256
    .long isr_stub_%i
    .set i, i+1
.endr

.section .text
isr_common_stub:
    pusha
    mov ax, ds
    push eax
    mov ax, {kdata}
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call {dispatch}
    add esp, 4

    pop eax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    popa
    add esp, 8
    iretd
"#,
    kdata = const KERNEL_DATA_SELECTOR,
    dispatch = sym crate::irq::dispatch,
);

extern "C" {
    static isr_stub_table: [u32; 256];
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, dpl: u8) -> Self {
        // type_attr: present(0x80) | dpl<<5 | 0x0E (32-bit interrupt gate)
        let type_attr = 0x80 | ((dpl & 0x3) << 5) | 0x0E;
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

/// Builds all 256 IDT entries and loads the table.
///
/// # Safety
/// Must run once during boot, after the GDT has been loaded (entries
/// reference `KERNEL_CODE_SELECTOR`), before interrupts are enabled.
pub fn init() {
    // SAFETY: single-threaded boot code; IDT is only mutated here, and the
    // table is loaded only after this loop has finished writing every entry.
    unsafe {
        for vector in 0..256usize {
            let handler = isr_stub_table[vector];
            let dpl = if vector == SYSCALL_VECTOR as usize { 3 } else { 0 };
            IDT[vector] = IdtEntry::new(handler, dpl);
        }

        let ptr = IdtPointer {
            limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &ptr, options(readonly, nostack));
    }
}
