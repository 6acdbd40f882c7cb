//! Global Descriptor Table and 32-bit Task State Segment.
//!
//! Flat memory model: every segment spans the full 4 GiB linear address
//! space and differs only in descriptor-privilege level and
//! executable/writable bits. The TSS is not used for task switching (we
//! switch tasks entirely in software, per the scheduler); its only job is
//! to supply `esp0`/`ss0`, the ring-0 stack the CPU loads on a ring 3 -> 0
//! transition (interrupt or syscall trap).

use core::mem::size_of;

use lazy_static::lazy_static;

/// Selector layout:
/// - 0x00: null descriptor
/// - 0x08: kernel code (ring 0)
/// - 0x10: kernel data (ring 0)
/// - 0x18: user code (ring 3, selector 0x1B with RPL)
/// - 0x20: user data (ring 3, selector 0x23 with RPL)
/// - 0x28: TSS
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

const GDT_ENTRIES: usize = 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    /// Flat-model descriptor: base 0, limit covers all 4 GiB (limit field
    /// holds the top 20 bits, scaled by the 4 KiB granularity bit).
    const fn flat(access: u8, granularity: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            granularity: granularity | 0x0F,
            base_high: 0,
        }
    }

    fn tss(base: u32, limit: u32) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: 0x89, // present, ring 0, 32-bit TSS, busy=0
            granularity: (((limit >> 16) & 0x0F) as u8) | 0x00,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

// Access byte bits: present(0x80) | dpl<<5 | type(0x10) | exec | dc | rw | accessed
const ACC_KERNEL_CODE: u8 = 0x9A; // present, ring0, code, readable
const ACC_KERNEL_DATA: u8 = 0x92; // present, ring0, data, writable
const ACC_USER_CODE: u8 = 0xFA; // present, ring3, code, readable
const ACC_USER_DATA: u8 = 0xF2; // present, ring3, data, writable
const GRAN_32BIT: u8 = 0xC0; // 4 KiB granularity, 32-bit operand size

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// 32-bit Task State Segment. Only `esp0`/`ss0` are consulted by the CPU on
/// a privilege-level change through an interrupt gate; the rest exists
/// because the structure's layout is fixed by the architecture.
#[repr(C, packed)]
pub struct TaskStateSegment {
    link: u16,
    _r0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _r4: u16,
    cs: u16,
    _r5: u16,
    ss: u16,
    _r6: u16,
    ds: u16,
    _r7: u16,
    fs: u16,
    _r8: u16,
    gs: u16,
    _r9: u16,
    ldt: u16,
    _r10: u16,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            link: 0,
            _r0: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR,
            _r1: 0,
            esp1: 0,
            ss1: 0,
            _r2: 0,
            esp2: 0,
            ss2: 0,
            _r3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _r4: 0,
            cs: 0,
            _r5: 0,
            ss: 0,
            _r6: 0,
            ds: 0,
            _r7: 0,
            fs: 0,
            _r8: 0,
            gs: 0,
            _r9: 0,
            ldt: 0,
            _r10: 0,
            trap: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

static mut TSS: TaskStateSegment = TaskStateSegment::new();

lazy_static! {
    static ref GDT: [GdtEntry; GDT_ENTRIES] = {
        // SAFETY: taking the address of the static does not create a
        // reference; only used to compute the TSS descriptor's base field.
        let tss_addr = unsafe { core::ptr::addr_of!(TSS) } as u32;
        let mut table = [GdtEntry::null(); GDT_ENTRIES];
        table[0] = GdtEntry::null();
        table[1] = GdtEntry::flat(ACC_KERNEL_CODE, GRAN_32BIT);
        table[2] = GdtEntry::flat(ACC_KERNEL_DATA, GRAN_32BIT);
        table[3] = GdtEntry::flat(ACC_USER_CODE, GRAN_32BIT);
        table[4] = GdtEntry::flat(ACC_USER_DATA, GRAN_32BIT);
        table[5] = GdtEntry::tss(tss_addr, size_of::<TaskStateSegment>() as u32 - 1);
        table
    };
}

/// Loads the GDT, reloads every segment register, and loads the TSS
/// selector into TR.
///
/// # Safety
/// Must run once, early in boot, before any code relies on the new segment
/// layout (interrupt handling, ring transitions).
pub fn init() {
    let ptr = GdtPointer {
        limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
        base: GDT.as_ptr() as u32,
    };

    // SAFETY: `ptr` describes the static GDT table above, which outlives the
    // kernel. lgdt loads it; the far jump reloads CS via a retf-style return
    // address push; the data-segment moves reload DS/ES/FS/GS/SS to the new
    // flat kernel data descriptor; ltr loads TR with the TSS selector, which
    // the GDT entry we just installed describes.
    unsafe {
        core::arch::asm!("lgdt [{}]", in(reg) &ptr, options(readonly, nostack));
        core::arch::asm!(
            "push {sel}",
            "push offset 2f",
            "retf",
            "2:",
            sel = const KERNEL_CODE_SELECTOR as u32,
            options(nostack),
        );
        core::arch::asm!(
            "mov ax, {sel:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            sel = in(reg) KERNEL_DATA_SELECTOR,
            out("ax") _,
            options(nostack),
        );
        core::arch::asm!("ltr {sel:x}", sel = in(reg) TSS_SELECTOR, options(nostack));
    }
}

/// Sets the ring-0 stack pointer the CPU will load on the next privilege
/// transition into the kernel. Called by the scheduler on every context
/// switch so interrupts taken while the new task runs land on its stack.
///
/// # Safety
/// Must only be called with interrupts disabled: it is not safe for this
/// write to race a concurrent privilege-transition that reads `esp0`.
pub unsafe fn set_kernel_stack(esp0: u32) {
    // SAFETY: caller holds the single-CPU "interrupts disabled" invariant
    // documented above, so no other path observes TSS mid-write.
    unsafe {
        TSS.esp0 = esp0;
    }
}
