//! Memory management: physical frames, paging, per-context virtual address
//! spaces, and the kernel heap.
//!
//! Bring-up order, called once from [`crate::kernel_entry`]: the frame
//! allocator is seeded from the multiboot memory map, the kernel image is
//! reserved, a boot identity map is built and paging is switched on, then
//! the heap is carved out of the largest remaining free region.

#![allow(dead_code)]

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vas;

pub use frame_allocator::{FrameAllocatorError, FrameNumber, FRAME_ALLOCATOR, FRAME_SIZE};

use crate::arch::x86::multiboot::BootInfo;

pub const PAGE_SIZE: usize = FRAME_SIZE;

/// A physical memory address. The target is 32-bit, so this is a thin
/// newtype over `usize` rather than a wider integer - there is no PAE here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    pub const fn as_usize(self) -> usize {
        self.0
    }
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE)
    }
}

/// A virtual address within some context's 4 GiB address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    pub const fn as_usize(self) -> usize {
        self.0
    }
    pub const fn page_index(self) -> usize {
        self.0 / PAGE_SIZE
    }
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
    pub fn add(self, n: usize) -> Self {
        Self(self.0 + n)
    }
}

bitflags::bitflags! {
    /// Mapping flags. The first three mirror the hardware PTE bits; the
    /// rest are software-only bits stashed in the PTE's OS-available bits
    /// (9-11 on x86).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT         = 1 << 0;
        const WRITABLE        = 1 << 1;
        const USER            = 1 << 2;
        const ZERO_ON_ALLOC   = 1 << 9;
        const FREE_ON_RELEASE = 1 << 10;
        const MAPPED_EXTERNAL = 1 << 11;
    }
}

/// Total physical memory reported by the loader, in bytes. Read by the
/// `/sys/memfree` synthetic file and by OOM bookkeeping.
static TOTAL_MEMORY_BYTES: core::sync::atomic::AtomicUsize =
    core::sync::atomic::AtomicUsize::new(0);

pub fn total_memory_bytes() -> usize {
    TOTAL_MEMORY_BYTES.load(core::sync::atomic::Ordering::Relaxed)
}

pub fn free_memory_bytes() -> usize {
    FRAME_ALLOCATOR.free_frames() * FRAME_SIZE
}

/// Physical address of the end of the kernel image, from the linker script.
extern "C" {
    static __kernel_end: u8;
}

/// Brings up physical memory, paging, the virtual allocator for the kernel
/// context, and the kernel heap, in that order. Must run once, with
/// interrupts disabled, after the architecture layer (GDT/IDT/PIC) and
/// before anything that allocates.
///
/// `reserve_extra` additionally reserves a `[start, end)` physical byte
/// range, covering a boot module (the `init` binary) the loader placed
/// somewhere in available RAM, the same way the kernel image itself is
/// reserved below - without this the frame allocator could hand those
/// frames to the heap or a page table before anyone reads the module.
///
/// # Safety
/// `boot_info` must come from a successful `multiboot::parse` call for the
/// handoff that is currently running; this function installs a fresh page
/// directory and switches CR3, so it must not be called more than once.
pub unsafe fn init(boot_info: &BootInfo, reserve_extra: Option<(usize, usize)>) {
    let total_bytes = (boot_info.mem_lower_kib as u64 + boot_info.mem_upper_kib as u64) * 1024;
    TOTAL_MEMORY_BYTES.store(total_bytes as usize, core::sync::atomic::Ordering::Relaxed);

    FRAME_ALLOCATOR.init(total_bytes, |mark_free| {
        // SAFETY: boot_info came from a successful multiboot::parse call,
        // per this function's contract.
        unsafe {
            crate::arch::x86::multiboot::for_each_memory_range(boot_info, |range| {
                if range.available {
                    mark_free(range.base, range.length);
                }
            });
        }
    });

    // Reserve the kernel image itself: the loader placed it at 1 MiB and
    // the memory map has no idea where our sections end.
    let kernel_end = &raw const __kernel_end as usize;
    let reserved_frames = kernel_end.div_ceil(FRAME_SIZE);
    if reserved_frames > 0 {
        let _ = FRAME_ALLOCATOR.alloc_at(FrameNumber::new(0), reserved_frames);
    }

    if let Some((start, end)) = reserve_extra {
        let base = FrameNumber::new(start / FRAME_SIZE);
        let frames = (end.div_ceil(FRAME_SIZE)).saturating_sub(start / FRAME_SIZE);
        if frames > 0 {
            let _ = FRAME_ALLOCATOR.alloc_at(base, frames);
        }
    }

    // SAFETY: runs once during the single-threaded boot path, before any
    // other code walks or switches page tables.
    unsafe {
        page_table::init_boot_identity_map();
    }
    vas::init_kernel_context();
    heap::init();

    let (total, free) = heap::stats();
    println!("[mm] heap ready: {} KiB total, {} KiB free", total / 1024, free / 1024);
}
