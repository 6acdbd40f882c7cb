//! Page fault handling.
//!
//! There is no copy-on-write in this kernel - `fork` copies every page
//! eagerly - so a fault here has exactly two legitimate causes: a page
//! carrying `ZERO_ON_ALLOC` that has never been touched (demand-zero), or a
//! genuine access violation. Everything else is fatal: a user task gets
//! killed, and a fault against a kernel address panics.

use crate::{
    error::KernelError,
    mm::{vas::Vas, PageFlags, VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE},
};

/// Decoded view of vector 14's hardware error code plus the faulting
/// address from CR2.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub address: VirtualAddress,
    pub present: bool,
    pub write: bool,
    pub user_mode: bool,
    pub instruction_pointer: u32,
}

impl PageFaultInfo {
    /// Builds a `PageFaultInfo` from the raw x86 page-fault error code (the
    /// value `idt`'s ISR 14 stub leaves in the interrupt frame) and CR2.
    pub fn from_error_code(error_code: u32, cr2: u32, eip: u32) -> Self {
        Self {
            address: VirtualAddress::new(cr2 as usize),
            present: error_code & 0x1 != 0,
            write: error_code & 0x2 != 0,
            user_mode: error_code & 0x4 != 0,
            instruction_pointer: eip,
        }
    }
}

/// Outcome of handling a fault, for the caller (the vector-14 IRQ handler)
/// to act on: either execution resumes where it faulted, or the faulting
/// task must be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultOutcome {
    Resolved,
    KillTask,
}

/// Services a page fault against `vas`, the faulting context's address
/// space. Returns `Ok(Resolved)` if the fault was a legitimate demand-zero
/// access and has been serviced; `Ok(KillTask)` if the access was simply
/// invalid and the calling task should be terminated; `Err` only for
/// faults against kernel memory, which the caller should treat as fatal.
pub fn handle(vas: &Vas, info: PageFaultInfo) -> Result<PageFaultOutcome, KernelError> {
    if info.present {
        // The page is mapped but the access still faulted: a protection
        // violation (write to read-only, user access to a kernel page).
        // With no CoW to reconcile, this is never legitimate.
        return Ok(fatal_or_kill(info));
    }

    let page = info.address.page_align_down();
    let flags = vas.flags_at(page);
    match flags {
        Some(f) if f.contains(PageFlags::ZERO_ON_ALLOC) => {
            demand_zero(vas, page, f)?;
            Ok(PageFaultOutcome::Resolved)
        }
        _ => Ok(fatal_or_kill(info)),
    }
}

fn fatal_or_kill(info: PageFaultInfo) -> PageFaultOutcome {
    if info.user_mode {
        PageFaultOutcome::KillTask
    } else {
        panic!(
            "kernel page fault at {:#x} (eip {:#x}, write={}, present={})",
            info.address.as_usize(),
            info.instruction_pointer,
            info.write,
            info.present
        );
    }
}

/// Backs a previously reserved-but-unmapped `ZERO_ON_ALLOC` page with a
/// freshly zeroed frame. The range itself was already recorded by
/// [`super::vas::Vas::reserve`] with a placeholder (unmapped) PTE; this
/// only runs the first time the page is actually touched.
fn demand_zero(vas: &Vas, page: VirtualAddress, flags: PageFlags) -> Result<(), KernelError> {
    let frame = FRAME_ALLOCATOR
        .alloc(1)
        .map_err(|_| KernelError::OutOfMemory { requested: FRAME_SIZE, available: 0 })?;
    // SAFETY: frame was just allocated and is identity-mapped; nothing
    // else can be observing it yet.
    unsafe {
        core::ptr::write_bytes(frame.as_addr() as *mut u8, 0, FRAME_SIZE);
    }
    vas.map_demand_zero_frame(page, super::PhysicalAddress::new(frame.as_addr()), flags)
}
