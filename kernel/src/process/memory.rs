//! `brk()`/`sbrk()`: grows or shrinks a task's heap, a single
//! contiguous region starting at [`HEAP_BASE`] and tracked by
//! [`crate::sched::Task`]'s `program_break`. Backed the same way
//! `process::loader` backs the user stack - demand-zero pages reserved
//! eagerly, not lazily, since a task that just grew its break expects the
//! memory to be there on the next instruction, not on the next fault.

use crate::error::{KernelError, KernelResult};
use crate::mm::vas::Vas;
use crate::mm::{PageFlags, VirtualAddress, PAGE_SIZE};

/// Base of every task's heap. Chosen well clear of typical ELF load
/// addresses (around `0x0804_8000`) and the user stack (`0xC000_0000`
/// downward), so `brk` never has to negotiate with either.
pub const HEAP_BASE: usize = 0x4000_0000;

const HEAP_FLAGS: PageFlags =
    PageFlags::from_bits_truncate(PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits() | PageFlags::USER.bits() | PageFlags::ZERO_ON_ALLOC.bits() | PageFlags::FREE_ON_RELEASE.bits());

/// Returns the effective current break for a task that reports `raw` from
/// its `program_break` field - `0` is the sentinel [`crate::sched::Task`]
/// starts every task at, meaning "heap not touched yet", so it maps to
/// [`HEAP_BASE`] rather than a literal null break.
pub fn current_break(raw: usize) -> usize {
    if raw == 0 { HEAP_BASE } else { raw }
}

/// Sets the task's program break to `new_break`, backing any newly covered
/// pages, and returns the resulting break.
///
/// Shrinking the break only moves the logical boundary back; the pages
/// above it stay mapped until the task exits. Each grown region is its own
/// `Vas` range (this kernel's range tracking only releases a whole range
/// at its original start), so there is no sub-range split to release
/// against on shrink, and a teaching kernel has no second process waiting
/// on those frames back.
pub fn set_break(vas: &Vas, current_break: usize, new_break: usize) -> KernelResult<usize> {
    if new_break < HEAP_BASE {
        return Err(KernelError::InvalidArgument { name: "new_break", value: "below heap base" });
    }
    if new_break <= current_break {
        return Ok(new_break);
    }

    let old_pages = pages_for(current_break);
    let new_pages = pages_for(new_break);
    if new_pages > old_pages {
        let grow = new_pages - old_pages;
        let at = VirtualAddress::new(HEAP_BASE + old_pages * PAGE_SIZE);
        vas.reserve(grow, Some(at), None, HEAP_FLAGS)?;
    }

    Ok(new_break)
}

fn pages_for(break_addr: usize) -> usize {
    if break_addr <= HEAP_BASE {
        0
    } else {
        (break_addr - HEAP_BASE).div_ceil(PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::FRAME_ALLOCATOR;

    fn seeded_allocator() {
        FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    #[test_case]
    fn a_raw_zero_break_maps_to_the_heap_base() {
        assert_eq!(current_break(0), HEAP_BASE);
        assert_eq!(current_break(HEAP_BASE + 4096), HEAP_BASE + 4096);
    }

    #[test_case]
    fn shrinking_the_break_just_moves_the_boundary_back() {
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        let grown = set_break(&vas, HEAP_BASE, HEAP_BASE + 3 * PAGE_SIZE).expect("growing the break should succeed");
        let shrunk = set_break(&vas, grown, HEAP_BASE + PAGE_SIZE).expect("shrinking the break should succeed");
        assert_eq!(shrunk, HEAP_BASE + PAGE_SIZE);
    }

    #[test_case]
    fn a_break_below_the_heap_base_is_rejected() {
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        assert!(matches!(
            set_break(&vas, HEAP_BASE, HEAP_BASE - PAGE_SIZE),
            Err(KernelError::InvalidArgument { name: "new_break", .. })
        ));
    }

    #[test_case]
    fn growing_the_break_backs_the_newly_covered_pages() {
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        set_break(&vas, HEAP_BASE, HEAP_BASE + PAGE_SIZE).expect("growing the break should succeed");
        assert!(vas.translate(VirtualAddress::new(HEAP_BASE)).is_some());
    }
}
