//! Per-context virtual address space tracking.
//!
//! Each context (the kernel, or a user task) owns a [`Vas`]: a page
//! directory plus a list of the virtual ranges currently carved out of it.
//! The range list is a fixed-capacity array rather than a `Vec` so that the
//! kernel's own context can be bootstrapped before the heap exists; user
//! contexts created later use the same structure, just with more headroom
//! than they'll ever need for a single task's mappings.

#![allow(clippy::manual_div_ceil)]

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use super::{page_table::PageDirectory, PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::error::KernelError;
use crate::sync::GlobalState;

/// Ranges per context. A task's address space is code+data+heap+stack+a
/// handful of mmaps; well short of this even for a pathological workload.
const MAX_RANGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub pages: usize,
    pub flags: PageFlags,
}

impl VirtualRange {
    pub fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_usize() + self.pages * FRAME_SIZE)
    }
}

/// Fixed-capacity, address-sorted list of the ranges currently reserved in
/// a context. Allocation is first-fit over the gaps between entries.
struct RangeList {
    entries: [Option<VirtualRange>; MAX_RANGES],
    len: usize,
}

impl RangeList {
    const fn new() -> Self {
        Self { entries: [None; MAX_RANGES], len: 0 }
    }

    fn iter(&self) -> impl Iterator<Item = &VirtualRange> {
        self.entries[..self.len].iter().filter_map(|e| e.as_ref())
    }

    fn insert_sorted(&mut self, range: VirtualRange) -> Result<(), KernelError> {
        if self.len >= MAX_RANGES {
            return Err(KernelError::ResourceExhausted { resource: "vas range table" });
        }
        let pos = self.iter().position(|r| r.start.as_usize() > range.start.as_usize()).unwrap_or(self.len);
        for i in (pos..self.len).rev() {
            self.entries[i + 1] = self.entries[i];
        }
        self.entries[pos] = Some(range);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, start: VirtualAddress) -> Option<VirtualRange> {
        let pos = self.iter().position(|r| r.start == start)?;
        let removed = self.entries[pos].take();
        for i in pos..self.len - 1 {
            self.entries[i] = self.entries[i + 1];
        }
        self.entries[self.len - 1] = None;
        self.len -= 1;
        removed
    }

    /// First gap of at least `pages` pages, searching from address
    /// `min_addr` upward and never crossing `limit`.
    fn find_gap(&self, pages: usize, min_addr: usize, limit: usize) -> Option<VirtualAddress> {
        let needed = pages * FRAME_SIZE;
        let mut cursor = min_addr;
        for range in self.iter() {
            let start = range.start.as_usize();
            if start >= cursor && start - cursor >= needed {
                return Some(VirtualAddress::new(cursor));
            }
            cursor = cursor.max(range.end().as_usize());
        }
        if limit.checked_sub(cursor)? >= needed {
            Some(VirtualAddress::new(cursor))
        } else {
            None
        }
    }

    fn overlaps(&self, start: VirtualAddress, pages: usize) -> bool {
        let end = start.as_usize() + pages * FRAME_SIZE;
        self.iter()
            .any(|r| start.as_usize() < r.end().as_usize() && end > r.start.as_usize())
    }

    fn containing(&self, addr: VirtualAddress) -> Option<VirtualRange> {
        self.iter()
            .find(|r| addr.as_usize() >= r.start.as_usize() && addr.as_usize() < r.end().as_usize())
            .copied()
    }
}

static NEXT_VAS_ID: AtomicU64 = AtomicU64::new(1);

/// One context's address space: its page directory and the bookkeeping of
/// which virtual ranges are currently live in it.
pub struct Vas {
    id: u64,
    directory: Mutex<PageDirectory>,
    ranges: Mutex<RangeList>,
    /// Lower bound for user-space allocations; below it is reserved for the
    /// identity-mapped kernel image and is never handed out by `reserve`.
    user_floor: usize,
}

/// Top of the 32-bit address space; `reserve` never hands out a range that
/// would cross it (the last page-aligned address below the 4 GiB wrap).
const ADDRESS_SPACE_TOP: usize = u32::MAX as usize - FRAME_SIZE + 1;

impl Vas {
    fn new(directory: PageDirectory, user_floor: usize) -> Self {
        Self {
            id: NEXT_VAS_ID.fetch_add(1, Ordering::Relaxed),
            directory: Mutex::new(directory),
            ranges: Mutex::new(RangeList::new()),
            user_floor,
        }
    }

    /// Marks `[0, floor)` as already reserved without installing any
    /// mappings for it (the caller, e.g. the kernel identity map, already
    /// did that through the page tables directly).
    fn reserve_existing(&self, floor: usize, flags: PageFlags) {
        if floor == 0 {
            return;
        }
        let mut ranges = self.ranges.lock();
        let _ = ranges.insert_sorted(VirtualRange {
            start: VirtualAddress::new(0),
            pages: floor / FRAME_SIZE,
            flags,
        });
    }

    /// Finds a free range of `pages` pages, maps it to `request_phys` (or
    /// fresh frames if `None`), and records it. If `request_virt` is given
    /// the range must start there exactly or the call fails.
    pub fn reserve(
        &self,
        pages: usize,
        request_virt: Option<VirtualAddress>,
        request_phys: Option<PhysicalAddress>,
        flags: PageFlags,
    ) -> Result<VirtualRange, KernelError> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument { name: "pages", value: "zero" });
        }

        let mut ranges = self.ranges.lock();
        let start = match request_virt {
            Some(v) => {
                if ranges.overlaps(v, pages) {
                    return Err(KernelError::AlreadyExists { resource: "vas range", id: v.as_usize() as u64 });
                }
                v
            }
            None => ranges
                .find_gap(pages, self.user_floor, ADDRESS_SPACE_TOP)
                .ok_or(KernelError::OutOfMemory { requested: pages * FRAME_SIZE, available: 0 })?,
        };

        let range = VirtualRange { start, pages, flags };

        let mut dir = self.directory.lock();
        match request_phys {
            Some(phys) => dir.map(start, phys, pages * FRAME_SIZE, flags)?,
            None => {
                for i in 0..pages {
                    let frame = super::FRAME_ALLOCATOR
                        .alloc(1)
                        .map_err(|_| KernelError::OutOfMemory { requested: FRAME_SIZE, available: 0 })?;
                    let v = VirtualAddress::new(start.as_usize() + i * FRAME_SIZE);
                    if flags.contains(PageFlags::ZERO_ON_ALLOC) {
                        // SAFETY: frame was just allocated and is identity-mapped;
                        // nothing else references it yet.
                        unsafe {
                            core::ptr::write_bytes(frame.as_addr() as *mut u8, 0, FRAME_SIZE);
                        }
                    }
                    dir.map(v, PhysicalAddress::new(frame.as_addr()), FRAME_SIZE, flags)?;
                }
            }
        }
        drop(dir);

        ranges.insert_sorted(range)?;
        Ok(range)
    }

    /// Records a range as reserved without installing any page-table
    /// entries for it. Every page is serviced the first time it faults, via
    /// [`super::page_fault::handle`] calling back into
    /// [`map_demand_zero_frame`]. `flags` must include `ZERO_ON_ALLOC` or
    /// the range can never be backed.
    pub fn reserve_lazy(
        &self,
        pages: usize,
        request_virt: Option<VirtualAddress>,
        flags: PageFlags,
    ) -> Result<VirtualRange, KernelError> {
        debug_assert!(flags.contains(PageFlags::ZERO_ON_ALLOC));
        let mut ranges = self.ranges.lock();
        let start = match request_virt {
            Some(v) => {
                if ranges.overlaps(v, pages) {
                    return Err(KernelError::AlreadyExists { resource: "vas range", id: v.as_usize() as u64 });
                }
                v
            }
            None => ranges
                .find_gap(pages, self.user_floor, ADDRESS_SPACE_TOP)
                .ok_or(KernelError::OutOfMemory { requested: pages * FRAME_SIZE, available: 0 })?,
        };
        let range = VirtualRange { start, pages, flags };
        ranges.insert_sorted(range)?;
        Ok(range)
    }

    /// Returns the flags recorded for whichever range contains `virt`, if
    /// any - regardless of whether that page has actually been backed by a
    /// frame yet. Used by the page-fault handler to tell a legitimate
    /// not-yet-touched demand-zero page apart from a genuinely bad access.
    pub fn flags_at(&self, virt: VirtualAddress) -> Option<PageFlags> {
        self.ranges.lock().containing(virt).map(|r| r.flags)
    }

    /// Installs a single page mapping for a range previously reserved via
    /// [`reserve_lazy`], backing it with `phys`. Called once, from the
    /// page-fault handler, the first time the page is touched.
    pub fn map_demand_zero_frame(
        &self,
        page: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        self.directory.lock().map(page, phys, FRAME_SIZE, flags)
    }

    /// Releases a range previously returned by `reserve`. Unmaps it, and if
    /// it carries `FREE_ON_RELEASE` also returns its frames to the
    /// allocator.
    pub fn release(&self, start: VirtualAddress) -> Result<(), KernelError> {
        let mut ranges = self.ranges.lock();
        let range = ranges
            .remove(start)
            .ok_or(KernelError::NotFound { resource: "vas range", id: start.as_usize() as u64 })?;
        drop(ranges);

        let mut dir = self.directory.lock();
        if range.flags.contains(PageFlags::FREE_ON_RELEASE) {
            for i in 0..range.pages {
                let v = VirtualAddress::new(range.start.as_usize() + i * FRAME_SIZE);
                if let Some(phys) = dir.translate(v) {
                    let _ = super::FRAME_ALLOCATOR.free(
                        super::FrameNumber::new(phys.as_usize() / FRAME_SIZE),
                        1,
                    );
                }
            }
        }
        dir.unmap(range.start, range.pages * FRAME_SIZE)
    }

    /// Releases every range starting at or above `floor`. Used by `execve`
    /// to tear down a task's old user-space mappings before loading a new
    /// image into the same address space and page directory - this kernel
    /// reuses the calling task's `Vas` across `exec` rather than building
    /// a fresh one, since nothing else holds a mutable reference to swap
    /// it out with.
    pub fn release_above(&self, floor: usize) -> Result<(), KernelError> {
        let starts: Vec<VirtualAddress> = {
            let ranges = self.ranges.lock();
            ranges.iter().map(|r| r.start).filter(|s| s.as_usize() >= floor).collect()
        };
        for start in starts {
            self.release(start)?;
        }
        Ok(())
    }

    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.directory.lock().translate(virt)
    }

    pub fn directory_phys(&self) -> PhysicalAddress {
        self.directory.lock().phys()
    }

    pub fn switch_to(&self) {
        self.directory.lock().switch_to();
    }

    /// Deep-copies every mapped page into a brand new address space, used
    /// by `fork`. Per the eager-copy design there is no page sharing or
    /// reference counting to set up afterward.
    pub fn deep_clone(&self) -> Result<Self, KernelError> {
        let dir = self.directory.lock();
        let new_dir = dir.deep_clone()?;
        drop(dir);

        let new_vas = Vas::new(new_dir, self.user_floor);
        let ranges = self.ranges.lock();
        let mut new_ranges = new_vas.ranges.lock();
        for range in ranges.iter() {
            new_ranges.insert_sorted(*range)?;
        }
        drop(new_ranges);
        drop(ranges);
        Ok(new_vas)
    }
}

/// Copies `size` bytes of mapped pages from `src` at `src_addr` into a
/// fresh range in `dst`, returning the destination address the copy now
/// lives at. `src_addr` need not be page-aligned: enough destination pages
/// are allocated to cover the spill into a trailing page, and the returned
/// address preserves `src_addr`'s intra-page offset so the caller can use
/// it exactly like `src_addr` without re-deriving the offset. Used to hand
/// arguments/environment from a parent's address space into a child's
/// during `execve`, and for other cross-context copies.
///
/// Locks both VASes' directories; to avoid an AB/BA deadlock against a
/// concurrent copy running in the opposite direction, the lower `id` is
/// always locked first.
pub fn map_across(
    dst: &Vas,
    src: &Vas,
    src_addr: VirtualAddress,
    size: usize,
    flags: PageFlags,
) -> Result<VirtualAddress, KernelError> {
    let offset = src_addr.page_offset();
    let pages = (offset + size).div_ceil(FRAME_SIZE);
    let src_base = src_addr.page_align_down();

    let (_first, _second) = if src.id < dst.id {
        (src.directory.lock(), dst.directory.lock())
    } else {
        (dst.directory.lock(), src.directory.lock())
    };

    // Re-borrow through the already-held locks rather than `reserve`
    // re-locking (which would deadlock against the guards above).
    let dst_range = dst
        .ranges
        .lock()
        .find_gap(pages, dst.user_floor, ADDRESS_SPACE_TOP)
        .ok_or(KernelError::OutOfMemory { requested: size, available: 0 })?;

    for i in 0..pages {
        let s = VirtualAddress::new(src_base.as_usize() + i * FRAME_SIZE);
        let phys = src
            .directory
            .lock()
            .translate(s)
            .ok_or(KernelError::UnmappedMemory { addr: s.as_usize() })?;
        let d = VirtualAddress::new(dst_range.as_usize() + i * FRAME_SIZE);
        dst.directory.lock().map(d, phys, FRAME_SIZE, flags)?;
    }

    dst.ranges.lock().insert_sorted(VirtualRange { start: dst_range, pages, flags })?;
    Ok(VirtualAddress::new(dst_range.as_usize() + offset))
}

static KERNEL_VAS: GlobalState<Vas> = GlobalState::new();

/// Builds the kernel's own [`Vas`] around the page directory installed by
/// [`super::page_table::init_boot_identity_map`], marking every byte of
/// physical memory the frame allocator knows about as already reserved.
/// Runs before the heap exists, hence the fixed-capacity range list rather
/// than one backed by `Vec`.
pub fn init_kernel_context() {
    let dir = PageDirectory::from_phys(super::page_table::kernel_directory_phys());
    let total = super::FRAME_ALLOCATOR.total_frames() * FRAME_SIZE;
    let vas = Vas::new(dir, total);
    vas.reserve_existing(total, PageFlags::PRESENT | PageFlags::WRITABLE);
    KERNEL_VAS
        .init(vas)
        .unwrap_or_else(|_| panic!("mm: kernel vas initialized twice"));
}

/// Runs `f` against the kernel's address space. Panics if called before
/// [`init_kernel_context`].
pub fn with_kernel_vas<R>(f: impl FnOnce(&Vas) -> R) -> R {
    KERNEL_VAS
        .with(f)
        .expect("mm: kernel vas accessed before init")
}

/// Creates a fresh address space for a new user task, with the standard
/// low-memory floor reserved for the kernel's identity map.
pub fn new_user_context() -> Result<Vas, KernelError> {
    let dir = PageDirectory::new()?;
    let total = super::FRAME_ALLOCATOR.total_frames() * FRAME_SIZE;
    let vas = Vas::new(dir, total);
    Ok(vas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_allocator() {
        super::super::FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    fn bare_context() -> Vas {
        let dir = PageDirectory::new().unwrap();
        Vas::new(dir, 0)
    }

    #[test_case]
    fn reserve_then_release_restores_the_gap() {
        seeded_allocator();
        let vas = bare_context();
        let range = vas.reserve(4, None, None, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        assert!(vas.translate(range.start).is_some());

        vas.release(range.start).unwrap();
        assert!(vas.translate(range.start).is_none());

        // The freed gap must be reusable by a subsequent reserve of the
        // same size at the same address.
        let again = vas
            .reserve(4, Some(range.start), None, PageFlags::PRESENT | PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(again.start, range.start);
    }

    #[test_case]
    fn overlapping_fixed_reserve_is_rejected() {
        seeded_allocator();
        let vas = bare_context();
        let range = vas.reserve(4, None, None, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let overlap_start = VirtualAddress::new(range.start.as_usize() + FRAME_SIZE);
        assert!(vas
            .reserve(4, Some(overlap_start), None, PageFlags::PRESENT | PageFlags::WRITABLE)
            .is_err());
    }

    #[test_case]
    fn map_across_copies_into_a_fresh_destination_range() {
        seeded_allocator();
        let src = bare_context();
        let dst = bare_context();

        let range = src.reserve(1, None, None, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let phys = src.translate(range.start).unwrap();
        // SAFETY: phys was just mapped by `reserve` above, identity-mapped.
        unsafe {
            core::ptr::write_bytes(phys.as_usize() as *mut u8, 0x5A, FRAME_SIZE);
        }

        let dst_addr = map_across(&dst, &src, range.start, FRAME_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let dst_phys = dst.translate(dst_addr).unwrap();
        // SAFETY: dst_phys was just mapped by map_across to the same
        // physical frame as the source range.
        assert_eq!(dst_phys, phys);
        let byte = unsafe { *(dst_phys.as_usize() as *const u8) };
        assert_eq!(byte, 0x5A);
    }

    #[test_case]
    fn map_across_handles_a_source_address_that_spills_into_a_second_page() {
        seeded_allocator();
        let src = bare_context();
        let dst = bare_context();

        // Two contiguous source pages, with data straddling the boundary.
        let range = src.reserve(2, None, None, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let page0 = src.translate(range.start).unwrap();
        let page1 = src.translate(VirtualAddress::new(range.start.as_usize() + FRAME_SIZE)).unwrap();
        let pattern: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let offset = FRAME_SIZE - 4;
        // SAFETY: page0/page1 were just mapped above; the pattern's first 4
        // bytes land in page0's last 4 bytes and the rest in page1's first
        // 6 bytes, both within their respective frames.
        unsafe {
            core::ptr::copy_nonoverlapping(pattern.as_ptr(), (page0.as_usize() + offset) as *mut u8, 4);
            core::ptr::copy_nonoverlapping(pattern[4..].as_ptr(), page1.as_usize() as *mut u8, 6);
        }

        let src_addr = VirtualAddress::new(range.start.as_usize() + offset);
        let dst_addr =
            map_across(&dst, &src, src_addr, pattern.len(), PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();

        // The intra-page offset must be preserved in the returned address.
        assert_eq!(dst_addr.page_offset(), offset);

        let dst_phys = dst.translate(dst_addr.page_align_down()).unwrap();
        // SAFETY: dst_phys backs the page map_across just mapped for this
        // copy, which holds at least `offset + pattern.len()` bytes given
        // two destination pages were allocated to cover the spill.
        let read_back = unsafe { core::slice::from_raw_parts((dst_phys.as_usize() + offset) as *const u8, 4) };
        assert_eq!(read_back, &pattern[..4]);

        let dst_phys1 = dst.translate(VirtualAddress::new(dst_addr.page_align_down().as_usize() + FRAME_SIZE)).unwrap();
        // SAFETY: same as above, second destination page.
        let read_back1 = unsafe { core::slice::from_raw_parts(dst_phys1.as_usize() as *const u8, 6) };
        assert_eq!(read_back1, &pattern[4..]);
    }

    #[test_case]
    fn deep_clone_is_independent_of_the_original() {
        seeded_allocator();
        let vas = bare_context();
        let range = vas.reserve(1, None, None, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let phys = vas.translate(range.start).unwrap();
        // SAFETY: phys is a freshly mapped, identity-mapped frame.
        unsafe {
            *(phys.as_usize() as *mut u8) = 1;
        }

        let clone = vas.deep_clone().unwrap();
        let clone_phys = clone.translate(range.start).unwrap();
        assert_ne!(clone_phys, phys);

        // SAFETY: phys is still mapped in the original vas.
        unsafe {
            *(phys.as_usize() as *mut u8) = 2;
        }
        // SAFETY: clone_phys belongs to the deep-cloned page, untouched by
        // the write above.
        let clone_byte = unsafe { *(clone_phys.as_usize() as *const u8) };
        assert_eq!(clone_byte, 1);
    }
}
