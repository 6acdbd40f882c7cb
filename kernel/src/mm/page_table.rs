//! Two-level x86 paging: page directory, page tables, and the mechanics of
//! installing, removing, and walking mappings.
//!
//! The kernel identity-maps the whole of reported physical memory at boot
//! (see [`init_boot_identity_map`]), so any frame the frame allocator hands
//! back is directly dereferenceable at its physical address for as long as
//! paging stays enabled - there is no separate physical-memory window or
//! recursive-mapping trick to thread through the rest of this module.

use core::ops::{Index, IndexMut};

use super::{FrameNumber, PageFlags, PhysicalAddress, VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE};
use crate::error::KernelError;

pub const ENTRIES_PER_TABLE: usize = 1024;
/// One page directory entry covers this many bytes of virtual space.
pub const PDE_SPAN: usize = ENTRIES_PER_TABLE * FRAME_SIZE;

/// Bits of a page-directory/page-table entry that [`PageFlags`] owns: the
/// three hardware bits (present/writable/user) plus the three
/// software-available bits (9-11).
const FLAGS_MASK: u32 = 0b0000_0111 | (0b0000_0111 << 9);

#[derive(Clone, Copy)]
#[repr(transparent)]
struct Entry(u32);

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    fn frame(self) -> Option<FrameNumber> {
        self.is_present()
            .then(|| FrameNumber::new((self.0 as usize & !0xFFF) / FRAME_SIZE))
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    fn set(&mut self, frame: FrameNumber, flags: PageFlags) {
        self.0 = (frame.as_addr() as u32 & !0xFFF) | (flags.bits() & FLAGS_MASK);
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A single 4 KiB, 1024-entry level of the hierarchy. Used for both the
/// page directory and every page table; on a non-PAE x86 target the two
/// have an identical binary shape.
#[repr(C, align(4096))]
struct Table {
    entries: [Entry; ENTRIES_PER_TABLE],
}

impl Table {
    fn zero(&mut self) {
        for e in &mut self.entries {
            e.clear();
        }
    }
}

impl Index<usize> for Table {
    type Output = Entry;
    fn index(&self, i: usize) -> &Entry {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Table {
    fn index_mut(&mut self, i: usize) -> &mut Entry {
        &mut self.entries[i]
    }
}

fn directory_index(virt: VirtualAddress) -> usize {
    virt.as_usize() >> 22
}

fn table_index(virt: VirtualAddress) -> usize {
    (virt.as_usize() >> 12) & 0x3FF
}

/// Every frame the allocator hands back sits inside the boot identity map,
/// so its physical address doubles as a valid kernel pointer.
unsafe fn table_at(phys: PhysicalAddress) -> &'static mut Table {
    // SAFETY: phys is the address of a frame owned by a page directory or
    // page table, which per this module's invariant always falls inside
    // the boot identity map.
    unsafe { &mut *(phys.as_usize() as *mut Table) }
}

fn alloc_zeroed_table() -> Result<PhysicalAddress, KernelError> {
    let frame = FRAME_ALLOCATOR
        .alloc(1)
        .map_err(|_| KernelError::OutOfMemory { requested: FRAME_SIZE, available: 0 })?;
    let phys = PhysicalAddress::new(frame.as_addr());
    // SAFETY: the frame was just allocated and is not yet referenced by
    // any page directory entry, so nothing else can observe the table
    // mid-zero.
    unsafe { table_at(phys).zero() };
    Ok(phys)
}

/// One address space's hardware page tables: a page directory plus
/// whatever page tables it currently references. This is the handle the
/// rest of the kernel calls "a context"'s paging half; [`super::vas`]
/// layers the virtual-range bookkeeping on top of it.
pub struct PageDirectory {
    phys: PhysicalAddress,
}

impl PageDirectory {
    /// Allocates a fresh, empty page directory.
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self { phys: alloc_zeroed_table()? })
    }

    /// Wraps an already-built page directory (used for the kernel context,
    /// whose directory is built by [`init_boot_identity_map`]).
    pub fn from_phys(phys: PhysicalAddress) -> Self {
        Self { phys }
    }

    pub fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    /// Installs mappings for `[virt, virt+length)`, rounding down to page
    /// granularity. Allocates page-directory entries (second-level tables)
    /// lazily as a given 4 MiB span is touched for the first time.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        length: usize,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        let start = virt.page_align_down().as_usize();
        let pages = length.div_ceil(FRAME_SIZE);
        // SAFETY: self.phys is a valid page directory frame, identity-mapped.
        let dir = unsafe { table_at(self.phys) };

        for i in 0..pages {
            let v = VirtualAddress::new(start + i * FRAME_SIZE);
            let p = PhysicalAddress::new(phys.as_usize() + i * FRAME_SIZE);
            let di = directory_index(v);

            if !dir[di].is_present() {
                let pt_phys = alloc_zeroed_table()?;
                dir[di].set(
                    FrameNumber::from_addr(pt_phys.as_usize()),
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                );
            }
            let pt_phys = PhysicalAddress::new(dir[di].frame().unwrap().as_addr());
            // SAFETY: pt_phys was just allocated or previously installed by
            // this same function, both identity-mapped.
            let pt = unsafe { table_at(pt_phys) };
            pt[table_index(v)].set(p.frame(), flags | PageFlags::PRESENT);
        }

        // SAFETY: caller is mapping into a context it has exclusive access
        // to; invalidating the range we just touched is always sound.
        unsafe { flush_range(start, pages) };
        Ok(())
    }

    /// Clears PTEs covering `[virt, virt+length)`. Does not reclaim the
    /// underlying frames; callers that own them (the virtual allocator's
    /// `free_on_release` ranges) do that separately.
    pub fn unmap(&mut self, virt: VirtualAddress, length: usize) -> Result<(), KernelError> {
        let start = virt.page_align_down().as_usize();
        let pages = length.div_ceil(FRAME_SIZE);
        // SAFETY: self.phys is a valid, identity-mapped page directory.
        let dir = unsafe { table_at(self.phys) };

        for i in 0..pages {
            let v = VirtualAddress::new(start + i * FRAME_SIZE);
            let di = directory_index(v);
            if !dir[di].is_present() {
                continue;
            }
            let pt_phys = PhysicalAddress::new(dir[di].frame().unwrap().as_addr());
            // SAFETY: identity-mapped page-table frame referenced by a
            // present directory entry.
            let pt = unsafe { table_at(pt_phys) };
            pt[table_index(v)].clear();
        }

        // SAFETY: same as `map` - the caller owns this context exclusively.
        unsafe { flush_range(start, pages) };
        Ok(())
    }

    /// Walks the tables and returns the physical address `virt` currently
    /// resolves to, if mapped.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        // SAFETY: self.phys is a valid, identity-mapped page directory.
        let dir = unsafe { table_at(self.phys) };
        let di = directory_index(virt);
        if !dir[di].is_present() {
            return None;
        }
        let pt_phys = PhysicalAddress::new(dir[di].frame()?.as_addr());
        // SAFETY: identity-mapped page-table frame referenced by a present
        // directory entry.
        let pt = unsafe { table_at(pt_phys) };
        let entry = pt[table_index(virt)];
        entry
            .frame()
            .map(|f| PhysicalAddress::new(f.as_addr() + virt.page_offset()))
    }

    /// Returns the flags installed for the page containing `virt`, if any.
    pub fn flags_at(&self, virt: VirtualAddress) -> Option<PageFlags> {
        // SAFETY: see `translate`.
        let dir = unsafe { table_at(self.phys) };
        let di = directory_index(virt);
        if !dir[di].is_present() {
            return None;
        }
        let pt_phys = PhysicalAddress::new(dir[di].frame()?.as_addr());
        // SAFETY: see `translate`.
        let pt = unsafe { table_at(pt_phys) };
        let entry = pt[table_index(virt)];
        entry.is_present().then(|| entry.flags())
    }

    /// Deep-copies every present mapping (and its backing frame, a fresh
    /// physical copy) into a brand new page directory. Used by `fork`,
    /// which duplicates memory eagerly rather than sharing pages
    /// copy-on-write.
    pub fn deep_clone(&self) -> Result<Self, KernelError> {
        let mut new_dir = PageDirectory::new()?;
        // SAFETY: self.phys is a valid, identity-mapped page directory.
        let src_dir = unsafe { table_at(self.phys) };

        for di in 0..ENTRIES_PER_TABLE {
            if !src_dir[di].is_present() {
                continue;
            }
            let src_pt_phys = PhysicalAddress::new(src_dir[di].frame().unwrap().as_addr());
            // SAFETY: identity-mapped page-table frame.
            let src_pt = unsafe { table_at(src_pt_phys) };

            for ti in 0..ENTRIES_PER_TABLE {
                let entry = src_pt[ti];
                if !entry.is_present() {
                    continue;
                }
                let src_frame = entry.frame().unwrap();
                let dst_frame = FRAME_ALLOCATOR
                    .alloc(1)
                    .map_err(|_| KernelError::OutOfMemory { requested: FRAME_SIZE, available: 0 })?;

                // SAFETY: both frames are identity-mapped physical memory;
                // they do not overlap since dst_frame was just allocated.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src_frame.as_addr() as *const u8,
                        dst_frame.as_addr() as *mut u8,
                        FRAME_SIZE,
                    );
                }

                let virt = VirtualAddress::new(di * PDE_SPAN + ti * FRAME_SIZE);
                new_dir.map(
                    virt,
                    PhysicalAddress::new(dst_frame.as_addr()),
                    FRAME_SIZE,
                    entry.flags(),
                )?;
            }
        }

        Ok(new_dir)
    }

    /// Loads this directory into CR3 if it is not already active, flushing
    /// the whole TLB in the process.
    pub fn switch_to(&self) {
        let current = read_cr3();
        if current != self.phys.as_usize() as u32 {
            write_cr3(self.phys.as_usize() as u32);
        }
    }
}

/// Invalidates the TLB entries for `pages` pages starting at `start`,
/// falling back to a full flush once the per-page cost would exceed it.
///
/// # Safety
/// The mappings being invalidated must already have been written to the
/// active or about-to-be-active page tables.
unsafe fn flush_range(start: usize, pages: usize) {
    if pages > 64 {
        // SAFETY: reloading CR3 with its own value only flushes the TLB.
        unsafe { crate::arch::x86::tlb_flush_all() };
        return;
    }
    for i in 0..pages {
        // SAFETY: invlpg only affects the TLB, never memory contents.
        unsafe { crate::arch::x86::tlb_flush_address(start + i * FRAME_SIZE) };
    }
}

fn read_cr3() -> u32 {
    let value: u32;
    // SAFETY: reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {0}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

fn write_cr3(value: u32) {
    // SAFETY: value is a physical address of a valid page directory,
    // guaranteed by every caller of `switch_to`.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) value, options(nostack, preserves_flags));
    }
}

/// Builds a page directory that identity-maps every frame the allocator
/// knows about (virtual address == physical address), then enables paging.
/// Run once, very early, while execution is still happening at addresses
/// that equal their own physical location - which the identity map then
/// preserves across the transition.
///
/// # Safety
/// Must run exactly once, with interrupts disabled, after the frame
/// allocator has been seeded and before any other code assumes paging is
/// either on or off.
pub unsafe fn init_boot_identity_map() {
    let mut dir = PageDirectory::new().expect("mm: failed to allocate boot page directory");
    let total_bytes = FRAME_ALLOCATOR.total_frames() * FRAME_SIZE;

    dir.map(
        VirtualAddress::new(0),
        PhysicalAddress::new(0),
        total_bytes,
        PageFlags::PRESENT | PageFlags::WRITABLE,
    )
    .expect("mm: failed to build boot identity map");

    dir.switch_to();
    enable_paging();

    KERNEL_DIRECTORY_PHYS.store(dir.phys.as_usize(), core::sync::atomic::Ordering::Release);
    core::mem::forget(dir);
}

static KERNEL_DIRECTORY_PHYS: core::sync::atomic::AtomicUsize =
    core::sync::atomic::AtomicUsize::new(0);

/// Physical address of the kernel's own page directory, installed by
/// [`init_boot_identity_map`]. Every user context's directory carries a
/// copy of the kernel's directory entries so kernel mappings stay valid
/// across a context switch.
pub fn kernel_directory_phys() -> PhysicalAddress {
    PhysicalAddress::new(KERNEL_DIRECTORY_PHYS.load(core::sync::atomic::Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_allocator() {
        // PageDirectory::new()/map() pull frames from the global allocator;
        // seed it fresh for each test the same way mm::frame_allocator's
        // own host-side tests do.
        FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    #[test_case]
    fn map_then_translate_is_the_identity_plus_offset() {
        seeded_allocator();
        let mut dir = PageDirectory::new().unwrap();
        let virt = VirtualAddress::new(0x0040_0000);
        let phys = PhysicalAddress::new(0x0010_0000);
        let len = 4 * FRAME_SIZE;
        dir.map(virt, phys, len, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();

        for k in [0usize, 1, FRAME_SIZE, FRAME_SIZE + 17, len - 1] {
            assert_eq!(
                dir.translate(VirtualAddress::new(virt.as_usize() + k)),
                Some(PhysicalAddress::new(phys.as_usize() + k))
            );
        }
    }

    #[test_case]
    fn unmap_clears_the_mapping() {
        seeded_allocator();
        let mut dir = PageDirectory::new().unwrap();
        let virt = VirtualAddress::new(0x0080_0000);
        let phys = PhysicalAddress::new(0x0020_0000);
        dir.map(virt, phys, FRAME_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        assert!(dir.translate(virt).is_some());

        dir.unmap(virt, FRAME_SIZE).unwrap();
        assert_eq!(dir.translate(virt), None);
    }

    #[test_case]
    fn deep_clone_copies_contents_independently() {
        seeded_allocator();
        let mut dir = PageDirectory::new().unwrap();
        let virt = VirtualAddress::new(0x0040_0000);
        let phys = PhysicalAddress::new(0x0030_0000);
        dir.map(virt, phys, FRAME_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();

        // SAFETY: phys was just mapped and sits in the boot identity range
        // this module assumes throughout.
        unsafe {
            *(phys.as_usize() as *mut u8) = 0xAB;
        }

        let cloned = dir.deep_clone().unwrap();
        let cloned_phys = cloned.translate(virt).unwrap();
        assert_ne!(cloned_phys.as_usize(), phys.as_usize());
        // SAFETY: cloned_phys was just deep-copied from phys, one page long.
        let copied_byte = unsafe { *(cloned_phys.as_usize() as *const u8) };
        assert_eq!(copied_byte, 0xAB);

        // Writes to the original must not be observed through the clone.
        // SAFETY: both addresses are distinct, page-aligned, live mappings.
        unsafe {
            *(phys.as_usize() as *mut u8) = 0xCD;
        }
        let still_old = unsafe { *(cloned_phys.as_usize() as *const u8) };
        assert_eq!(still_old, 0xAB);
    }
}

fn enable_paging() {
    // SAFETY: CR3 already holds a valid identity-mapped page directory
    // (set by the caller just before this), so setting CR0.PG does not
    // change which physical bytes the current EIP decodes to.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
}
