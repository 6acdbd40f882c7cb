//! Kernel heap allocator.
//!
//! A boundary-tag free-list allocator: every block, free or allocated,
//! carries a header and a footer recording its size, so a free can look one
//! word behind its own header to find the previous block's footer and merge
//! with it in O(1) - the classic Knuth boundary-tag trick. Free blocks are
//! additionally threaded onto a doubly-linked list through their own usable
//! space (there is nothing else to store the links in); new free blocks go
//! on the head of that list, so a first-fit search is biased toward
//! recently freed memory rather than scanning from a fixed end every time.
//!
//! The heap starts from one arena carved out of physical memory at [`init`]
//! and can acquire more arenas later via [`grow`], each one entering the
//! free list as a single large block. Arenas need not be contiguous with
//! each other - the frame allocator makes no such promise - so growth never
//! tries to extend an existing block across an arena boundary.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::Mutex;

use super::{PhysicalAddress, FRAME_ALLOCATOR, FRAME_SIZE};
use crate::println;

// Initial arena size: INITIAL_HEAP_FRACTION of reported physical memory,
// capped so a small machine still boots.
use crate::config::{INITIAL_HEAP_FRACTION, INITIAL_HEAP_MAX_BYTES, INITIAL_HEAP_MIN_FRAMES};

/// Frames requested per [`grow`] call when the allocator runs dry.
const GROWTH_FRAMES: usize = 256;

#[cfg(feature = "integrity-checks")]
const MAGIC: u32 = 0xFEED_C0DE;

const FREE_BIT: usize = 1;

#[repr(C)]
struct Header {
    /// Usable size in bytes, with bit 0 set when the block is free.
    size_and_flag: usize,
    #[cfg(feature = "integrity-checks")]
    magic: u32,
}

#[repr(C)]
struct Footer {
    size_and_flag: usize,
    #[cfg(feature = "integrity-checks")]
    magic: u32,
}

/// Links threaded through a free block's usable space. Only valid while the
/// block is on the free list.
#[repr(C)]
struct FreeLinks {
    prev: *mut Header,
    next: *mut Header,
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const FOOTER_SIZE: usize = core::mem::size_of::<Footer>();
const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
const MIN_USABLE: usize = core::mem::size_of::<FreeLinks>();
/// A split is only worth doing if the remainder can hold a real block.
const MIN_SPLIT_USABLE: usize = MIN_USABLE + OVERHEAD;

impl Header {
    fn size(&self) -> usize {
        self.size_and_flag & !FREE_BIT
    }
    fn is_free(&self) -> bool {
        self.size_and_flag & FREE_BIT != 0
    }
    fn set(&mut self, size: usize, free: bool) {
        self.size_and_flag = size | (free as usize);
        #[cfg(feature = "integrity-checks")]
        {
            self.magic = MAGIC;
        }
    }
    #[cfg(feature = "integrity-checks")]
    fn check(&self) {
        assert_eq!(self.magic, MAGIC, "heap: corrupted block header");
    }
    #[cfg(not(feature = "integrity-checks"))]
    fn check(&self) {}
}

impl Footer {
    fn set(&mut self, size: usize, free: bool) {
        self.size_and_flag = size | (free as usize);
        #[cfg(feature = "integrity-checks")]
        {
            self.magic = MAGIC;
        }
    }
    fn size(&self) -> usize {
        self.size_and_flag & !FREE_BIT
    }
    fn is_free(&self) -> bool {
        self.size_and_flag & FREE_BIT != 0
    }
}

unsafe fn header_of(block: *mut Header) -> &'static mut Header {
    // SAFETY: caller holds a valid block pointer from the free list or an
    // allocation about to be freed.
    unsafe { &mut *block }
}

unsafe fn footer_of(header: *mut Header) -> *mut Footer {
    // SAFETY: every block's footer sits exactly `size` usable bytes after
    // its header, a layout this module establishes and never violates.
    unsafe {
        let usable = (*header).size();
        (header as *mut u8).add(HEADER_SIZE + usable) as *mut Footer
    }
}

unsafe fn usable_ptr(header: *mut Header) -> *mut u8 {
    // SAFETY: the usable region immediately follows the header.
    unsafe { (header as *mut u8).add(HEADER_SIZE) }
}

unsafe fn links_of(header: *mut Header) -> *mut FreeLinks {
    // SAFETY: a free block's usable area is at least `size_of::<FreeLinks>()`
    // bytes, enforced by `MIN_USABLE`.
    unsafe { usable_ptr(header) as *mut FreeLinks }
}

/// One contiguous region of memory donated to the heap, either at `init`
/// or by a later `grow`. Tracked only so `stats` can report a meaningful
/// total; the blocks inside are otherwise indistinguishable once merged
/// into the free list.
struct Arena {
    start: usize,
    len: usize,
}

struct HeapState {
    free_head: *mut Header,
    arenas: [Option<Arena>; 32],
    arena_count: usize,
    total_bytes: usize,
}

// SAFETY: HeapState is only ever touched through KernelHeap's Mutex.
unsafe impl Send for HeapState {}

impl HeapState {
    const fn empty() -> Self {
        Self { free_head: core::ptr::null_mut(), arenas: [const { None }; 32], arena_count: 0, total_bytes: 0 }
    }

    /// Wraps `[start, start+len)` as one large free block and pushes it
    /// onto the head of the free list.
    fn add_arena(&mut self, start: usize, len: usize) {
        assert!(len > OVERHEAD + MIN_USABLE, "heap: arena too small");
        let usable = len - OVERHEAD;
        let header = start as *mut Header;
        // SAFETY: start..start+len is freshly donated, unaliased memory.
        unsafe {
            (*header).set(usable, true);
            (*footer_of(header)).set(usable, true);
            self.push_free(header);
        }
        if self.arena_count < self.arenas.len() {
            self.arenas[self.arena_count] = Some(Arena { start, len });
            self.arena_count += 1;
        }
        self.total_bytes += len;
    }

    unsafe fn push_free(&mut self, header: *mut Header) {
        // SAFETY: header is a free block with room for FreeLinks.
        unsafe {
            let links = links_of(header);
            (*links).prev = core::ptr::null_mut();
            (*links).next = self.free_head;
            if !self.free_head.is_null() {
                (*links_of(self.free_head)).prev = header;
            }
        }
        self.free_head = header;
    }

    unsafe fn unlink_free(&mut self, header: *mut Header) {
        // SAFETY: header is currently on the free list.
        unsafe {
            let links = links_of(header);
            let prev = (*links).prev;
            let next = (*links).next;
            if !prev.is_null() {
                (*links_of(prev)).next = next;
            } else {
                self.free_head = next;
            }
            if !next.is_null() {
                (*links_of(next)).prev = prev;
            }
        }
    }

    /// First-fit scan from the most-recently-freed block onward.
    unsafe fn find_free(&self, usable: usize) -> Option<*mut Header> {
        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: cur is a live node on the free list.
            let h = unsafe { header_of(cur) };
            h.check();
            if h.size() >= usable {
                return Some(cur);
            }
            cur = unsafe { (*links_of(cur)).next };
        }
        None
    }

    /// Splits `header` (a free block of at least `usable + MIN_SPLIT_USABLE`
    /// bytes) so the front `usable` bytes become an allocated block and the
    /// remainder re-enters the free list in its place.
    unsafe fn split(&mut self, header: *mut Header, usable: usize) {
        // SAFETY: header is free and large enough to split, checked by caller.
        unsafe {
            let total_usable = (*header).size();
            let remainder_usable = total_usable - usable - OVERHEAD;

            (*header).set(usable, false);
            (*footer_of(header)).set(usable, false);

            let next_header = (footer_of(header) as *mut u8).add(FOOTER_SIZE) as *mut Header;
            (*next_header).set(remainder_usable, true);
            (*footer_of(next_header)).set(remainder_usable, true);

            self.unlink_free(header);
            self.push_free(next_header);
        }
    }

    unsafe fn alloc_block(&mut self, usable: usize) -> Option<*mut Header> {
        let usable = usable.max(MIN_USABLE);
        // SAFETY: find_free only reads the free list.
        let header = unsafe { self.find_free(usable) }?;
        // SAFETY: header came from find_free, a valid free block of
        // sufficient size.
        unsafe {
            let block_usable = (*header).size();
            if block_usable >= usable + MIN_SPLIT_USABLE {
                self.split(header, usable);
            } else {
                self.unlink_free(header);
                (*header).set(block_usable, false);
                (*footer_of(header)).set(block_usable, false);
            }
        }
        Some(header)
    }

    /// Allocates `usable` bytes starting at an address aligned to `align`,
    /// out of the single block at the head of the free list. Used only by
    /// [`alloc_page_aligned`], which always primes the head of the list
    /// with a dedicated, freshly grown arena immediately beforehand - the
    /// general free list is not guaranteed to contain a block whose
    /// interior can be carved to an arbitrary alignment, but a fresh arena
    /// (itself frame-aligned) always can with one page of headroom.
    ///
    /// Carves off the misaligned leading bytes as their own free block
    /// ("front-remainder carving") before splitting/allocating the rest
    /// normally.
    unsafe fn carve_aligned(&mut self, usable: usize, align: usize) -> Option<*mut Header> {
        let header = self.free_head;
        if header.is_null() {
            return None;
        }
        // SAFETY: header is the live head of the free list.
        unsafe {
            let base = header as usize;
            let data_start = base + HEADER_SIZE;
            let aligned_data = align_up(data_start, align);
            let front = aligned_data - data_start;

            let working_header = if front == 0 {
                header
            } else {
                if front < OVERHEAD + MIN_USABLE {
                    return None;
                }
                let total_usable = (*header).size();
                let front_usable = front - OVERHEAD;
                (*header).set(front_usable, true);
                (*footer_of(header)).set(front_usable, true);

                let new_header = (aligned_data - HEADER_SIZE) as *mut Header;
                let new_usable = total_usable - front;
                (*new_header).set(new_usable, true);
                (*footer_of(new_header)).set(new_usable, true);

                // `header`'s free-list node is untouched by shrinking its
                // size in place (its links live at the same address, still
                // within the smaller usable region). The new block born
                // from the carved-off tail just needs its own node.
                self.push_free(new_header);
                new_header
            };

            let block_usable = (*working_header).size();
            if block_usable < usable {
                return None;
            }
            if block_usable >= usable + MIN_SPLIT_USABLE {
                self.split(working_header, usable);
            } else {
                self.unlink_free(working_header);
                (*working_header).set(block_usable, false);
                (*footer_of(working_header)).set(block_usable, false);
            }
            Some(working_header)
        }
    }

    /// Frees `header`, coalescing with the physically adjacent block on
    /// either side if it is also free. Coalescing looks at the preceding
    /// block's footer (always valid memory as long as `header` is not the
    /// very first word of its arena) and the following block's header
    /// (always valid as long as `header` is not the arena's last block).
    unsafe fn free_block(&mut self, mut header: *mut Header) {
        // SAFETY: header is a previously allocated block belonging to this
        // heap, guaranteed by the GlobalAlloc contract.
        unsafe {
            header_of(header).check();
            let mut usable = (*header).size();

            if let Some(prev_footer_addr) = self.footer_before(header) {
                let prev_footer = prev_footer_addr as *mut Footer;
                if (*prev_footer).is_free() {
                    let prev_usable = (*prev_footer).size();
                    let prev_header =
                        (header as *mut u8).sub(OVERHEAD + prev_usable) as *mut Header;
                    self.unlink_free(prev_header);
                    usable += OVERHEAD + prev_usable;
                    header = prev_header;
                }
            }

            if let Some(next_header_addr) = self.header_after(header, usable) {
                let next_header = next_header_addr;
                if (*next_header).is_free() {
                    let next_usable = (*next_header).size();
                    self.unlink_free(next_header);
                    usable += OVERHEAD + next_usable;
                }
            }

            (*header).set(usable, true);
            (*footer_of(header)).set(usable, true);
            self.push_free(header);
        }
    }

    /// Returns the address of the preceding block's footer, unless `header`
    /// sits at the very start of an arena.
    fn footer_before(&self, header: *mut Header) -> Option<usize> {
        let addr = header as usize;
        let in_arena = self.arenas[..self.arena_count]
            .iter()
            .flatten()
            .find(|a| addr >= a.start && addr < a.start + a.len)?;
        if addr == in_arena.start {
            None
        } else {
            Some(addr - FOOTER_SIZE)
        }
    }

    /// Returns the following block's header, unless the block being freed
    /// runs to the end of its arena.
    fn header_after(&self, header: *mut Header, usable: usize) -> Option<*mut Header> {
        let end = header as usize + OVERHEAD + usable;
        let in_arena = self.arenas[..self.arena_count]
            .iter()
            .flatten()
            .find(|a| (header as usize) >= a.start && (header as usize) < a.start + a.len)?;
        if end >= in_arena.start + in_arena.len {
            None
        } else {
            Some(end as *mut Header)
        }
    }

    fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: cur is a live free-list node.
            let h = unsafe { header_of(cur) };
            total += h.size() + OVERHEAD;
            cur = unsafe { (*links_of(cur)).next };
        }
        total
    }
}

/// The kernel's global allocator. Installed as `#[global_allocator]` in
/// `lib.rs` on the bare-metal target; host test builds use the system
/// allocator instead since there is no frame allocator to back this one.
pub struct KernelHeap {
    state: Mutex<HeapState>,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self { state: Mutex::new(HeapState::empty()) }
    }
}

// SAFETY: every block handed out by `alloc` was sized and aligned to at
// least `align_of::<usize>()`; callers needing a larger alignment (page
// alignment, for the virtual allocator's own use) go through
// `alloc_page_aligned` instead, which this type also exposes via its
// normal `GlobalAlloc` methods by rounding the layout up before the call
// reaches `alloc_block`.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let usable = align_up(layout.size().max(1), layout.align().max(core::mem::align_of::<usize>()));
        let mut state = self.state.lock();
        // SAFETY: state is exclusively held via the mutex.
        let block = unsafe { state.alloc_block(usable) };
        match block {
            Some(header) => unsafe { usable_ptr(header) },
            None => {
                drop(state);
                if grow(GROWTH_FRAMES).is_err() {
                    return core::ptr::null_mut();
                }
                let mut state = self.state.lock();
                // SAFETY: same as above, after a successful grow.
                unsafe { state.alloc_block(usable) }.map(|h| unsafe { usable_ptr(h) }).unwrap_or(core::ptr::null_mut())
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let header = unsafe { ptr.sub(HEADER_SIZE) } as *mut Header;
        let mut state = self.state.lock();
        // SAFETY: ptr was returned by a prior `alloc` on this allocator.
        unsafe { state.free_block(header) };
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

static HEAP: KernelHeap = KernelHeap::empty();

#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL: &KernelHeap = &HEAP;

/// Carves the initial arena out of physical memory and donates it to the
/// heap. Physical memory is identity-mapped at this point (see
/// [`super::page_table::init_boot_identity_map`]), so the frames the
/// allocator hands back are directly usable as heap backing store with no
/// separate virtual mapping step.
pub fn init() {
    let free_frames = FRAME_ALLOCATOR.free_frames();
    let wanted_frames = (free_frames / INITIAL_HEAP_FRACTION)
        .max(INITIAL_HEAP_MIN_FRAMES)
        .min(INITIAL_HEAP_MAX_BYTES / FRAME_SIZE)
        .min(free_frames.saturating_sub(1));
    let wanted_frames = wanted_frames.max(1);

    let base = FRAME_ALLOCATOR
        .alloc(wanted_frames)
        .expect("mm: not enough physical memory for the initial kernel heap");
    let start = PhysicalAddress::new(base.as_addr()).as_usize();
    let len = wanted_frames * FRAME_SIZE;

    HEAP.state.lock().add_arena(start, len);
}

/// Requests `frames` more physical frames and adds them to the heap as a
/// new arena. Called automatically from `alloc` on exhaustion.
pub fn grow(frames: usize) -> Result<(), ()> {
    let base = FRAME_ALLOCATOR.alloc(frames).map_err(|_| ())?;
    let start = PhysicalAddress::new(base.as_addr()).as_usize();
    let len = frames * FRAME_SIZE;
    println!("[mm] heap growing by {} KiB", len / 1024);
    HEAP.state.lock().add_arena(start, len);
    Ok(())
}

/// Returns `(total_bytes, free_bytes)` across every arena donated so far.
pub fn stats() -> (usize, usize) {
    let state = HEAP.state.lock();
    (state.total_bytes, state.free_bytes())
}

/// Allocates a block whose usable pointer is page-aligned, by donating a
/// dedicated fresh arena (always frame-aligned, since the frame allocator
/// only ever hands out page-aligned physical addresses) and carving off its
/// misaligned leading bytes into their own free block. This is the
/// "front-remainder carving" path the virtual allocator uses when it needs
/// page-aligned kernel-side bookkeeping structures; it never reuses
/// general-purpose free blocks, since those carry no alignment guarantee.
pub fn alloc_page_aligned(size: usize) -> Option<NonNull<u8>> {
    let usable = size.max(MIN_USABLE);
    // One extra page of headroom guarantees a fresh, frame-aligned arena
    // can always be carved: its header starts exactly on a page boundary,
    // so the misaligned leading remainder is `FRAME_SIZE - HEADER_SIZE`
    // bytes, comfortably above `MIN_SPLIT_USABLE`.
    let arena_frames = (usable + OVERHEAD).div_ceil(FRAME_SIZE) + 1;
    let base = FRAME_ALLOCATOR.alloc(arena_frames).ok()?;
    let start = base.as_addr();
    let len = arena_frames * FRAME_SIZE;

    let mut state = HEAP.state.lock();
    state.add_arena(start, len);
    // SAFETY: the arena just added sits at the head of the free list, and
    // is large enough per the headroom computed above.
    let header = unsafe { state.carve_aligned(usable, FRAME_SIZE) }?;
    // SAFETY: header is a newly allocated block from this heap.
    Some(unsafe { NonNull::new_unchecked(usable_ptr(header)) })
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    /// A fresh `HeapState` backed by one leaked, page-aligned arena. Good
    /// enough for the free-list logic under test; nothing here is ever
    /// reclaimed, same as `FrameAllocator`'s host-side unit tests.
    fn seeded(len: usize) -> HeapState {
        let arena = Box::leak(alloc::vec![0u8; len].into_boxed_slice());
        let start = arena.as_mut_ptr() as usize;
        let mut state = HeapState::empty();
        state.add_arena(start, len);
        state
    }

    #[test_case]
    fn round_trip_restores_a_single_free_region() {
        let mut state = seeded(4096);
        let total_free_before = state.free_bytes();

        let sizes = [32usize, 64, 128, 17, 256];
        let mut blocks = alloc::vec::Vec::new();
        for &s in &sizes {
            // SAFETY: state is exclusively owned by this test.
            let header = unsafe { state.alloc_block(s) }.expect("allocation should succeed");
            blocks.push(header);
        }
        assert!(state.free_bytes() < total_free_before);

        // Free in a different order than allocated.
        for &header in [blocks[2], blocks[0], blocks[4], blocks[1], blocks[3]].iter() {
            // SAFETY: header was returned by alloc_block above and freed once.
            unsafe { state.free_block(header) };
        }

        assert_eq!(state.free_bytes(), total_free_before);
        // Coalescing must have produced exactly one free block again.
        let mut count = 0;
        let mut cur = state.free_head;
        while !cur.is_null() {
            count += 1;
            // SAFETY: cur is a live free-list node.
            cur = unsafe { (*links_of(cur)).next };
        }
        assert_eq!(count, 1);
    }

    #[test_case]
    fn written_bytes_survive_until_free() {
        let mut state = seeded(4096);
        // SAFETY: state is exclusively owned by this test.
        let header = unsafe { state.alloc_block(64) }.unwrap();
        // SAFETY: header is a live allocation at least 64 bytes usable.
        let ptr = unsafe { usable_ptr(header) };
        // SAFETY: ptr is valid for 64 bytes per the allocation above.
        unsafe {
            for i in 0..64u8 {
                *ptr.add(i as usize) = i;
            }
            for i in 0..64u8 {
                assert_eq!(*ptr.add(i as usize), i);
            }
            state.free_block(header);
        }
    }

    #[test_case]
    fn no_two_live_allocations_overlap() {
        let mut state = seeded(8192);
        let mut ranges = alloc::vec::Vec::new();
        for size in [16usize, 300, 40, 900, 8] {
            // SAFETY: state is exclusively owned by this test.
            if let Some(header) = unsafe { state.alloc_block(size) } {
                // SAFETY: header just allocated.
                let start = unsafe { usable_ptr(header) } as usize;
                let h = unsafe { header_of(header) };
                ranges.push((start, start + h.size()));
            }
        }
        for i in 0..ranges.len() {
            for j in (i + 1)..ranges.len() {
                let (a0, a1) = ranges[i];
                let (b0, b1) = ranges[j];
                assert!(a1 <= b0 || b1 <= a0, "allocations {i} and {j} overlap");
            }
        }
    }

    #[test_case]
    fn page_aligned_allocation_is_page_aligned() {
        // `alloc_page_aligned` goes through the global FRAME_ALLOCATOR, so
        // seed it the same way mm::frame_allocator's own tests do.
        FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
        let ptr = alloc_page_aligned(100).expect("allocation should succeed");
        assert_eq!(ptr.as_ptr() as usize % FRAME_SIZE, 0);
    }
}
