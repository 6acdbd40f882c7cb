//! Physical frame allocator.
//!
//! A single flat bitmap covers physical memory at 4 KiB granularity; bit `i`
//! set means frame `i` is allocated. Allocation is first-fit linear scan:
//! this kernel targets one CPU and one memory node, so there is no need for
//! NUMA-aware or buddy-style allocation.

#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::println;

pub const FRAME_SIZE: usize = 4096;

/// Bitmap capacity: 2048 `u64` words cover 131072 frames, 512 MiB of
/// physical memory. Large enough for the target's 60 MiB boot-memory floor
/// with headroom; a machine reporting more is clamped at init time rather
/// than grown, since the bitmap is a `static` (frame allocator init runs
/// before the heap exists).
const BITMAP_WORDS: usize = 2048;
const MAX_FRAMES: usize = BITMAP_WORDS * 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_addr(self) -> usize {
        self.0 * FRAME_SIZE
    }

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr / FRAME_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    OutOfMemory,
    InvalidFrame,
    InvalidSize,
    AlreadyFree,
}

pub type Result<T> = core::result::Result<T, FrameAllocatorError>;

struct Bitmap {
    words: [u64; BITMAP_WORDS],
    total_frames: usize,
    free_frames: AtomicUsize,
}

impl Bitmap {
    const fn new() -> Self {
        Self {
            // All frames start allocated; `init` clears the bits the
            // multiboot memory map reports as available.
            words: [0; BITMAP_WORDS],
            total_frames: 0,
            free_frames: AtomicUsize::new(0),
        }
    }

    fn is_set(&self, frame: usize) -> bool {
        self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set(&mut self, frame: usize) {
        self.words[frame / 64] |= 1 << (frame % 64);
    }

    fn clear(&mut self, frame: usize) {
        self.words[frame / 64] &= !(1 << (frame % 64));
    }
}

/// Physical frame bitmap allocator. Single instance, global, protected by a
/// spinlock per the concurrency model (frame allocation is always reached
/// through the virtual allocator's own lock, but the allocator is safe to
/// call directly for early-boot reservations before that layer exists).
pub struct FrameAllocator {
    bitmap: Mutex<Bitmap>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: Mutex::new(Bitmap::new()),
        }
    }

    /// Seeds the bitmap from the multiboot memory map: every byte in an
    /// available range clears the covering frames' bits; everything else
    /// (including ranges past `MAX_FRAMES`) stays allocated. Must run once,
    /// before any `alloc`/`alloc_at` call.
    pub fn init(&self, total_bytes: u64, for_each_available: impl Fn(&mut dyn FnMut(u64, u64))) {
        let mut bitmap = self.bitmap.lock();
        let total_frames = ((total_bytes as usize) / FRAME_SIZE).min(MAX_FRAMES);
        bitmap.total_frames = total_frames;

        // Start fully allocated (the array literal in `Bitmap::new` is
        // already all-zero bits cleared meaning "allocated" under our
        // convention... but we invert: set bit = allocated, so start with
        // everything set).
        for word in bitmap.words.iter_mut() {
            *word = u64::MAX;
        }

        let mut mark_free = |base: u64, len: u64| {
            let start_frame = (base as usize) / FRAME_SIZE;
            let frame_count = (len as usize) / FRAME_SIZE;
            for i in 0..frame_count {
                let frame = start_frame + i;
                if frame < total_frames {
                    bitmap.clear(frame);
                }
            }
        };
        for_each_available(&mut mark_free);

        let free = (0..total_frames).filter(|&f| !bitmap.is_set(f)).count();
        bitmap.free_frames.store(free, Ordering::Relaxed);

        println!(
            "[mm] frame allocator: {total_frames} frames total, {free} free after boot reservations"
        );
    }

    /// Allocates `n` contiguous free frames via first-fit linear scan.
    pub fn alloc(&self, n: usize) -> Result<FrameNumber> {
        if n == 0 {
            return Err(FrameAllocatorError::InvalidSize);
        }

        let mut bitmap = self.bitmap.lock();
        let total = bitmap.total_frames;
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        for frame in 0..total {
            if bitmap.is_set(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == n {
                for f in run_start..run_start + n {
                    bitmap.set(f);
                }
                bitmap.free_frames.fetch_sub(n, Ordering::Relaxed);
                return Ok(FrameNumber::new(run_start));
            }
        }

        Err(FrameAllocatorError::OutOfMemory)
    }

    /// Reserves `[base, base+n)` if every frame in the range is currently
    /// free. Used during boot to reserve the kernel image and other
    /// known-occupied regions the memory map alone doesn't describe.
    pub fn alloc_at(&self, base: FrameNumber, n: usize) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        if base.0 + n > bitmap.total_frames {
            return Err(FrameAllocatorError::InvalidFrame);
        }
        for f in base.0..base.0 + n {
            if bitmap.is_set(f) {
                return Err(FrameAllocatorError::InvalidFrame);
            }
        }
        for f in base.0..base.0 + n {
            bitmap.set(f);
        }
        bitmap.free_frames.fetch_sub(n, Ordering::Relaxed);
        Ok(())
    }

    /// Releases `n` frames starting at `base` back to the pool.
    pub fn free(&self, base: FrameNumber, n: usize) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        if base.0 + n > bitmap.total_frames {
            return Err(FrameAllocatorError::InvalidFrame);
        }
        for f in base.0..base.0 + n {
            if !bitmap.is_set(f) {
                return Err(FrameAllocatorError::AlreadyFree);
            }
        }
        for f in base.0..base.0 + n {
            bitmap.clear(f);
        }
        bitmap.free_frames.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.lock().total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.lock().free_frames.load(Ordering::Relaxed)
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(total_bytes: u64) -> FrameAllocator {
        let fa = FrameAllocator::new();
        fa.init(total_bytes, |mark_free| mark_free(0, total_bytes));
        fa
    }

    #[test_case]
    fn alloc_free_bijection() {
        let fa = seeded(1024 * 1024);
        let before = fa.free_frames();
        let a = fa.alloc(4).unwrap();
        assert_eq!(fa.free_frames(), before - 4);
        fa.free(a, 4).unwrap();
        assert_eq!(fa.free_frames(), before);
    }

    #[test_case]
    fn first_fit_contiguous() {
        let fa = seeded(1024 * 1024);
        let a = fa.alloc(2).unwrap();
        let b = fa.alloc(2).unwrap();
        assert_eq!(b.as_usize(), a.as_usize() + 2);
    }

    #[test_case]
    fn double_free_rejected() {
        let fa = seeded(1024 * 1024);
        let a = fa.alloc(1).unwrap();
        fa.free(a, 1).unwrap();
        assert!(fa.free(a, 1).is_err());
    }

    #[test_case]
    fn exhaustion_then_recovery() {
        let fa = seeded(4 * FRAME_SIZE as u64);
        let mut allocated = alloc::vec::Vec::new();
        loop {
            match fa.alloc(1) {
                Ok(f) => allocated.push(f),
                Err(FrameAllocatorError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(fa.alloc(1).is_err());
        let freed = allocated.pop().unwrap();
        fa.free(freed, 1).unwrap();
        assert!(fa.alloc(1).is_ok());
    }
}
