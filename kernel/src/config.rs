//! Boot-time tunables, centralized as `const` items rather than a runtime
//! config file - there is no filesystem mounted yet at the point most of
//! these are consulted (frame allocator seeding, heap carve-out, scheduler
//! quantum).

/// Scheduler quantum, in PIT ticks (`arch::x86::timer`'s tick rate).
pub const TICKS_PER_QUANTUM: u32 = 5;

/// Default capacity of a freshly created pipe's ring buffer.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Per-task file descriptor table ceiling.
pub const MAX_OPEN_FILES: usize = 1024;

/// Fraction of free physical memory donated to the kernel heap's initial
/// arena (1/N) at `mm::init` time.
pub const INITIAL_HEAP_FRACTION: usize = 8;

/// Hard ceiling on the initial heap arena, regardless of how much memory
/// the loader reports.
pub const INITIAL_HEAP_MAX_BYTES: usize = 32 * 1024 * 1024;

/// Floor on the initial heap arena, in frames, so a tiny reported memory
/// size still gets a usable heap.
pub const INITIAL_HEAP_MIN_FRAMES: usize = 256;

/// First vector the 8259 PIC is remapped to, after the 32 CPU exception
/// vectors. `arch::x86::idt::IRQ_BASE` is defined in terms of this.
pub const PIC_VECTOR_BASE: u8 = 32;
