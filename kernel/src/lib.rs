//! Core of a freestanding 32-bit x86 kernel: physical/virtual memory
//! management, a preemptive round-robin task scheduler with fork/exec,
//! interrupt and system-call dispatch, and a VFS with ext2 and synthetic
//! backends.
//!
//! This library crate holds everything except the boot-time `_start`/
//! `kernel_entry` glue, which lives in the `veridian-kernel` binary
//! (`src/main.rs`) so the bare-metal and host (`cfg(test)`) builds can
//! share every module below it.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target (tests, coverage): delegate to the system allocator so
// ordinary `#[test]`s using Vec/String/alloc compile and run. The bare-metal
// target's global allocator is `mm::heap::KernelHeap`, installed in
// `mm::heap` itself.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
mod syscall;
mod test_framework;

pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE};
pub use sched::Task;
#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler. Panic is intentional: allocation failure
/// in a `no_std` kernel has no recovery path.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {layout:?}");
}
