//! Boot entry point. Every other module lives in the `veridian_kernel`
//! library crate (`src/lib.rs`), which is what carries the bare-metal
//! `#[test_case]` suite - this binary target builds with `test = false`
//! (see `Cargo.toml`) and has no test harness of its own.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::panic::PanicInfo;

use veridian_kernel::arch::x86::{self, multiboot};
use veridian_kernel::fs::{self, blockdev::RamBlockDevice};
use veridian_kernel::mm;
use veridian_kernel::process;
use veridian_kernel::sched;
use veridian_kernel::{println, serial_println};

/// Default PIT tick interval. The scheduler's quantum is counted in ticks
/// at this granularity, not in wall-clock time.
const TIMER_INTERVAL_MS: u32 = 10;

/// Candidate paths for the first task, tried in order against the mounted
/// root filesystem.
const INIT_PATHS: &[&str] = &["/sbin/init", "/init"];

/// Entry point called by `_boot_entry` (`arch::x86::boot`) with the
/// multiboot magic in `eax` and the physical address of the multiboot info
/// structure in `ebx`. Brings the kernel up through every subsystem in
/// dependency order and hands off to the scheduler; never returns.
#[no_mangle]
pub extern "C" fn kernel_entry(magic: u32, mb_info_addr: u32) -> ! {
    // SAFETY: called exactly once, at the start of boot, with the registers
    // `_boot_entry`'s asm stub populated from the multiboot loader handoff.
    let boot_info = unsafe { multiboot::parse(magic, mb_info_addr) };

    x86::init();
    println!("veridian-kernel v{}", env!("CARGO_PKG_VERSION"));
    println!("[boot] multiboot memory: {} KiB lower, {} KiB upper", boot_info.mem_lower_kib, boot_info.mem_upper_kib);

    // SAFETY: boot_info came from a successful multiboot::parse call, per
    // this session's contract; if the loader supplied a module (staged as
    // the root disk image) its frames must stay reserved until mm::init
    // has marked them used.
    let root_image = unsafe { multiboot::first_module(&boot_info) };
    let reserve = root_image.map(|m| (m.as_ptr() as usize, m.as_ptr() as usize + m.len()));

    // SAFETY: first and only call this boot, right after the architecture
    // layer is up and before anything allocates.
    unsafe {
        mm::init(&boot_info, reserve);
    }

    x86::timer::init(TIMER_INTERVAL_MS);
    sched::init();

    fs::init();
    mount_root(root_image);

    spawn_init();

    x86::enable_interrupts();
    println!("[boot] handing off to the scheduler");
    sched::run();
}

/// Mounts the root ext2 volume from the boot module, if the loader supplied
/// one. A real IDE/ATA driver is out of scope for this kernel;
/// without a module there is simply no root filesystem, and `init` must
/// come from `/dev` or `/sys` alone.
fn mount_root(root_image: Option<&'static [u8]>) {
    let Some(image) = root_image else {
        println!("[fs] no boot module supplied; root filesystem not mounted");
        return;
    };

    let device = Arc::new(RamBlockDevice::from_image(String::from("boot0"), 1024, image.to_vec()));
    match fs::mount_root(device) {
        Ok(()) => println!("[fs] root ext2 volume mounted ({} bytes)", image.len()),
        Err(e) => println!("[fs] root mount failed, continuing without it: {e}"),
    }
}

/// Loads the first user task from the mounted root filesystem and registers
/// it with the scheduler as pid 1. A missing `init` binary is fatal: there
/// is nothing else for the scheduler to run.
fn spawn_init() {
    let image = INIT_PATHS
        .iter()
        .find_map(|path| process::exec::read_whole_file(path).ok().map(|bytes| (*path, bytes)));

    let Some((path, image)) = image else {
        panic!("boot: no init binary found at any of {INIT_PATHS:?}");
    };

    let vas = mm::vas::new_user_context().unwrap_or_else(|e| panic!("boot: failed to build init's address space: {e}"));
    let argv = [String::from(path)];
    let loaded = process::loader::load_into(&vas, &image, &argv, &[])
        .unwrap_or_else(|e| panic!("boot: failed to load {path}: {e}"));

    let pid = sched::spawn_init(vas, loaded.entry.as_usize() as u32, loaded.user_stack.as_usize() as u32);
    println!("[boot] init loaded from {path} as pid {pid}");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[KERNEL PANIC] {info}");
    let _guard = x86::disable_interrupts();
    loop {
        x86::halt();
    }
}
