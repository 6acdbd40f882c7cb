//! Multiboot1 header and boot information parsing.
//!
//! The kernel is loaded by a multiboot-compliant loader (GRUB and similar).
//! We emit a multiboot1 header (magic `0x1BADB002`) rather than multiboot2;
//! it is simpler and sufficient for the memory-map information this kernel
//! consumes.

use core::arch::global_asm;

const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;
const MULTIBOOT_HEADER_FLAGS: u32 = 0x0000_0003; // align modules, request mem info
const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

global_asm!(
    r#"
.section .multiboot_header, "a"
.align 4
multiboot_header_start:
    .long {magic}
    .long {flags}
    .long -({magic} + {flags})
multiboot_header_end:
"#,
    magic = const MULTIBOOT_HEADER_MAGIC,
    flags = const MULTIBOOT_HEADER_FLAGS,
);

/// One entry of the multiboot memory map, as laid out on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MmapEntryRaw {
    size: u32,
    base_addr: u64,
    length: u64,
    kind: u32,
}

/// A typed physical memory range reported by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub length: u64,
    pub available: bool,
}

/// Multiboot type 1 means "available RAM"; everything else is reserved.
const MULTIBOOT_MEMORY_AVAILABLE: u32 = 1;

#[repr(C, packed)]
struct MultibootInfoRaw {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

const FLAG_MEM: u32 = 1 << 0;
const FLAG_MODS: u32 = 1 << 3;
const FLAG_MMAP: u32 = 1 << 6;

/// One entry of the multiboot module list, as laid out on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ModuleEntryRaw {
    mod_start: u32,
    mod_end: u32,
    string: u32,
    reserved: u32,
}

/// Parsed boot information: lower/upper conventional memory (in KiB).
pub struct BootInfo {
    pub mem_lower_kib: u32,
    pub mem_upper_kib: u32,
    pub mmap_addr: u32,
    pub mmap_length: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
}

/// Validates the multiboot magic handed to us and returns the parsed header
/// fields. Panics (aborting boot) if the magic does not match, if the
/// reported total memory is below the 60 MiB floor, or if no memory map was
/// supplied, exactly as required by the bring-up sequencing.
///
/// # Safety
/// `info_addr` must be the physical address of a valid multiboot1 info
/// structure, as guaranteed by the loader contract when `magic` matches.
pub unsafe fn parse(magic: u32, info_addr: u32) -> BootInfo {
    if magic != MULTIBOOT_BOOTLOADER_MAGIC {
        panic!("boot: bad multiboot magic 0x{magic:08x}");
    }

    // SAFETY: the multiboot loader contract guarantees info_addr points at a
    // valid MultibootInfoRaw for the lifetime of this call, since magic has
    // just been validated above.
    let info = unsafe { &*(info_addr as *const MultibootInfoRaw) };

    if info.flags & FLAG_MEM == 0 {
        panic!("boot: multiboot info missing memory size fields");
    }

    let total_kib = info.mem_lower as u64 + info.mem_upper as u64;
    if total_kib * 1024 < 60 * 1024 * 1024 {
        panic!("boot: less than 60 MiB of memory reported ({total_kib} KiB)");
    }

    if info.flags & FLAG_MMAP == 0 {
        panic!("boot: multiboot memory map missing");
    }

    let (mods_count, mods_addr) = if info.flags & FLAG_MODS == 0 { (0, 0) } else { (info.mods_count, info.mods_addr) };

    BootInfo {
        mem_lower_kib: info.mem_lower,
        mem_upper_kib: info.mem_upper,
        mmap_addr: info.mmap_addr,
        mmap_length: info.mmap_length,
        mods_count,
        mods_addr,
    }
}

/// Returns the first boot module as a byte slice, if the loader supplied
/// one. `kernel_entry` treats it as the root filesystem image (an ext2
/// volume staged by the bootloader), since there is no mounted filesystem
/// and no real disk driver to read one from at this point in boot.
///
/// # Safety
/// `boot_info` must come from a prior successful call to [`parse`]; the
/// returned slice borrows physical memory the loader placed the module in,
/// which must stay untouched by the frame allocator for the slice's
/// lifetime (the caller reads it before memory is reused, as the bring-up
/// sequencing requires).
pub unsafe fn first_module(boot_info: &BootInfo) -> Option<&'static [u8]> {
    if boot_info.mods_count == 0 {
        return None;
    }
    // SAFETY: mods_addr points at a run of at least mods_count
    // ModuleEntryRaw structs, per the multiboot loader contract validated
    // in parse().
    let entry = unsafe { &*(boot_info.mods_addr as *const ModuleEntryRaw) };
    let start = entry.mod_start as usize;
    let len = (entry.mod_end - entry.mod_start) as usize;
    // SAFETY: [mod_start, mod_end) is the loader-supplied module image,
    // reserved from the frame allocator the same way the kernel image is.
    Some(unsafe { core::slice::from_raw_parts(start as *const u8, len) })
}

/// Walks the multiboot memory map and invokes `f` once per typed range.
///
/// # Safety
/// `boot_info` must come from a prior successful call to [`parse`].
pub unsafe fn for_each_memory_range(boot_info: &BootInfo, mut f: impl FnMut(MemoryRange)) {
    let mut cursor = boot_info.mmap_addr as usize;
    let end = cursor + boot_info.mmap_length as usize;

    while cursor < end {
        // SAFETY: cursor stays within [mmap_addr, mmap_addr + mmap_length),
        // which the loader guarantees is a valid run of mmap entries, and
        // the caller has validated this boot_info via parse().
        let entry = unsafe { &*(cursor as *const MmapEntryRaw) };
        f(MemoryRange {
            base: entry.base_addr,
            length: entry.length,
            available: entry.kind == MULTIBOOT_MEMORY_AVAILABLE,
        });
        // The `size` field does not include itself.
        cursor += entry.size as usize + core::mem::size_of::<u32>();
    }
}
