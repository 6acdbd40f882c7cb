//! ELF32 binary loader.
//!
//! Validates an i386 ELF image, maps its `PT_LOAD` segments into a task's
//! address space page by page, and reports the entry point and (if
//! present) the requested dynamic interpreter path. There is no relocation
//! processing or dynamic symbol resolution here - `PT_DYNAMIC` is parsed
//! only far enough to hand the interpreter path back to the caller, which
//! is as far as this loader goes.

pub mod types;

use alloc::string::String;

pub use types::ElfError;
use types::{ElfClass, ElfData, ProgramHeader, ELF_MAGIC, EM_386, ET_DYN, ET_EXEC, PF_W, PF_X, PT_INTERP, PT_LOAD};

use crate::mm::{vas::Vas, PageFlags, VirtualAddress, FRAME_SIZE};

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

pub struct LoadedImage {
    pub entry: VirtualAddress,
    pub interpreter: Option<String>,
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

struct Header {
    e_type: u16,
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

fn parse_header(image: &[u8]) -> Result<Header, ElfError> {
    if image.len() < EHDR_SIZE {
        return Err(ElfError::TooSmall);
    }
    if image[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if image[4] != ElfClass::Elf32 as u8 {
        return Err(ElfError::WrongClass);
    }
    if image[5] != ElfData::LittleEndian as u8 {
        return Err(ElfError::WrongEndianness);
    }

    let e_type = read_u16(image, 16);
    let e_machine = read_u16(image, 18);
    if e_machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(ElfError::NotExecutable);
    }

    Ok(Header {
        e_type,
        e_entry: read_u32(image, 24),
        e_phoff: read_u32(image, 28),
        e_phentsize: read_u16(image, 42),
        e_phnum: read_u16(image, 44),
    })
}

fn parse_program_header(image: &[u8], off: usize) -> Result<ProgramHeader, ElfError> {
    if off + PHDR_SIZE > image.len() {
        return Err(ElfError::BadProgramHeaderTable);
    }
    Ok(ProgramHeader {
        p_type: read_u32(image, off),
        p_offset: read_u32(image, off + 4),
        p_vaddr: read_u32(image, off + 8),
        p_paddr: read_u32(image, off + 12),
        p_filesz: read_u32(image, off + 16),
        p_memsz: read_u32(image, off + 20),
        p_flags: read_u32(image, off + 24),
        p_align: read_u32(image, off + 28),
    })
}

/// Validates and loads `image` into `vas`, mapping every `PT_LOAD` segment
/// page by page (file bytes copied in, the `memsz - filesz` tail left
/// zeroed via demand-zero pages). Aborts cleanly - no partial state left
/// mapped beyond what the caller tears down on error - by virtue of every
/// segment being mapped into a brand new, otherwise-empty address space;
/// `execve`'s caller is responsible for discarding `vas` on failure.
pub fn load(image: &[u8], vas: &Vas) -> Result<LoadedImage, ElfError> {
    let header = parse_header(image)?;
    if header.e_phentsize as usize != PHDR_SIZE {
        return Err(ElfError::BadProgramHeaderTable);
    }

    let mut interpreter = None;
    let mut load_segments = 0;

    for i in 0..header.e_phnum as usize {
        let off = header.e_phoff as usize + i * PHDR_SIZE;
        let phdr = parse_program_header(image, off)?;

        match phdr.p_type {
            PT_LOAD => {
                load_segments += 1;
                if phdr.p_flags & PF_W != 0 && phdr.p_flags & PF_X != 0 {
                    return Err(ElfError::WritableAndExecutable);
                }
                let file_end = (phdr.p_offset as usize)
                    .checked_add(phdr.p_filesz as usize)
                    .ok_or(ElfError::SegmentOutOfBounds)?;
                if file_end > image.len() || phdr.p_filesz > phdr.p_memsz {
                    return Err(ElfError::SegmentOutOfBounds);
                }
                map_segment(vas, image, &phdr)?;
            }
            PT_INTERP => {
                let start = phdr.p_offset as usize;
                let end = start
                    .checked_add(phdr.p_filesz as usize)
                    .ok_or(ElfError::SegmentOutOfBounds)?;
                if end > image.len() {
                    return Err(ElfError::SegmentOutOfBounds);
                }
                let raw = &image[start..end];
                let trimmed = raw.split(|&b| b == 0).next().unwrap_or(raw);
                interpreter = core::str::from_utf8(trimmed).ok().map(String::from);
            }
            // PT_DYNAMIC, PT_NOTE, PT_PHDR, PT_GNU_* and anything else: not
            // acted on. The loader performs no relocation processing.
            _ => {}
        }
    }

    if load_segments == 0 {
        return Err(ElfError::NoLoadSegments);
    }

    Ok(LoadedImage { entry: VirtualAddress::new(header.e_entry as usize), interpreter })
}

fn segment_flags(phdr: &ProgramHeader) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if phdr.p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    flags
}

/// Maps one `PT_LOAD` segment, page-rounded at both ends: `reserve` eagerly
/// allocates and zeroes every page the segment covers up front (the
/// `ZERO_ON_ALLOC` flag, same as any other `Vas::reserve` caller - there is
/// no page-fault-driven lazy path here, that's `sys_mmap`'s), after which
/// the portion covered by file bytes is copied in verbatim over the
/// zeroed pages, leaving the `memsz - filesz` tail (bss) zero. A binary
/// whose segments don't fit fails with `OutOfMemory` here, at exec time,
/// not later on first touch.
fn map_segment(vas: &Vas, image: &[u8], phdr: &ProgramHeader) -> Result<(), ElfError> {
    let vaddr = phdr.p_vaddr as usize;
    let page_start = vaddr & !(FRAME_SIZE - 1);
    let page_end = (vaddr + phdr.p_memsz as usize).div_ceil(FRAME_SIZE) * FRAME_SIZE;
    let pages = (page_end - page_start) / FRAME_SIZE;

    let flags = segment_flags(phdr);
    vas.reserve(
        pages,
        Some(VirtualAddress::new(page_start)),
        None,
        flags | PageFlags::ZERO_ON_ALLOC | PageFlags::FREE_ON_RELEASE,
    )
    .map_err(|_| ElfError::SegmentOutOfBounds)?;

    let file_bytes = &image[phdr.p_offset as usize..phdr.p_offset as usize + phdr.p_filesz as usize];
    let mut copied = 0usize;
    while copied < file_bytes.len() {
        let dest = vaddr + copied;
        let phys = vas
            .translate(VirtualAddress::new(dest & !(FRAME_SIZE - 1)))
            .ok_or(ElfError::SegmentOutOfBounds)?;
        let page_off = dest & (FRAME_SIZE - 1);
        let chunk = (FRAME_SIZE - page_off).min(file_bytes.len() - copied);

        // SAFETY: `phys` is a frame `reserve` just mapped for this segment
        // (identity-mapped physical memory, per the boot mapping), and the
        // write stays within that frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                file_bytes[copied..copied + chunk].as_ptr(),
                (phys.as_usize() + page_off) as *mut u8,
                chunk,
            );
        }
        copied += chunk;
    }

    Ok(())
}

/// Allocates and maps a fresh stack for a loaded image, just below the
/// address-space ceiling, growing down.
pub fn map_initial_stack(vas: &Vas, pages: usize) -> Result<VirtualAddress, ElfError> {
    let top = u32::MAX as usize - FRAME_SIZE + 1;
    let start = top - pages * FRAME_SIZE;
    vas.reserve(
        pages,
        Some(VirtualAddress::new(start)),
        None,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::ZERO_ON_ALLOC | PageFlags::FREE_ON_RELEASE,
    )
    .map(|range| range.end())
    .map_err(|_| ElfError::SegmentOutOfBounds)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use super::types::PF_R;
    use crate::mm::FRAME_ALLOCATOR;

    fn seeded_allocator() {
        FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    /// Builds a minimal i386 ELF image: a header, one program header table
    /// entry per `segments`, and each segment's file bytes laid out back
    /// to back right after the table. `segments` are
    /// `(p_type, p_vaddr, p_filesz, p_memsz, p_flags, file_bytes)`.
    fn build_image(e_type: u16, e_machine: u16, entry: u32, segments: &[(u32, u32, u32, u32, u32, &[u8])]) -> Vec<u8> {
        let phoff = EHDR_SIZE as u32;
        let phnum = segments.len() as u16;
        let mut image = alloc::vec![0u8; EHDR_SIZE + segments.len() * PHDR_SIZE];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ElfClass::Elf32 as u8;
        image[5] = ElfData::LittleEndian as u8;
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&e_machine.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&phoff.to_le_bytes());
        image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&phnum.to_le_bytes());

        for (i, (p_type, p_vaddr, p_filesz, p_memsz, p_flags, bytes)) in segments.iter().enumerate() {
            let data_offset = image.len() as u32;
            image.extend_from_slice(bytes);
            let off = phoff as usize + i * PHDR_SIZE;
            image[off..off + 4].copy_from_slice(&p_type.to_le_bytes());
            image[off + 4..off + 8].copy_from_slice(&data_offset.to_le_bytes());
            image[off + 8..off + 12].copy_from_slice(&p_vaddr.to_le_bytes());
            image[off + 16..off + 20].copy_from_slice(&p_filesz.to_le_bytes());
            image[off + 20..off + 24].copy_from_slice(&p_memsz.to_le_bytes());
            image[off + 24..off + 28].copy_from_slice(&p_flags.to_le_bytes());
        }
        image
    }

    #[test_case]
    fn rejects_an_image_shorter_than_the_header() {
        assert!(matches!(parse_header(&[0u8; 10]), Err(ElfError::TooSmall)));
    }

    #[test_case]
    fn rejects_the_wrong_magic() {
        let image = build_image(ET_EXEC, EM_386, 0, &[]);
        let mut bad = image;
        bad[0] = b'X';
        assert!(matches!(parse_header(&bad), Err(ElfError::BadMagic)));
    }

    #[test_case]
    fn rejects_a_non_386_machine_type() {
        let image = build_image(ET_EXEC, 0x3E /* x86-64 */, 0, &[]);
        assert!(matches!(parse_header(&image), Err(ElfError::WrongMachine)));
    }

    #[test_case]
    fn rejects_a_relocatable_object_as_not_executable() {
        let image = build_image(1 /* ET_REL */, EM_386, 0, &[]);
        assert!(matches!(parse_header(&image), Err(ElfError::NotExecutable)));
    }

    #[test_case]
    fn accepts_a_well_formed_header() {
        let image = build_image(ET_EXEC, EM_386, 0x1000, &[]);
        let header = parse_header(&image).expect("well-formed header should parse");
        assert_eq!(header.e_entry, 0x1000);
        assert_eq!(header.e_type, ET_EXEC);
    }

    #[test_case]
    fn rejects_a_segment_whose_file_bytes_run_past_the_image() {
        let mut image = build_image(ET_EXEC, EM_386, 0, &[(PT_LOAD, 0x1000, 4, 4, PF_R, &[1, 2, 3, 4])]);
        // Claim a file size far larger than the image actually contains.
        let off = EHDR_SIZE;
        image[off + 16..off + 20].copy_from_slice(&0xFFFF_u32.to_le_bytes());
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        assert!(matches!(load(&image, &vas), Err(ElfError::SegmentOutOfBounds)));
    }

    #[test_case]
    fn rejects_a_segment_marked_both_writable_and_executable() {
        let image = build_image(ET_EXEC, EM_386, 0, &[(PT_LOAD, 0x1000, 4, 4, PF_W | PF_X, &[1, 2, 3, 4])]);
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        assert!(matches!(load(&image, &vas), Err(ElfError::WritableAndExecutable)));
    }

    #[test_case]
    fn loads_a_single_load_segment_and_copies_its_bytes() {
        let payload = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let image = build_image(ET_EXEC, EM_386, 0x0040_1000, &[(PT_LOAD, 0x0040_0000, 4, 4, PF_R, &payload)]);
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        let loaded = load(&image, &vas).expect("single PT_LOAD segment should load");
        assert_eq!(loaded.entry, VirtualAddress::new(0x0040_1000));
        assert!(loaded.interpreter.is_none());

        let phys = vas.translate(VirtualAddress::new(0x0040_0000)).expect("segment should be mapped");
        // SAFETY: `phys` was just mapped by `load` for this segment and
        // holds at least 4 bytes of identity-mapped physical memory.
        let read_back = unsafe { core::slice::from_raw_parts(phys.as_usize() as *const u8, 4) };
        assert_eq!(read_back, &payload);
    }

    #[test_case]
    fn rejects_a_binary_with_no_load_segments() {
        let image = build_image(ET_EXEC, EM_386, 0, &[]);
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        assert!(matches!(load(&image, &vas), Err(ElfError::NoLoadSegments)));
    }
}
