//! Builds a runnable user address space from an ELF image: loads its
//! `PT_LOAD` segments via [`crate::elf::load`], then carves out and
//! populates the initial user stack with the argc/argv/envp layout a
//! freestanding `_start` expects to find at the entry `esp`.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::mm::vas::Vas;
use crate::mm::{PageFlags, VirtualAddress, PAGE_SIZE};

/// Top of every task's user stack range.
const USER_STACK_TOP: usize = 0xC000_0000;
const USER_STACK_PAGES: usize = 256; // 1 MiB

pub struct Loaded {
    pub entry: VirtualAddress,
    pub user_stack: VirtualAddress,
}

/// Loads `image` into `vas` and writes `argv`/`envp` onto a freshly
/// reserved user stack, returning the entry point and initial stack
/// pointer a task's first transition into user mode needs.
pub fn load_into(vas: &Vas, image: &[u8], argv: &[String], envp: &[String]) -> KernelResult<Loaded> {
    let loaded = elf::load(image, vas)
        .map_err(|_| KernelError::InvalidArgument { name: "image", value: "not a loadable ELF32 binary" })?;

    let stack_flags =
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::ZERO_ON_ALLOC | PageFlags::FREE_ON_RELEASE;
    let stack_base = VirtualAddress::new(USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE);
    vas.reserve(USER_STACK_PAGES, Some(stack_base), None, stack_flags)?;

    let sp = write_stack_layout(vas, argv, envp)?;
    Ok(Loaded { entry: loaded.entry, user_stack: sp })
}

/// Copies `bytes` plus a NUL terminator just below `*cursor`, moving it
/// down, and returns the address the string now lives at.
fn push_string(vas: &Vas, cursor: &mut usize, bytes: &[u8]) -> KernelResult<usize> {
    *cursor -= bytes.len() + 1;
    *cursor &= !0x3;
    let phys = vas
        .translate(VirtualAddress::new(*cursor).page_align_down())
        .ok_or(KernelError::UnmappedMemory { addr: *cursor })?;
    let page_off = *cursor & (PAGE_SIZE - 1);
    // SAFETY: phys backs the page `*cursor` falls in, just mapped by
    // `reserve` for this task's stack; the write stays inside that frame
    // because the caller only ever pushes strings short enough to fit the
    // fixed stack allocation.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), (phys.as_usize() + page_off) as *mut u8, bytes.len());
        *((phys.as_usize() + page_off + bytes.len()) as *mut u8) = 0;
    }
    Ok(*cursor)
}

fn push_word(vas: &Vas, cursor: &mut usize, word: u32) -> KernelResult<()> {
    *cursor -= 4;
    let phys =
        vas.translate(VirtualAddress::new(*cursor).page_align_down()).ok_or(KernelError::UnmappedMemory { addr: *cursor })?;
    let page_off = *cursor & (PAGE_SIZE - 1);
    // SAFETY: same as push_string.
    unsafe {
        core::ptr::write((phys.as_usize() + page_off) as *mut u32, word);
    }
    Ok(())
}

/// Lays out argc/argv/envp at the top of the stack range `load_into` just
/// reserved: string bytes first (highest addresses), then the envp and
/// argv pointer arrays (each NUL-pointer terminated), then argc - so the
/// resulting stack pointer has argc as the first word, matching the
/// layout `crt0` unpacks.
fn write_stack_layout(vas: &Vas, argv: &[String], envp: &[String]) -> KernelResult<VirtualAddress> {
    let mut cursor = USER_STACK_TOP;

    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp {
        envp_ptrs.push(push_string(vas, &mut cursor, s.as_bytes())?);
    }
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv {
        argv_ptrs.push(push_string(vas, &mut cursor, s.as_bytes())?);
    }

    push_word(vas, &mut cursor, 0)?; // envp[] NULL terminator
    for &ptr in envp_ptrs.iter().rev() {
        push_word(vas, &mut cursor, ptr as u32)?;
    }
    push_word(vas, &mut cursor, 0)?; // argv[] NULL terminator
    for &ptr in argv_ptrs.iter().rev() {
        push_word(vas, &mut cursor, ptr as u32)?;
    }
    push_word(vas, &mut cursor, argv.len() as u32)?; // argc

    Ok(VirtualAddress::new(cursor))
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::mm::FRAME_ALLOCATOR;

    fn seeded_allocator() {
        FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    /// Reads a little-endian `u32` out of `vas` at `addr`, the same way a
    /// freshly entered `_start` would.
    fn read_word(vas: &Vas, addr: usize) -> u32 {
        let phys = vas.translate(VirtualAddress::new(addr).page_align_down()).expect("address should be mapped");
        let page_off = addr & (PAGE_SIZE - 1);
        // SAFETY: `phys` backs a page `write_stack_layout` just mapped and
        // wrote a whole word into.
        unsafe { core::ptr::read((phys.as_usize() + page_off) as *const u32) }
    }

    fn read_cstr(vas: &Vas, addr: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = addr;
        loop {
            let phys = vas.translate(VirtualAddress::new(cur).page_align_down()).expect("address should be mapped");
            let page_off = cur & (PAGE_SIZE - 1);
            // SAFETY: same as read_word, one byte at a time within the
            // mapped stack page.
            let byte = unsafe { core::ptr::read((phys.as_usize() + page_off) as *const u8) };
            if byte == 0 {
                break;
            }
            out.push(byte);
            cur += 1;
        }
        out
    }

    fn stack_vas() -> Vas {
        seeded_allocator();
        let vas = crate::mm::vas::new_user_context().expect("seeded allocator should have room for one context");
        let stack_flags =
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::ZERO_ON_ALLOC | PageFlags::FREE_ON_RELEASE;
        let stack_base = VirtualAddress::new(USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE);
        vas.reserve(USER_STACK_PAGES, Some(stack_base), None, stack_flags).expect("stack range should reserve cleanly");
        vas
    }

    #[test_case]
    fn the_stack_pointer_leads_with_argc() {
        let vas = stack_vas();
        let argv = alloc::vec![String::from("prog"), String::from("-x")];
        let envp = alloc::vec![String::from("HOME=/")];
        let sp = write_stack_layout(&vas, &argv, &envp).expect("stack layout should write cleanly");
        assert_eq!(read_word(&vas, sp.as_usize()), 2);
    }

    #[test_case]
    fn argv_pointers_resolve_to_the_original_strings_in_order() {
        let vas = stack_vas();
        let argv = alloc::vec![String::from("prog"), String::from("-x")];
        let envp: Vec<String> = Vec::new();
        let sp = write_stack_layout(&vas, &argv, &envp).expect("stack layout should write cleanly");

        // Layout is argc, argv[0..n], NULL, envp[0..m], NULL.
        let argv0_ptr = read_word(&vas, sp.as_usize() + 4) as usize;
        let argv1_ptr = read_word(&vas, sp.as_usize() + 8) as usize;
        let argv_terminator = read_word(&vas, sp.as_usize() + 12);

        assert_eq!(read_cstr(&vas, argv0_ptr), b"prog");
        assert_eq!(read_cstr(&vas, argv1_ptr), b"-x");
        assert_eq!(argv_terminator, 0);
    }

    #[test_case]
    fn an_empty_argv_and_envp_still_produce_a_valid_layout() {
        let vas = stack_vas();
        let empty: Vec<String> = Vec::new();
        let sp = write_stack_layout(&vas, &empty, &empty).expect("empty argv/envp should still lay out cleanly");
        assert_eq!(read_word(&vas, sp.as_usize()), 0); // argc
        assert_eq!(read_word(&vas, sp.as_usize() + 4), 0); // argv[] terminator
        assert_eq!(read_word(&vas, sp.as_usize() + 8), 0); // envp[] terminator
    }
}
