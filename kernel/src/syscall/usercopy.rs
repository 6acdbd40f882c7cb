//! User-pointer validation: every syscall argument that is a
//! pointer gets translated through the caller's own address space rather
//! than dereferenced directly, so a task can never use a syscall to read
//! or write through an address it doesn't actually have mapped.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::KernelError;
use crate::mm::vas::Vas;
use crate::mm::{PageFlags, VirtualAddress, PAGE_SIZE};

type Result<T> = core::result::Result<T, KernelError>;

fn page_ptr(vas: &Vas, addr: usize, need_write: bool) -> Result<*mut u8> {
    let page = VirtualAddress::new(addr).page_align_down();
    let flags = vas.flags_at(page).ok_or(KernelError::InvalidAddress { addr })?;
    if !flags.contains(PageFlags::USER) {
        return Err(KernelError::InvalidAddress { addr });
    }
    if need_write && !flags.contains(PageFlags::WRITABLE) {
        return Err(KernelError::InvalidAddress { addr });
    }
    let phys = vas.translate(page).ok_or(KernelError::UnmappedMemory { addr })?;
    let offset = VirtualAddress::new(addr).page_offset();
    Ok((phys.as_usize() + offset) as *mut u8)
}

/// Copies `buf.len()` bytes from user address `addr` into `buf`, crossing
/// page boundaries one page at a time since adjacent user pages are not
/// guaranteed to be physically contiguous.
pub fn copy_from_user(vas: &Vas, addr: u32, buf: &mut [u8]) -> Result<()> {
    copy(vas, addr as usize, buf.len(), false, |src, dst_off, len| {
        // SAFETY: `src` was just validated by `page_ptr` as present,
        // user-accessible, and backing at least one page at `addr`; `len`
        // never crosses the page it was computed against.
        unsafe { core::ptr::copy_nonoverlapping(src, buf[dst_off..dst_off + len].as_mut_ptr(), len) };
        Ok(())
    })
}

/// Copies `buf` out to user address `addr`, the write-side mirror of
/// [`copy_from_user`].
pub fn copy_to_user(vas: &Vas, addr: u32, buf: &[u8]) -> Result<()> {
    copy(vas, addr as usize, buf.len(), true, |dst, src_off, len| {
        // SAFETY: see `copy_from_user`; `page_ptr` additionally confirmed
        // the destination page is writable.
        unsafe { core::ptr::copy_nonoverlapping(buf[src_off..src_off + len].as_ptr(), dst, len) };
        Ok(())
    })
}

fn copy(vas: &Vas, addr: usize, len: usize, write: bool, mut each_page: impl FnMut(*mut u8, usize, usize) -> Result<()>) -> Result<()> {
    let mut done = 0;
    while done < len {
        let cur = addr + done;
        let page_off = VirtualAddress::new(cur).page_offset();
        let chunk = (PAGE_SIZE - page_off).min(len - done);
        let ptr = page_ptr(vas, cur, write)?;
        each_page(ptr, done, chunk)?;
        done += chunk;
    }
    Ok(())
}

/// Reads a NUL-terminated string from user memory, refusing anything
/// longer than `max_len` bytes (a syscall-level `ENAMETOOLONG`-shaped
/// guard against a task pointing at an unterminated region).
pub fn read_cstr(vas: &Vas, addr: u32, max_len: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut cur = addr as usize;
    loop {
        if bytes.len() >= max_len {
            return Err(KernelError::InvalidArgument { name: "path", value: "string too long" });
        }
        let ptr = page_ptr(vas, cur, false)?;
        // SAFETY: ptr was just validated by page_ptr for this one byte.
        let byte = unsafe { *ptr };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cur += 1;
    }
    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument { name: "path", value: "not valid UTF-8" })
}

/// Reads a NULL-terminated array of `char*` (as `argv`/`envp` are passed)
/// into owned strings.
pub fn read_str_array(vas: &Vas, addr: u32, max_entries: usize) -> Result<Vec<String>> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for i in 0..max_entries {
        let mut word = [0u8; 4];
        copy_from_user(vas, addr + (i * 4) as u32, &mut word)?;
        let ptr = u32::from_ne_bytes(word);
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstr(vas, ptr, 4096)?);
    }
    Err(KernelError::InvalidArgument { name: "array", value: "missing NULL terminator" })
}
