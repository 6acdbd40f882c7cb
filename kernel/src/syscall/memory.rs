//! Memory-facing syscalls: `mmap`, `brk`. Both operate on
//! the calling task's `Vas`; `brk` additionally tracks the task's program
//! break (`Task::program_break`), the boundary `sbrk`-style allocators move.

use crate::error::{KernelError, KernelResult};
use crate::mm::vas::Vas;
use crate::mm::{PageFlags, VirtualAddress, PAGE_SIZE};
use crate::process::memory;

const PROT_WRITE: u32 = 0x2;
const PROT_EXEC: u32 = 0x4;
const MAP_ANONYMOUS: u32 = 0x20;

/// Maps `len` bytes of anonymous, demand-zero memory.
/// File-backed mappings (`MAP_ANONYMOUS` unset) are not implemented - a
/// task that wants a file's contents reads them the ordinary way.
pub fn sys_mmap(vas: &Vas, addr: u32, len: u32, prot: u32, flags: u32, _fd: u32, _off: u32) -> KernelResult<u32> {
    if flags & MAP_ANONYMOUS == 0 {
        return Err(KernelError::OperationNotSupported { operation: "mmap: file-backed mapping" });
    }
    if len == 0 {
        return Err(KernelError::InvalidArgument { name: "len", value: "zero" });
    }
    let pages = (len as usize).div_ceil(PAGE_SIZE);

    let mut page_flags = PageFlags::PRESENT | PageFlags::USER | PageFlags::ZERO_ON_ALLOC | PageFlags::FREE_ON_RELEASE;
    if prot & PROT_WRITE != 0 {
        page_flags |= PageFlags::WRITABLE;
    }
    // No separate no-execute bit tracked on this architecture's page
    // tables; PROT_EXEC is accepted for ABI compatibility and otherwise
    // ignored.
    let _ = prot & PROT_EXEC;

    let request = if addr == 0 { None } else { Some(VirtualAddress::new(addr as usize)) };
    let range = vas.reserve_lazy(pages, request, page_flags)?;
    Ok(range.start.as_usize() as u32)
}

/// `brk(addr)`: sets the task's program break. `addr == 0` just reports the
/// current break, matching glibc's `sbrk(0)` convention layered on top.
pub fn sys_brk(vas: &Vas, addr: u32) -> KernelResult<u32> {
    let task = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let current = memory::current_break(task.program_break());
    let target = if addr == 0 { current } else { addr as usize };
    let new_break = memory::set_break(vas, current, target)?;
    task.set_program_break(new_break);
    Ok(new_break as u32)
}
