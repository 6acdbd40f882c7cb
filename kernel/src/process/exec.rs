//! `execve()`: replaces the calling task's image in place.
//!
//! This kernel reuses the calling task's existing `Vas` and page directory
//! across `exec` rather than building a new one - nothing holds a mutable
//! reference to a `&'static Task` that could swap its `vas` field out, and
//! a fresh page directory would need one. Instead: tear down every old
//! user mapping via [`Vas::release_above`], load the new ELF into the same
//! address space, rebuild the stack, and patch the live trap frame so the
//! syscall's ordinary `iretd` return lands directly in the new image.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::x86::idt::InterruptFrame;
use crate::error::{KernelError, KernelResult};
use crate::fs::{self, OpenFlags};
use crate::process::loader;

/// Every real user range starts well above this; the one range that does
/// not (the identity-mapped low-memory reserved for the kernel) starts at
/// virtual address 0 and must survive every `exec`.
const MIN_USER_ADDR: usize = 0x1000;

/// Reads `path` fully into memory. Shared by `execve` and `kernel_entry`'s
/// loading of the initial `init` task, which has no running task/frame to
/// thread a syscall-shaped `execve` through.
pub fn read_whole_file(path: &str) -> KernelResult<Vec<u8>> {
    let node = fs::open(path, OpenFlags::read_only())?;
    let size = node.metadata()?.size as usize;
    let mut buf = alloc::vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = node.read(done as u64, &mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);
    Ok(buf)
}

/// Executes `path` with `argv`/`envp`, replacing the calling task's address
/// space and rewriting `frame` to resume directly in the new image. On
/// success there is nothing left of the old program to return to; on
/// failure the old image (and `frame`) are untouched, matching POSIX
/// `execve`'s failure contract.
pub fn execve(frame: &mut InterruptFrame, path: &str, argv: &[String], envp: &[String]) -> KernelResult<()> {
    let image = read_whole_file(path)?;

    let task = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    task.vas.release_above(MIN_USER_ADDR)?;
    task.fd_table.close_on_exec();
    task.set_program_break(0);

    let loaded = loader::load_into(&task.vas, &image, argv, envp)?;

    frame.eip = loaded.entry.as_usize() as u32;
    frame.user_esp = loaded.user_stack.as_usize() as u32;
    frame.eax = 0;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    frame.esi = 0;
    frame.edi = 0;
    frame.ebp = 0;

    Ok(())
}
