//! System call trap dispatch: the single entry point
//! `irq::dispatch` calls for vector `0x80`. Reads the call number and up to
//! six arguments out of the trap frame (the `int 0x80` ABI: `eax` the
//! number, `ebx`/`ecx`/`edx`/`esi`/`edi`/`ebp` arguments one through six),
//! dispatches to a handler, and writes the result back per the
//! `-1`/`errno` convention: `eax` gets the return value on success, or
//! `u32::MAX` (i.e. `-1`) on failure with the per-task errno cell set to
//! the translated [`Errno`].

#![allow(dead_code)]

mod filesystem;
mod memory;
mod process;
mod usercopy;

use crate::arch::x86::idt::InterruptFrame;
use crate::error::{Errno, KernelError, KernelResult};

const SYS_READ: usize = 0;
const SYS_WRITE: usize = 1;
const SYS_OPEN: usize = 2;
const SYS_CLOSE: usize = 3;
const SYS_SEEK: usize = 4;
const SYS_STAT: usize = 5;
const SYS_FSTAT: usize = 6;
const SYS_CHDIR: usize = 7;
const SYS_GETCWD: usize = 8;
const SYS_PIPE: usize = 9;
const SYS_FORK: usize = 10;
const SYS_EXECVE: usize = 11;
const SYS_EXIT: usize = 12;
const SYS_WAIT: usize = 13;
const SYS_GETPID: usize = 14;
const SYS_IOCTL: usize = 15;
const SYS_POLL: usize = 16;
const SYS_MMAP: usize = 17;
const SYS_BRK: usize = 18;

/// The common interrupt path's syscall gate handler.
///
/// # Safety
/// Must only be called by [`crate::irq::dispatch`] for vector
/// [`crate::arch::x86::idt::SYSCALL_VECTOR`], with a frame built by the
/// matching assembly stub.
pub fn dispatch(frame: &mut InterruptFrame) {
    let nr = frame.eax as usize;
    let args = [frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi, frame.ebp];

    let result = route(nr, args, frame);

    match result {
        Ok(value) => frame.eax = value,
        Err(err) => {
            let errno = Errno::from(err);
            if let Some(task) = crate::sched::current_task() {
                task.set_errno(errno as i32);
            }
            frame.eax = u32::MAX;
        }
    }
}

fn route(nr: usize, args: [u32; 6], frame: &mut InterruptFrame) -> KernelResult<u32> {
    // Every handler below needs the calling task's address space to
    // validate and translate pointer arguments; `exit`/`fork`/`getpid`
    // don't touch user memory but still run on the same task, so there's
    // no harm resolving it up front.
    let vas = crate::sched::current_vas().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;

    match nr {
        SYS_READ => filesystem::sys_read(vas, args[0], args[1], args[2]),
        SYS_WRITE => filesystem::sys_write(vas, args[0], args[1], args[2]),
        SYS_OPEN => filesystem::sys_open(vas, args[0], args[1], args[2]),
        SYS_CLOSE => filesystem::sys_close(args[0]),
        SYS_SEEK => filesystem::sys_seek(args[0], args[1] as i32, args[2]),
        SYS_STAT => filesystem::sys_stat(vas, args[0], args[1]),
        SYS_FSTAT => filesystem::sys_fstat(vas, args[0], args[1]),
        SYS_CHDIR => filesystem::sys_chdir(vas, args[0]),
        SYS_GETCWD => filesystem::sys_getcwd(vas, args[0], args[1]),
        SYS_PIPE => filesystem::sys_pipe(vas, args[0]),
        SYS_IOCTL => filesystem::sys_ioctl(args[0], args[1], args[2]),
        SYS_POLL => filesystem::sys_poll(vas, args[0], args[1], args[2] as i32),

        SYS_FORK => process::sys_fork(frame),
        SYS_EXECVE => process::sys_execve(vas, frame, args[0], args[1], args[2]),
        SYS_EXIT => crate::process::exit::exit(args[0] as i32),
        SYS_WAIT => process::sys_wait(vas, args[0]),
        SYS_GETPID => process::sys_getpid(),

        SYS_MMAP => memory::sys_mmap(vas, args[0], args[1], args[2], args[3], args[4], args[5]),
        SYS_BRK => memory::sys_brk(vas, args[0]),

        _ => Err(KernelError::SyscallError(crate::error::SyscallError::InvalidSyscall { nr })),
    }
}
