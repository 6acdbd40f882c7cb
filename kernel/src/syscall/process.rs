//! Process-facing syscalls: `fork`, `execve`, `exit`,
//! `wait`, `getpid`. Each is a thin translation from raw syscall arguments
//! (paths and `argv`/`envp` arrays living in user memory) into the
//! `process::*` entry points that do the real work.

use super::usercopy::{read_cstr, read_str_array};
use crate::arch::x86::idt::InterruptFrame;
use crate::error::{KernelError, KernelResult};
use crate::mm::vas::Vas;
use crate::process::{exec, fork, wait};

pub fn sys_fork(frame: &InterruptFrame) -> KernelResult<u32> {
    Ok(fork::fork(frame)? as u32)
}

pub fn sys_execve(vas: &Vas, frame: &mut InterruptFrame, path_ptr: u32, argv_ptr: u32, envp_ptr: u32) -> KernelResult<u32> {
    let path = read_cstr(vas, path_ptr, 4096)?;
    let argv = read_str_array(vas, argv_ptr, 256)?;
    let envp = read_str_array(vas, envp_ptr, 256)?;
    exec::execve(frame, &path, &argv, &envp)?;
    Ok(0)
}

pub fn sys_wait(vas: &Vas, statusp: u32) -> KernelResult<u32> {
    let (pid, status) = wait::wait_any()?;
    if statusp != 0 {
        super::usercopy::copy_to_user(vas, statusp, &status.to_ne_bytes())?;
    }
    Ok(pid as u32)
}

pub fn sys_getpid() -> KernelResult<u32> {
    crate::sched::current_pid().map(|p| p as u32).ok_or(KernelError::NotInitialized { subsystem: "sched" })
}
