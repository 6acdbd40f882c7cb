//! `fork()`: duplicates the calling task into a new,
//! independent task that resumes from the same syscall trap with a
//! different return value. All the actual work - deep-cloning the address
//! space, sharing the fd table, capturing the trap frame - lives in
//! [`crate::sched::fork_task`]; this is just the syscall-facing entry
//! point and its `eax`-patching contract.

use crate::arch::x86::idt::InterruptFrame;
use crate::error::KernelResult;
use crate::sched::Pid;

/// Forks the calling task. Returns the child's pid to the parent; the
/// child's own return value is the `0` baked into its captured frame by
/// [`crate::sched::fork_task`] before it is ever scheduled.
pub fn fork(frame: &InterruptFrame) -> KernelResult<Pid> {
    crate::sched::fork_task(frame)
}
