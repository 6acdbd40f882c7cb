//! `wait()`/`waitpid()`: blocks the caller until a child
//! becomes a zombie, reaps it, and reports its exit status. The actual
//! blocking (a halt-and-wait spin, same pattern as `fs::pipe` and
//! `fs::devfs`'s tty) and reaping both live in [`crate::sched`]; this just
//! resolves "any child" into a concrete pid before calling through.

use crate::error::{KernelError, KernelResult};
use crate::sched::Pid;

/// Waits for `child` specifically. Fails with `ProcessNotFound` if `child`
/// is not a pid the calling task ever spawned or forked.
pub fn waitpid(child: Pid) -> KernelResult<(Pid, i32)> {
    let current = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    if !current.children().contains(&child) {
        return Err(KernelError::ProcessNotFound { pid: child });
    }
    let status = crate::sched::wait_for_child(child)?;
    current.remove_child(child);
    Ok((child, status))
}

/// Waits for any child to exit, picking whichever one the caller happens
/// to have registered first. Fails with `ProcessNotFound` (pid 0) if the
/// caller has no children at all.
pub fn wait_any() -> KernelResult<(Pid, i32)> {
    let current = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let children = current.children();
    let Some(&first) = children.first() else {
        return Err(KernelError::ProcessNotFound { pid: 0 });
    };
    waitpid(first)
}
