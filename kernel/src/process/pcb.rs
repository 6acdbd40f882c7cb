//! Process control block.
//!
//! There is no separate PCB struct here: [`crate::sched::Task`] already
//! carries everything a process needs (address space, fd table, cwd,
//! program break, parent/child links) since this kernel has no
//! thread/process split to layer a PCB underneath. This module just
//! re-exports it under the vocabulary the rest of `process::*` and the
//! syscall layer use.

pub use crate::sched::{Pid as ProcessId, Task as Process, TaskState as ProcessState};
