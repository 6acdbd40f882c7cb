//! Process-facing syscall glue.
//!
//! There is no process table or thread layer here - [`crate::sched`] owns
//! every task directly. This module is the thin layer the syscall
//! dispatcher calls into: `fork`/`exit`/`wait`/`chdir`/`getcwd`/`brk` each
//! get a dedicated submodule, all of them resolving "the calling task"
//! through [`crate::sched::current_task`] rather than through any table
//! kept here.

#![allow(dead_code)]

pub mod cwd;
pub mod exec;
pub mod exit;
pub mod fork;
pub mod loader;
pub mod memory;
pub mod pcb;
pub mod wait;

pub use pcb::{Process, ProcessId, ProcessState};
