//! Preemptive round-robin process scheduler.
//!
//! [`task`] defines the per-process descriptor; [`scheduler`] owns the
//! ready queue, the timer-driven preemption, and every context switch.
//! This module just re-exports the combined public surface the rest of
//! the kernel calls into - `irq::dispatch`'s page-fault path, the syscall
//! table, and `fs::devfs`'s `gfxbus` all go through these functions rather
//! than reaching into `scheduler` directly.

mod scheduler;
mod task;

pub use scheduler::{
    current_pid, current_task, current_vas, exit_current, fork_task, kill_current, spawn_init, spawn_user,
    timer_tick, wait_for_child, with_task_vas, yield_now,
};
pub use task::{Pid, StartKind, Task, TaskState};

pub fn init() {
    scheduler::init();
}

pub fn run() -> ! {
    scheduler::run()
}
