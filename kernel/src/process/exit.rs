//! `exit()`: tears down a task's open files and hands off to
//! the scheduler, which marks it a zombie and switches away for good.
//!
//! There is no separate resource-cleanup pass here beyond closing file
//! descriptors - the task's `Vas` stays mapped until [`crate::sched`]'s
//! `reap` drops the leaked `Task`, at which point the `Vas`'s own `Drop`
//! (page tables, frames marked `FREE_ON_RELEASE`) would need to run. This
//! kernel's `Vas`/`PageDirectory` have no `Drop` impl today, so a reaped
//! task's frames are never reclaimed - an accepted leak for a
//! single-workload kernel with no long-running multi-tenant uptime
//! requirement.

/// Terminates the calling task with `status`. Never returns.
pub fn exit(status: i32) -> ! {
    if let Some(task) = crate::sched::current_task() {
        task.fd_table.close_all();
    }
    crate::sched::exit_current(status)
}
