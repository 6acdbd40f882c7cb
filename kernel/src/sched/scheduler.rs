//! Preemptive round-robin scheduler.
//!
//! Single ready queue, no priorities: every task gets an equal timer-tick
//! quantum, and the timer IRQ is the only preemption point. A task can
//! also leave the CPU voluntarily - blocking on a child via `wait`, or the
//! halt-and-wait suspension points in blocking I/O (`fs::pipe`,
//! `fs::devfs`'s tty) - without ever touching this module, since those
//! just spin on `hlt` with interrupts enabled until the next tick gives
//! something else a turn.

#![allow(dead_code, static_mut_refs)]

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use super::task::{Pid, StartKind, Task, TaskState};
use crate::arch::x86::context::{switch_to, Context};
use crate::arch::x86::gdt;
use crate::arch::x86::idt::InterruptFrame;
use crate::arch::x86::usermode::{enter_usermode, resume_from_frame};
use crate::error::{KernelError, KernelResult};
use crate::mm::vas::Vas;

// Timer ticks a task runs before being preempted in favour of the next
// ready task. The timer's interval is configured in `arch::x86::timer`;
// this is purely a tick count, not wall-clock time.
use crate::config::TICKS_PER_QUANTUM;

struct SchedulerState {
    tasks: BTreeMap<Pid, &'static Task>,
    ready: VecDeque<Pid>,
}

impl SchedulerState {
    const fn new() -> Self {
        Self { tasks: BTreeMap::new(), ready: VecDeque::new() }
    }
}

static STATE: Mutex<SchedulerState> = Mutex::new(SchedulerState::new());
static CURRENT: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());
static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static QUANTUM_REMAINING: AtomicU32 = AtomicU32::new(TICKS_PER_QUANTUM);

/// Throwaway `from` half of a `switch_to` whose caller never expects to be
/// resumed: killing the current task, or the first switch off the boot
/// stack, which nothing ever switches back into.
static mut DISCARD_CONTEXT: Context = Context { ebx: 0, esi: 0, edi: 0, ebp: 0, esp: 0 };

pub fn init() {
    println!("[sched] round-robin scheduler ready, quantum = {TICKS_PER_QUANTUM} ticks");
}

fn next_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

fn current_task_ptr() -> *mut Task {
    CURRENT.load(Ordering::Acquire)
}

pub fn current_pid() -> Option<Pid> {
    let ptr = current_task_ptr();
    if ptr.is_null() {
        None
    } else {
        // SAFETY: non-null only while CURRENT points at a task this
        // scheduler leaked and has not yet reaped.
        Some(unsafe { &*ptr }.pid)
    }
}

pub fn current_task() -> Option<&'static Task> {
    let ptr = current_task_ptr();
    if ptr.is_null() {
        None
    } else {
        // SAFETY: see current_pid.
        Some(unsafe { &*ptr })
    }
}

pub fn current_vas() -> Option<&'static Vas> {
    current_task().map(|t| &t.vas)
}

pub fn with_task_vas<R>(pid: Pid, f: impl FnOnce(&Vas) -> R) -> Option<R> {
    let task = STATE.lock().tasks.get(&pid).copied()?;
    Some(f(&task.vas))
}

/// Registers a freshly built task and marks it ready. `task` is leaked
/// deliberately: the scheduler keeps a `'static` pointer to it for as long
/// as the pid is alive in the task table, and [`reap`] is the only place
/// that ever reclaims the allocation.
fn register(task: Box<Task>) -> &'static Task {
    let leaked: &'static Task = Box::leak(task);
    let mut state = STATE.lock();
    state.tasks.insert(leaked.pid, leaked);
    state.ready.push_back(leaked.pid);
    leaked
}

/// Spawns the first task from a loaded ELF image. Called once, from
/// `kernel_entry`, before [`run`] hands the boot stack over to the
/// scheduler for good.
pub fn spawn_init(vas: Vas, entry: u32, user_stack: u32) -> Pid {
    let pid = next_pid();
    register(Task::new_fresh(pid, 0, String::from("init"), vas, entry, user_stack));
    pid
}

/// Spawns a task from an already-loaded address space and entry point,
/// used by `execve`'s "keep the caller's pid" variant... spawn_init covers
/// the only case this kernel needs today (there is no re-exec of a
/// running task's own pid; `execve` is implemented as tearing down and
/// rebuilding the calling task's Vas in place, not via this path).
pub fn spawn_user(name: String, parent: Pid, vas: Vas, entry: u32, user_stack: u32) -> Pid {
    let pid = next_pid();
    register(Task::new_fresh(pid, parent, name, vas, entry, user_stack));
    pid
}

/// Implements `fork()`: deep-clones the caller's address space, shares its
/// fd table, and captures `frame` (already patched so the child observes
/// a zero return value) as the point the child resumes from.
pub fn fork_task(frame: &InterruptFrame) -> KernelResult<Pid> {
    let parent = current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let child_vas = parent.vas.deep_clone()?;
    let child_fds = parent.fd_table.clone_for_fork();
    let pid = next_pid();
    let mut child_frame = *frame;
    child_frame.eax = 0;
    let task = Task::new_forked(pid, parent.pid, parent.name.clone(), child_vas, child_fds, parent.cwd(), child_frame);
    task.set_program_break(parent.program_break());
    register(task);
    parent.add_child(pid);
    Ok(pid)
}

/// Installs `next` as the running task and jumps to it, discarding
/// whatever was running before (used for kill/exit, where the caller never
/// returns to its own stack).
fn switch_into(next: &'static Task) -> ! {
    crate::irq::clear_dispatch_guard();
    next.set_state(TaskState::Running);
    // SAFETY: interrupts are disabled by every caller of this function
    // before it runs (it never returns, so there is no "reenable on the
    // way out" to forget).
    unsafe {
        gdt::set_kernel_stack(next.kernel_stack_top() as u32);
    }
    CURRENT.store(next as *const Task as *mut Task, Ordering::Release);
    QUANTUM_REMAINING.store(TICKS_PER_QUANTUM, Ordering::Relaxed);
    // SAFETY: DISCARD_CONTEXT is never read back from - this is purely a
    // valid, writable Context for switch_to's `from` half to scribble on.
    unsafe {
        switch_to(core::ptr::addr_of_mut!(DISCARD_CONTEXT), next.context_ptr());
    }
    unreachable!("switch_into's task resumed into a context nobody holds");
}

/// Switches from the currently running task into `next`, saving the
/// former's context so a later switch can resume it.
fn switch_between(prev: &'static Task, next: &'static Task) {
    crate::irq::clear_dispatch_guard();
    next.set_state(TaskState::Running);
    // SAFETY: called with interrupts disabled (every caller wraps this in
    // `without_interrupts` or runs from within the timer IRQ, which has
    // interrupts off until the matching iretd).
    unsafe {
        gdt::set_kernel_stack(next.kernel_stack_top() as u32);
    }
    CURRENT.store(next as *const Task as *mut Task, Ordering::Release);
    QUANTUM_REMAINING.store(TICKS_PER_QUANTUM, Ordering::Relaxed);
    // SAFETY: prev and next are distinct, live tasks in the task table;
    // prev's context is only read/written by this switch while it is not
    // the running task, which this function's caller guarantees.
    unsafe {
        switch_to(prev.context_ptr(), next.context_ptr());
    }
}

/// Picks the next ready pid in round-robin order, re-enqueuing `current`
/// (if given and still runnable) at the back first.
fn pick_next(requeue_current: Option<Pid>) -> Option<Pid> {
    let mut state = STATE.lock();
    if let Some(pid) = requeue_current {
        state.ready.push_back(pid);
    }
    state.ready.pop_front()
}

/// Voluntarily gives up the remainder of the current quantum. Used by
/// syscalls that want to be cooperative (e.g. a task that just forked)
/// without waiting for the timer.
pub fn yield_now() {
    crate::arch::x86::without_interrupts(|| {
        let Some(prev) = current_task() else { return };
        prev.set_state(TaskState::Ready);
        let Some(next_pid) = pick_next(Some(prev.pid)) else { return };
        let Some(next) = STATE.lock().tasks.get(&next_pid).copied() else { return };
        if next.pid != prev.pid {
            switch_between(prev, next);
        }
    });
}

/// Called from the timer IRQ handler on every tick. Decrements
/// the running task's quantum and preempts it once exhausted.
pub fn timer_tick() {
    if current_task_ptr().is_null() {
        return;
    }
    if QUANTUM_REMAINING.fetch_sub(1, Ordering::Relaxed) > 1 {
        return;
    }
    yield_now();
}

/// Blocks the current task until `child` exits, then reaps it and returns
/// its exit status. Spins on `hlt` between checks, per the concurrency
/// model's halt-and-wait suspension points - the alternative, a dedicated
/// wait-queue wakeup, would need a second scheduler state transition this
/// design doesn't otherwise require.
pub fn wait_for_child(child: Pid) -> KernelResult<i32> {
    loop {
        let zombie_status = STATE.lock().tasks.get(&child).map(|t| t.state());
        match zombie_status {
            Some(TaskState::Zombie(status)) => {
                reap(child);
                return Ok(status);
            }
            None => return Err(KernelError::ProcessNotFound { pid: child }),
            _ => {
                crate::arch::x86::enable_interrupts();
                crate::arch::x86::halt();
            }
        }
    }
}

/// Removes a zombie task from the task table and reclaims its `Box`. Only
/// valid once the task is confirmed `Zombie` and nothing still holds a
/// `'static` reference to it - `current_task`/`current_vas` never return
/// one after the pid stops running, and the only other holder, the
/// scheduler's own `tasks` map, is what this function removes it from.
fn reap(pid: Pid) {
    let leaked = STATE.lock().tasks.remove(&pid);
    if let Some(task) = leaked {
        // SAFETY: `task` was produced by `Box::leak` in `register` and is
        // being removed from the only table that could hand out another
        // reference to it; its state is confirmed `Zombie`, meaning it is
        // not `CURRENT` and will never be switched into again.
        unsafe {
            drop(Box::from_raw(task as *const Task as *mut Task));
        }
    }
}

/// Marks the current task exited with `status` and switches away for
/// good. Never returns.
///
/// Orphaned children (a task that exits with children still running) are
/// not reparented to init; they stay addressed at their original parent's
/// pid and are reaped the next time anything calls `wait` on that pid,
/// same as before the parent exited. A real orphan-reaping pass is not
/// implemented.
pub fn exit_current(status: i32) -> ! {
    crate::arch::x86::without_interrupts(|| {
        let current = current_task().expect("sched: exit_current with no running task");
        current.set_state(TaskState::Zombie(status));
        let Some(next_pid) = pick_next(None) else {
            panic!("sched: no runnable task left after pid {} exited", current.pid);
        };
        let next = STATE.lock().tasks.get(&next_pid).copied().expect("sched: ready pid vanished from task table");
        switch_into(next);
    })
}

/// Kills the current task with `status`, used by fault handlers (an
/// unrecoverable page fault) rather than a voluntary `exit` syscall.
pub fn kill_current(status: i32) -> ! {
    exit_current(status)
}

/// The landing pad every task's bootstrapped context trampolines into on
/// its first switch-in (see [`super::task::entry_trampoline`]). Loads the
/// task's address space and jumps into user mode via whichever
/// [`StartKind`] it was built with.
pub fn enter_current_task() -> ! {
    let task = current_task().expect("sched: entry trampoline with no current task");
    task.vas.switch_to();
    match task.take_start() {
        // SAFETY: entry/user_stack were validated by the ELF loader and
        // the stack allocator before this task was registered; the vas
        // switch above just installed the address space they live in.
        Some(StartKind::Fresh { entry, user_stack }) => unsafe { enter_usermode(entry, user_stack) },
        // SAFETY: frame is a captured, valid copy of the parent's trap
        // frame at the moment of `fork`, in the address space just
        // switched to.
        Some(StartKind::Forked(frame)) => unsafe { resume_from_frame(&frame) },
        None => panic!("sched: task {} entered twice", task.pid),
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;

    fn seeded_allocator() {
        crate::mm::FRAME_ALLOCATOR.init(16 * 1024 * 1024, |mark_free| mark_free(0, 16 * 1024 * 1024));
    }

    #[test_case]
    fn round_robin_never_starves_a_ready_task() {
        // Pure ready-queue mechanics, no real task objects or context
        // switching involved: seed the queue directly and drive pick_next
        // the way timer_tick/yield_now do.
        {
            let mut state = STATE.lock();
            state.ready.clear();
            state.ready.push_back(1);
            state.ready.push_back(2);
            state.ready.push_back(3);
        }

        let mut seen = alloc::vec::Vec::new();
        let mut current = pick_next(None);
        for _ in 0..6 {
            let pid = current.expect("ready queue should never run dry with 3 tasks cycling");
            seen.push(pid);
            current = pick_next(Some(pid));
        }

        // Every one of the three pids must appear at least twice across six
        // dispatches: round-robin guarantees no starvation.
        for pid in [1u64, 2, 3] {
            assert!(seen.iter().filter(|&&p| p == pid).count() >= 2, "pid {pid} starved: {seen:?}");
        }

        STATE.lock().ready.clear();
    }

    #[test_case]
    fn fork_gives_parent_the_child_pid_and_zeroes_the_childs_return_value() {
        seeded_allocator();
        let parent_vas = crate::mm::vas::new_user_context().expect("a freshly seeded allocator must have room for one context");
        let parent = Task::new_fresh(100, 0, String::from("parent"), parent_vas, 0, 0);
        let parent: &'static Task = Box::leak(parent);
        STATE.lock().tasks.insert(parent.pid, parent);
        CURRENT.store(parent as *const Task as *mut Task, Ordering::Release);

        let mut frame = InterruptFrame::default();
        frame.eax = 0xDEAD_BEEF; // parent's own eax at the point of the syscall trap

        let child_pid = fork_task(&frame).expect("fork should succeed against a freshly seeded allocator");
        assert_ne!(child_pid, parent.pid);
        assert!(parent.children().contains(&child_pid));

        let child = STATE.lock().tasks.get(&child_pid).copied().expect("forked child must be registered");
        match child.take_start() {
            Some(StartKind::Forked(captured)) => assert_eq!(captured.eax, 0, "child must observe a zero fork() return value"),
            Some(StartKind::Fresh { .. }) => panic!("forked child should capture a trap frame, not a fresh entry point"),
            None => panic!("forked child's start action should not already be consumed"),
        }

        let mut state = STATE.lock();
        state.tasks.remove(&parent.pid);
        state.tasks.remove(&child_pid);
        state.ready.retain(|&p| p != child_pid);
        drop(state);
        CURRENT.store(core::ptr::null_mut(), Ordering::Release);
    }
}

/// Hands the boot stack over to the scheduler for good. Waits for the
/// first task (spawned by `kernel_entry` via [`spawn_init`]) to appear in
/// the ready queue, then switches into it - that switch never returns,
/// since `DISCARD_CONTEXT` is never referenced again.
pub fn run() -> ! {
    loop {
        if let Some(pid) = pick_next(None) {
            let task = STATE.lock().tasks.get(&pid).copied().expect("sched: ready pid vanished from task table");
            switch_into(task);
        }
        crate::arch::x86::enable_interrupts();
        crate::arch::x86::halt();
    }
}
