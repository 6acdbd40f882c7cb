//! Task descriptor: the kernel's per-process bookkeeping.
//!
//! There is no thread/process split here - the spec's fork/exec model is
//! one schedulable unit per [`Task`], carrying its own address space, fd
//! table, and kernel stack. Single CPU, so there is no affinity, priority
//! class, or per-core run queue to track; every `Task` is interchangeable
//! to the scheduler except for what it's doing right now.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::x86::context::{bootstrap_stack, Context};
use crate::arch::x86::idt::InterruptFrame;
use crate::fs::file::FdTable;
use crate::mm::vas::Vas;

pub type Pid = u64;

/// Per-task kernel stack size. Generous relative to the shallow call depth
/// syscall handlers and the page-fault path actually reach - there is no
/// recursion of consequence anywhere on this path.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Blocked on a wait-for-child; woken by `process::wait` reaping a
    /// zombie. Blocking I/O (pipes, tty, synthetic files) does not use
    /// this state - those suspend via the halt-and-wait loops described in
    /// `fs::pipe` and `fs::devfs`, not by leaving the ready queue.
    BlockedOnChild,
    /// Exited with the given status; stays in the task table until a
    /// `wait` call reaps it.
    Zombie(i32),
}

/// What a brand new task's bootstrapped context should do the first time
/// the scheduler switches into it.
pub enum StartKind {
    /// Fresh `exec`: jump to `entry` on `user_stack`.
    Fresh { entry: u32, user_stack: u32 },
    /// Forked child: resume a captured copy of the parent's trap frame
    /// (`eax` already patched to 0 by the caller).
    Forked(Box<InterruptFrame>),
}

pub struct Task {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    state: Mutex<TaskState>,
    context: UnsafeCell<Context>,
    start: Mutex<Option<StartKind>>,
    // Box<[u8; N]> so the stack's address is stable for the life of the
    // task; a Vec could reallocate and invalidate esp mid-flight.
    kernel_stack: Box<[u8; KERNEL_STACK_SIZE]>,
    pub vas: Vas,
    pub fd_table: FdTable,
    cwd: Mutex<String>,
    pub uid: u32,
    pub gid: u32,
    program_break: AtomicUsize,
    children: Mutex<Vec<Pid>>,
    /// The syscall ABI's per-task errno cell: set by the
    /// dispatcher whenever a handler returns `Err`, read back by whatever
    /// C-library stub a user binary links against.
    errno: AtomicI32,
}

// SAFETY: `context` and `start` are only ever touched by the scheduler,
// which runs exactly one task at a time on this kernel's single CPU and
// only mutates them with interrupts disabled across a switch. No two
// references to the same Task's interior cells are ever live
// concurrently.
unsafe impl Sync for Task {}

impl Task {
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn set_state(&self, s: TaskState) {
        *self.state.lock() = s;
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, path: String) {
        *self.cwd.lock() = path;
    }

    pub fn program_break(&self) -> usize {
        self.program_break.load(Ordering::Relaxed)
    }

    pub fn set_program_break(&self, value: usize) {
        self.program_break.store(value, Ordering::Relaxed);
    }

    pub fn add_child(&self, pid: Pid) {
        self.children.lock().push(pid);
    }

    pub fn remove_child(&self, pid: Pid) {
        self.children.lock().retain(|&p| p != pid);
    }

    pub fn children(&self) -> Vec<Pid> {
        self.children.lock().clone()
    }

    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Relaxed)
    }

    pub fn set_errno(&self, value: i32) {
        self.errno.store(value, Ordering::Relaxed);
    }

    /// # Safety
    /// Caller (the scheduler, exclusively) must not alias this pointer
    /// across two tasks running "simultaneously" - single CPU means there
    /// is only ever one live borrow at a time in practice.
    pub fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.as_ptr() as usize + KERNEL_STACK_SIZE
    }

    /// Takes the task's start action, consuming it. A task is only ever
    /// started once, the first time the scheduler switches into it; after
    /// that its context resumes from wherever the last `switch_to` or
    /// interrupt left it.
    pub fn take_start(&self) -> Option<StartKind> {
        self.start.lock().take()
    }

    fn new(pid: Pid, parent: Pid, name: String, vas: Vas, fd_table: FdTable, cwd: String, start: StartKind) -> Box<Task> {
        let kernel_stack = Box::new([0u8; KERNEL_STACK_SIZE]);
        let stack_top = kernel_stack.as_ptr() as usize + KERNEL_STACK_SIZE;
        // SAFETY: stack_top is the top of the kernel_stack allocated on
        // the line above, which this Task exclusively owns for its
        // lifetime, and entry_trampoline never returns.
        let context = unsafe { bootstrap_stack(stack_top, entry_trampoline) };
        Box::new(Task {
            pid,
            parent,
            name,
            state: Mutex::new(TaskState::Ready),
            context: UnsafeCell::new(context),
            start: Mutex::new(Some(start)),
            kernel_stack,
            vas,
            fd_table,
            cwd: Mutex::new(cwd),
            uid: 0,
            gid: 0,
            program_break: AtomicUsize::new(0),
            children: Mutex::new(Vec::new()),
            errno: AtomicI32::new(0),
        })
    }

    /// Builds a task that starts by trampolining straight into a freshly
    /// loaded ELF image - the init task, or any other `execve` target.
    pub fn new_fresh(pid: Pid, parent: Pid, name: String, vas: Vas, entry: u32, user_stack: u32) -> Box<Task> {
        Self::new(pid, parent, name, vas, FdTable::new(), String::from("/"), StartKind::Fresh { entry, user_stack })
    }

    /// Builds a forked child: a deep-cloned address space and shared fd
    /// table it inherited from the parent, and a captured parent trap
    /// frame to resume from.
    pub fn new_forked(
        pid: Pid,
        parent: Pid,
        name: String,
        vas: Vas,
        fd_table: FdTable,
        cwd: String,
        frame: InterruptFrame,
    ) -> Box<Task> {
        Self::new(pid, parent, name, vas, fd_table, cwd, StartKind::Forked(Box::new(frame)))
    }
}

/// The landing pad every new task's bootstrapped context returns into on
/// its first switch-in. Declared here since it is what [`bootstrap_stack`]
/// points at; its body just hands off to the scheduler, which is the only
/// thing that knows which task "current" actually is right now.
extern "C" fn entry_trampoline() -> ! {
    super::scheduler::enter_current_task()
}
