//! Kernel-internal error type and its bridge to the POSIX-style `errno`
//! surface exposed at the system-call boundary.
//!
//! `KernelError` is the currency for every fallible operation inside the
//! kernel (allocators, paging, scheduler, VFS, ext2). It carries enough
//! structure for logging and `Display`, but user-visible syscalls never
//! leak it directly: [`Errno`] is what crosses into a task's return value,
//! via the `From<KernelError> for Errno` bridge at the bottom of this file.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    OutOfMemory { requested: usize, available: usize },
    InvalidAddress { addr: usize },
    UnmappedMemory { addr: usize },

    ProcessNotFound { pid: u64 },
    InvalidState { expected: &'static str, actual: &'static str },

    SchedulerError(SchedError),
    SyscallError(SyscallError),
    FsError(FsError),

    HardwareError { device: &'static str, code: u32 },

    InvalidArgument { name: &'static str, value: &'static str },
    OperationNotSupported { operation: &'static str },
    ResourceExhausted { resource: &'static str },
    PermissionDenied { operation: &'static str },
    AlreadyExists { resource: &'static str, id: u64 },
    NotFound { resource: &'static str, id: u64 },
    Timeout { operation: &'static str, duration_ms: u64 },
    NotImplemented { feature: &'static str },
    /// Operation would block (non-blocking fd, empty/full pipe).
    WouldBlock,
    /// Broken pipe: write end closed or read end closed.
    BrokenPipe,
    /// Subsystem consulted before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// Bridge for gradual migration away from `&'static str` errors.
    LegacyError { message: &'static str },
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TaskNotFound { pid: u64 },
    QueueEmpty,
    AlreadyScheduled,
    NoRunnableTask,
}

/// System-call dispatch errors, prior to their `Errno` translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: usize },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
}

/// Filesystem-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    NotADirectory,
    NotAFile,
    IsADirectory,
    ReadOnly,
    InvalidPath,
    NoRootFs,
    AlreadyMounted,
    NotMounted,
    UnknownFsType,
    IoError,
    DirectoryNotEmpty,
    TooManyOpenFiles,
    BadFileDescriptor,
    NotSupported,
    NotASymlink,
    FileTooLarge,
    WouldBlock,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "invalid address: 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::SchedulerError(e) => write!(f, "scheduler error: {:?}", e),
            Self::SyscallError(e) => write!(f, "syscall error: {:?}", e),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code 0x{:x}", device, code)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::Timeout { operation, duration_ms } => {
                write!(f, "timeout during {}: {} ms", operation, duration_ms)
            }
            Self::NotImplemented { feature } => write!(f, "feature not implemented: {}", feature),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LegacyError { message } => write!(f, "{}", message),
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::SyscallError(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

/// Conversion from legacy `&'static str` errors, for call sites not yet
/// migrated to a specific variant.
impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

/// POSIX-aligned errno surface. This is the only error
/// representation that crosses into a task's return value; every syscall
/// handler works in `KernelResult` internally and converts once, at the
/// dispatch boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    ENOENT = 2,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EFAULT = 14,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EMFILE = 24,
    EFBIG = 27,
    ENOSYS = 38,
    EPERM = 1,
    ENOEXEC = 8,
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } | KernelError::ResourceExhausted { .. } => {
                Errno::ENOMEM
            }
            KernelError::InvalidAddress { .. } | KernelError::UnmappedMemory { .. } => {
                Errno::EFAULT
            }
            KernelError::ProcessNotFound { .. } => Errno::ENOENT,
            KernelError::PermissionDenied { .. } => Errno::EPERM,
            KernelError::AlreadyExists { .. } => Errno::EEXIST,
            KernelError::NotFound { .. } => Errno::ENOENT,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::BrokenPipe => Errno::EFAULT,
            KernelError::OperationNotSupported { .. } | KernelError::NotImplemented { .. } => {
                Errno::ENOSYS
            }
            KernelError::SyscallError(SyscallError::InvalidSyscall { .. }) => Errno::ENOSYS,
            KernelError::SyscallError(SyscallError::InvalidPointer { .. }) => Errno::EFAULT,
            KernelError::SyscallError(_) => Errno::EINVAL,
            KernelError::SchedulerError(_) => Errno::EINVAL,
            KernelError::FsError(fs) => match fs {
                FsError::NotFound => Errno::ENOENT,
                FsError::AlreadyExists => Errno::EEXIST,
                FsError::PermissionDenied | FsError::ReadOnly => Errno::EPERM,
                FsError::NotADirectory => Errno::ENOTDIR,
                FsError::IsADirectory => Errno::EISDIR,
                FsError::NotAFile => Errno::EINVAL,
                FsError::InvalidPath => Errno::EINVAL,
                FsError::NoRootFs | FsError::NotMounted => Errno::ENOENT,
                FsError::AlreadyMounted => Errno::EEXIST,
                FsError::UnknownFsType => Errno::EINVAL,
                FsError::IoError => Errno::EFAULT,
                FsError::DirectoryNotEmpty => Errno::EINVAL,
                FsError::TooManyOpenFiles => Errno::EMFILE,
                FsError::BadFileDescriptor => Errno::EBADF,
                FsError::NotSupported | FsError::NotASymlink => Errno::ENOSYS,
                FsError::FileTooLarge => Errno::EFBIG,
                FsError::WouldBlock => Errno::EAGAIN,
            },
            _ => Errno::EINVAL,
        }
    }
}

impl Errno {
    pub fn as_negative(self) -> isize {
        -(self as i32 as isize)
    }
}

/// Convenience constructor macro, kept from the original error module so
/// call sites that built `KernelError::Variant { .. }` via the macro don't
/// need touching up one at a time.
#[macro_export]
macro_rules! kernel_error {
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::OutOfMemory {
            requested: $req,
            available: $avail,
        }
    };
    (ProcessNotFound { pid: $pid:expr }) => {
        $crate::error::KernelError::ProcessNotFound { pid: $pid }
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
