//! Filesystem-facing syscalls: `read`, `write`, `open`,
//! `close`, `seek`, `stat`, `fstat`, `chdir`, `getcwd`, `pipe`, `ioctl`,
//! `poll`. Each resolves fd/path arguments against the calling task's own
//! `fd_table`/`cwd` and copies in/out through [`super::usercopy`].

use alloc::sync::Arc;

use super::usercopy::{copy_from_user, copy_to_user, read_cstr};
use crate::error::{KernelError, KernelResult};
use crate::fs::file::{Fd, OpenFile, SeekFrom};
use crate::fs::{self, pipe, Metadata, NodeKind, OpenFlags};
use crate::mm::vas::Vas;
use crate::process::cwd;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFLNK: u32 = 0o120000;
const S_IFIFO: u32 = 0o010000;

#[repr(C)]
struct StatBuf {
    st_ino: u64,
    st_mode: u32,
    st_nlink: u32,
    st_size: u64,
}

fn encode_mode(meta: &Metadata) -> u32 {
    let kind_bits = match meta.kind {
        NodeKind::File => S_IFREG,
        NodeKind::Directory => S_IFDIR,
        NodeKind::CharDevice => S_IFCHR,
        NodeKind::BlockDevice => S_IFBLK,
        NodeKind::Symlink => S_IFLNK,
        NodeKind::Fifo => S_IFIFO,
    };
    (kind_bits & S_IFMT) | (meta.mode as u32 & !S_IFMT)
}

fn current_task_fds() -> KernelResult<&'static crate::fs::file::FdTable> {
    crate::sched::current_task().map(|t| &t.fd_table).ok_or(KernelError::NotInitialized { subsystem: "sched" })
}

fn current_open_file(fd: Fd) -> KernelResult<Arc<OpenFile>> {
    current_task_fds()?.get(fd).ok_or(KernelError::InvalidArgument { name: "fd", value: "not open" })
}

fn write_stat(vas: &Vas, user_buf: u32, meta: &Metadata) -> KernelResult<()> {
    let stat = StatBuf { st_ino: meta.inode, st_mode: encode_mode(meta), st_nlink: meta.links, st_size: meta.size };
    // SAFETY: StatBuf is repr(C) and plain old data; this just reinterprets
    // it as the byte slice `copy_to_user` wants.
    let bytes = unsafe {
        core::slice::from_raw_parts((&stat as *const StatBuf) as *const u8, core::mem::size_of::<StatBuf>())
    };
    copy_to_user(vas, user_buf, bytes)
}

pub fn sys_read(vas: &Vas, fd: u32, user_buf: u32, count: u32) -> KernelResult<u32> {
    let file = current_open_file(fd as Fd)?;
    let mut kbuf = alloc::vec![0u8; count as usize];
    let n = file.read(&mut kbuf)?;
    copy_to_user(vas, user_buf, &kbuf[..n])?;
    Ok(n as u32)
}

pub fn sys_write(vas: &Vas, fd: u32, user_buf: u32, count: u32) -> KernelResult<u32> {
    let file = current_open_file(fd as Fd)?;
    let mut kbuf = alloc::vec![0u8; count as usize];
    copy_from_user(vas, user_buf, &mut kbuf)?;
    let n = file.write(&kbuf)?;
    Ok(n as u32)
}

pub fn sys_open(vas: &Vas, path_ptr: u32, flags: u32, _mode: u32) -> KernelResult<u32> {
    let raw = read_cstr(vas, path_ptr, 4096)?;
    let task = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let path = cwd::resolve(&task.cwd(), &raw);
    let open_flags = OpenFlags::from_bits(flags);
    let node = fs::open(&path, open_flags)?;
    let fd = task.fd_table.insert(OpenFile::new(node, open_flags), false)?;
    Ok(fd as u32)
}

pub fn sys_close(fd: u32) -> KernelResult<u32> {
    current_task_fds()?.close(fd as Fd)?;
    Ok(0)
}

pub fn sys_seek(fd: u32, offset: i32, whence: u32) -> KernelResult<u32> {
    let file = current_open_file(fd as Fd)?;
    let from = match whence {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset as i64),
        2 => SeekFrom::End(offset as i64),
        _ => return Err(KernelError::InvalidArgument { name: "whence", value: "out of range" }),
    };
    Ok(file.seek(from)? as u32)
}

pub fn sys_stat(vas: &Vas, path_ptr: u32, statbuf_ptr: u32) -> KernelResult<u32> {
    let raw = read_cstr(vas, path_ptr, 4096)?;
    let task = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let path = cwd::resolve(&task.cwd(), &raw);
    let meta = fs::stat(&path)?;
    write_stat(vas, statbuf_ptr, &meta)?;
    Ok(0)
}

pub fn sys_fstat(vas: &Vas, fd: u32, statbuf_ptr: u32) -> KernelResult<u32> {
    let file = current_open_file(fd as Fd)?;
    let meta = file.node.metadata()?;
    write_stat(vas, statbuf_ptr, &meta)?;
    Ok(0)
}

pub fn sys_chdir(vas: &Vas, path_ptr: u32) -> KernelResult<u32> {
    let path = read_cstr(vas, path_ptr, 4096)?;
    cwd::chdir(&path)?;
    Ok(0)
}

pub fn sys_getcwd(vas: &Vas, user_buf: u32, size: u32) -> KernelResult<u32> {
    let path = cwd::getcwd()?;
    if path.len() + 1 > size as usize {
        return Err(KernelError::InvalidArgument { name: "size", value: "buffer too small" });
    }
    let mut bytes = alloc::vec::Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    copy_to_user(vas, user_buf, &bytes)?;
    Ok(path.len() as u32)
}

pub fn sys_pipe(vas: &Vas, fds_ptr: u32) -> KernelResult<u32> {
    let (reader, writer) = pipe::create_pipe()?;
    let task = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let read_fd = task.fd_table.insert(OpenFile::new(Arc::new(reader), OpenFlags::read_only()), false)?;
    let write_flags = OpenFlags { write: true, ..Default::default() };
    let write_fd = task.fd_table.insert(OpenFile::new(Arc::new(writer), write_flags), false)?;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(read_fd as u32).to_ne_bytes());
    out[4..8].copy_from_slice(&(write_fd as u32).to_ne_bytes());
    copy_to_user(vas, fds_ptr, &out)?;
    Ok(0)
}

pub fn sys_ioctl(fd: u32, request: u32, arg: u32) -> KernelResult<u32> {
    let file = current_open_file(fd as Fd)?;
    Ok(file.node.ioctl(request, arg as usize)? as u32)
}

/// `poll(fds, n, timeout)`: a single halt-and-wait loop over every polled
/// fd, matching the blocking-I/O suspension convention used by pipes and
/// the tty. `timeout` in milliseconds; `-1` waits forever.
pub fn sys_poll(vas: &Vas, fds_ptr: u32, nfds: u32, timeout_ms: i32) -> KernelResult<u32> {
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct PollFd {
        fd: i32,
        events: i16,
        revents: i16,
    }

    const POLLIN: i16 = 0x0001;
    const POLLOUT: i16 = 0x0004;

    let mut entries = alloc::vec![PollFd { fd: -1, events: 0, revents: 0 }; nfds as usize];
    {
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(entries.as_mut_ptr() as *mut u8, entries.len() * core::mem::size_of::<PollFd>())
        };
        copy_from_user(vas, fds_ptr, bytes)?;
    }

    let deadline = if timeout_ms < 0 { None } else { Some(crate::arch::x86::timer::get_ticks() + timeout_ms as u64) };

    loop {
        let mut ready = 0;
        for entry in entries.iter_mut() {
            entry.revents = 0;
            let Ok(file) = current_open_file(entry.fd as Fd) else {
                continue;
            };
            let poll = file.node.poll();
            if poll.readable && entry.events & POLLIN != 0 {
                entry.revents |= POLLIN;
            }
            if poll.writable && entry.events & POLLOUT != 0 {
                entry.revents |= POLLOUT;
            }
            if entry.revents != 0 {
                ready += 1;
            }
        }
        if ready > 0 {
            break;
        }
        if let Some(deadline) = deadline {
            if crate::arch::x86::timer::get_ticks() >= deadline {
                break;
            }
        }
        crate::arch::x86::enable_interrupts();
        crate::arch::x86::halt();
    }

    let bytes = unsafe {
        core::slice::from_raw_parts(entries.as_ptr() as *const u8, entries.len() * core::mem::size_of::<PollFd>())
    };
    copy_to_user(vas, fds_ptr, bytes)?;
    Ok(entries.iter().filter(|e| e.revents != 0).count() as u32)
}
