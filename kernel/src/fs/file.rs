//! File descriptors: the table a task keeps to map small integers onto
//! open files, and the `OpenFlags` ABI those files were opened with.
//!
//! There is no long-lived `VfsNode` handle here - the filesystem layer
//! hands back `Arc<dyn FileOps>` on open, and this table's job is purely
//! bookkeeping: which fd maps to which handle, the flags it was opened
//! with, its current seek offset, and close-on-exec.

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use super::FileOps;
use crate::error::{FsError, KernelError, KernelResult};

pub type Fd = usize;

pub const STDIN: Fd = 0;
pub const STDOUT: Fd = 1;
pub const STDERR: Fd = 2;

use crate::config::MAX_OPEN_FILES as MAX_FILES;

/// Open flags, decoded from the raw `open(2)` bitmask a task passes at the
/// syscall boundary. Values must match `<veridian/fcntl.h>` in the
/// sysroot - that is the ABI contract user-space programs are compiled
/// against.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self { read: true, ..Default::default() }
    }

    pub fn write_only() -> Self {
        Self { write: true, create: true, truncate: true, ..Default::default() }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, create: true, ..Default::default() }
    }

    /// Decodes a raw `open(2)` flags word.
    pub fn from_bits(bits: u32) -> Self {
        const O_RDONLY: u32 = 0x0001;
        const O_WRONLY: u32 = 0x0002;
        const O_RDWR: u32 = 0x0003;
        const O_ACCMODE: u32 = 0x0003;
        const O_CREAT: u32 = 0x0100;
        const O_TRUNC: u32 = 0x0200;
        const O_APPEND: u32 = 0x0400;
        const O_EXCL: u32 = 0x0800;

        let access_mode = bits & O_ACCMODE;
        Self {
            read: access_mode == O_RDONLY || access_mode == O_RDWR,
            write: access_mode == O_WRONLY || access_mode == O_RDWR,
            append: bits & O_APPEND != 0,
            create: bits & O_CREAT != 0,
            truncate: bits & O_TRUNC != 0,
            exclusive: bits & O_EXCL != 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// One open file: the backing handle, the flags it was opened with, and
/// the seek offset shared by every fd that refers to it (dup'd fds move
/// the offset together, as POSIX requires).
pub struct OpenFile {
    pub node: Arc<dyn FileOps>,
    pub flags: OpenFlags,
    position: Mutex<u64>,
}

impl OpenFile {
    pub fn new(node: Arc<dyn FileOps>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self { node, flags, position: Mutex::new(0) })
    }

    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.read {
            return Err(KernelError::PermissionDenied { operation: "read on a write-only fd" });
        }
        let mut pos = self.position.lock();
        let n = self.node.read(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if !self.flags.write {
            return Err(KernelError::PermissionDenied { operation: "write on a read-only fd" });
        }
        let mut pos = self.position.lock();
        if self.flags.append {
            *pos = self.node.metadata()?.size;
        }
        let n = self.node.write(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn seek(&self, from: SeekFrom) -> KernelResult<u64> {
        let mut pos = self.position.lock();
        let new_pos = match from {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(offset) => add_signed(*pos, offset)?,
            SeekFrom::End(offset) => add_signed(self.node.metadata()?.size, offset)?,
        };
        *pos = new_pos;
        Ok(new_pos)
    }

    pub fn tell(&self) -> u64 {
        *self.position.lock()
    }
}

fn add_signed(base: u64, offset: i64) -> KernelResult<u64> {
    if offset < 0 {
        base.checked_sub((-offset) as u64)
    } else {
        base.checked_add(offset as u64)
    }
    .ok_or(KernelError::InvalidArgument { name: "offset", value: "seek out of range" })
}

struct Entry {
    file: Arc<OpenFile>,
    cloexec: bool,
}

/// A task's open-file table. Slots 0-2 start reserved for stdin/stdout/
/// stderr, wired up by whoever spawns the task (the init task's console,
/// or inherited from a parent on fork).
pub struct FdTable {
    files: Mutex<Vec<Option<Entry>>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        let mut files = Vec::with_capacity(8);
        files.push(None);
        files.push(None);
        files.push(None);
        Self { files: Mutex::new(files) }
    }

    pub fn insert(&self, file: Arc<OpenFile>, cloexec: bool) -> KernelResult<Fd> {
        let mut files = self.files.lock();
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Entry { file, cloexec });
                return Ok(fd);
            }
        }
        if files.len() >= MAX_FILES {
            return Err(FsError::TooManyOpenFiles.into());
        }
        files.push(Some(Entry { file, cloexec }));
        Ok(files.len() - 1)
    }

    /// Inserts `file` at exactly `fd`, growing the table and closing
    /// whatever was previously there. Used by `dup2`/`dup3` and by a
    /// shell setting up a child's stdio before `execve`.
    pub fn insert_at(&self, fd: Fd, file: Arc<OpenFile>, cloexec: bool) -> KernelResult<()> {
        if fd >= MAX_FILES {
            return Err(FsError::TooManyOpenFiles.into());
        }
        let mut files = self.files.lock();
        while files.len() <= fd {
            files.push(None);
        }
        files[fd] = Some(Entry { file, cloexec });
        Ok(())
    }

    pub fn get(&self, fd: Fd) -> Option<Arc<OpenFile>> {
        self.files.lock().get(fd)?.as_ref().map(|e| e.file.clone())
    }

    pub fn close(&self, fd: Fd) -> KernelResult<()> {
        let mut files = self.files.lock();
        let slot = files.get_mut(fd).ok_or(FsError::BadFileDescriptor)?;
        slot.take().ok_or(FsError::BadFileDescriptor)?;
        Ok(())
    }

    pub fn dup(&self, fd: Fd) -> KernelResult<Fd> {
        let file = self.get(fd).ok_or(FsError::BadFileDescriptor)?;
        self.insert(file, false)
    }

    pub fn dup2(&self, old_fd: Fd, new_fd: Fd) -> KernelResult<()> {
        if old_fd == new_fd {
            return self.get(old_fd).map(|_| ()).ok_or(FsError::BadFileDescriptor.into());
        }
        let file = self.get(old_fd).ok_or(FsError::BadFileDescriptor)?;
        self.insert_at(new_fd, file, false)
    }

    pub fn dup3(&self, old_fd: Fd, new_fd: Fd, cloexec: bool) -> KernelResult<()> {
        if old_fd == new_fd {
            return Err(KernelError::InvalidArgument { name: "new_fd", value: "equal to old_fd" });
        }
        let file = self.get(old_fd).ok_or(FsError::BadFileDescriptor)?;
        self.insert_at(new_fd, file, cloexec)
    }

    pub fn set_cloexec(&self, fd: Fd, cloexec: bool) -> KernelResult<()> {
        let mut files = self.files.lock();
        let entry = files.get_mut(fd).and_then(|s| s.as_mut()).ok_or(FsError::BadFileDescriptor)?;
        entry.cloexec = cloexec;
        Ok(())
    }

    /// Drops every close-on-exec descriptor, called by `execve` right
    /// before the new image starts running.
    pub fn close_on_exec(&self) {
        let mut files = self.files.lock();
        for slot in files.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.cloexec) {
                *slot = None;
            }
        }
    }

    /// Builds a child table for `fork`: every descriptor is shared (not
    /// duplicated) with the parent, matching POSIX fork semantics where
    /// the seek offset is shared state between parent and child.
    pub fn clone_for_fork(&self) -> Self {
        let files = self.files.lock();
        let new_files = files
            .iter()
            .map(|slot| slot.as_ref().map(|e| Entry { file: e.file.clone(), cloexec: e.cloexec }))
            .collect();
        Self { files: Mutex::new(new_files) }
    }

    pub fn count_open(&self) -> usize {
        self.files.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Closes every open descriptor, called by `exit` during task teardown.
    pub fn close_all(&self) {
        let mut files = self.files.lock();
        for slot in files.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec as AVec;

    use super::*;
    use crate::fs::{Metadata, NodeKind};

    struct NullFile;

    impl FileOps for NullFile {
        fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
            Ok(0)
        }
        fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
            Ok(buf.len())
        }
        fn metadata(&self) -> KernelResult<Metadata> {
            Ok(Metadata { kind: NodeKind::CharDevice, size: 0, mode: 0o666, links: 1, inode: 0 })
        }
    }

    #[test_case]
    fn reserves_stdio_slots() -> KernelResult<()> {
        let table = FdTable::new();
        assert!(table.get(STDIN).is_none());
        assert!(table.get(STDOUT).is_none());
        assert!(table.get(STDERR).is_none());
        Ok(())
    }

    #[test_case]
    fn insert_and_close_reuses_slot() -> KernelResult<()> {
        let table = FdTable::new();
        let fd = table.insert(OpenFile::new(Arc::new(NullFile), OpenFlags::read_write()), false)?;
        assert!(fd >= 3);
        table.close(fd)?;
        let fd2 = table.insert(OpenFile::new(Arc::new(NullFile), OpenFlags::read_write()), false)?;
        assert_eq!(fd, fd2);
        Ok(())
    }

    #[test_case]
    fn dup2_shares_the_same_open_file() -> KernelResult<()> {
        let table = FdTable::new();
        let file = OpenFile::new(Arc::new(NullFile), OpenFlags::read_write());
        let fd = table.insert(file, false)?;
        table.dup2(fd, STDOUT)?;
        let a = table.get(fd).unwrap();
        let b = table.get(STDOUT).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }

    #[test_case]
    fn close_on_exec_drops_flagged_fds_only() -> KernelResult<()> {
        let table = FdTable::new();
        let keep = table.insert(OpenFile::new(Arc::new(NullFile), OpenFlags::read_write()), false)?;
        let drop_fd = table.insert(OpenFile::new(Arc::new(NullFile), OpenFlags::read_write()), true)?;
        table.close_on_exec();
        assert!(table.get(keep).is_some());
        assert!(table.get(drop_fd).is_none());
        Ok(())
    }

    #[test_case]
    fn clone_for_fork_shares_handles_and_offsets() -> KernelResult<()> {
        let table = FdTable::new();
        let fd = table.insert(OpenFile::new(Arc::new(NullFile), OpenFlags::read_write()), false)?;
        let cloned = table.clone_for_fork();
        let mut buf: AVec<u8> = AVec::new();
        buf.resize(4, 0);
        table.get(fd).unwrap().write(&buf)?;
        assert_eq!(table.get(fd).unwrap().tell(), cloned.get(fd).unwrap().tell());
        Ok(())
    }
}
