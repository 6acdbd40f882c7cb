//! Virtual filesystem core.
//!
//! A mount table maps path prefixes to a filesystem implementation
//! ([`FsOps`]); resolution is longest-prefix-match, so `/dev/tty` resolves
//! against a `/dev` mount even with `/` also mounted. Every mounted
//! filesystem hands back `Arc<dyn FileOps>` handles on open, which is what
//! a task's file descriptor table (owned by [`crate::process::pcb`],
//! which is where per-task state belongs) actually stores.

pub mod blockdev;
pub mod devfs;
pub mod ext2;
pub mod file;
pub mod pipe;
pub mod sysfs;

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::RwLock;

use crate::error::{FsError, KernelResult};

pub use file::{FdTable, OpenFlags, STDERR, STDIN, STDOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Symlink,
    Fifo,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u16,
    pub links: u32,
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvents {
    pub readable: bool,
    pub writable: bool,
}

/// One open file's operations. Implementations own whatever internal
/// offset/lock state they need; the fd table above only tracks which
/// handle a number maps to and the flags it was opened with.
pub trait FileOps: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize>;
    fn metadata(&self) -> KernelResult<Metadata>;

    fn ioctl(&self, _request: u32, _arg: usize) -> KernelResult<usize> {
        Err(FsError::NotSupported.into())
    }
    fn poll(&self) -> PollEvents {
        PollEvents { readable: true, writable: true }
    }
    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        Err(FsError::NotADirectory.into())
    }
    fn truncate(&self, _len: u64) -> KernelResult<()> {
        Err(FsError::NotSupported.into())
    }
}

/// One mounted filesystem's operations, addressed by paths relative to its
/// mount point.
pub trait FsOps: Send + Sync {
    fn open(&self, rel_path: &str, flags: OpenFlags) -> KernelResult<Arc<dyn FileOps>>;
    fn stat(&self, rel_path: &str) -> KernelResult<Metadata>;

    fn unlink(&self, _rel_path: &str) -> KernelResult<()> {
        Err(FsError::NotSupported.into())
    }
    fn mkdir(&self, _rel_path: &str) -> KernelResult<()> {
        Err(FsError::NotSupported.into())
    }
    fn chmod(&self, _rel_path: &str, _mode: u16) -> KernelResult<()> {
        Err(FsError::NotSupported.into())
    }
    fn readlink(&self, _rel_path: &str) -> KernelResult<String> {
        Err(FsError::NotASymlink.into())
    }
}

struct Mount {
    prefix: String,
    fs: Arc<dyn FsOps>,
}

/// Mount table, resolved longest-prefix-first so a deeper mount always
/// shadows a shallower one covering the same path.
struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    const fn new() -> Self {
        Self { mounts: RwLock::new(Vec::new()) }
    }

    fn mount(&self, prefix: &str, fs: Arc<dyn FsOps>) -> KernelResult<()> {
        let mut mounts = self.mounts.write();
        if mounts.iter().any(|m| m.prefix == prefix) {
            return Err(FsError::AlreadyMounted.into());
        }
        mounts.push(Mount { prefix: String::from(prefix), fs });
        mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    fn unmount(&self, prefix: &str) -> KernelResult<()> {
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|m| m.prefix != prefix);
        if mounts.len() == before {
            return Err(FsError::NotMounted.into());
        }
        Ok(())
    }

    /// Longest-prefix-match resolution: returns the matching filesystem and
    /// the path remainder relative to its mount point (always starting
    /// with `/`, even at the mount point itself).
    fn resolve(&self, path: &str) -> KernelResult<(Arc<dyn FsOps>, String)> {
        let mounts = self.mounts.read();
        for mount in mounts.iter() {
            if path == mount.prefix || path.starts_with(&mount.prefix) {
                let is_root = mount.prefix == "/";
                let boundary_ok = is_root
                    || path.len() == mount.prefix.len()
                    || path.as_bytes()[mount.prefix.len()] == b'/';
                if !boundary_ok {
                    continue;
                }
                let rel = if is_root {
                    String::from(path)
                } else {
                    let tail = &path[mount.prefix.len()..];
                    if tail.is_empty() { String::from("/") } else { String::from(tail) }
                };
                return Ok((mount.fs.clone(), rel));
            }
        }
        Err(FsError::NoRootFs.into())
    }
}

static MOUNTS: MountTable = MountTable::new();

pub fn mount(prefix: &str, fs: Arc<dyn FsOps>) -> KernelResult<()> {
    MOUNTS.mount(prefix, fs)
}

pub fn unmount(prefix: &str) -> KernelResult<()> {
    MOUNTS.unmount(prefix)
}

pub fn open(path: &str, flags: OpenFlags) -> KernelResult<Arc<dyn FileOps>> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.open(&rel, flags)
}

pub fn stat(path: &str) -> KernelResult<Metadata> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.stat(&rel)
}

pub fn unlink(path: &str) -> KernelResult<()> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.unlink(&rel)
}

pub fn mkdir(path: &str) -> KernelResult<()> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.mkdir(&rel)
}

pub fn chmod(path: &str, mode: u16) -> KernelResult<()> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.chmod(&rel, mode)
}

pub fn readlink(path: &str) -> KernelResult<String> {
    let (fs, rel) = MOUNTS.resolve(path)?;
    fs.readlink(&rel)
}

/// Mounts the synthetic filesystems and the root ext2 block device. Run
/// once during boot, after the block device layer is up, before the init
/// task is loaded.
pub fn init() {
    mount("/dev", devfs::new()).expect("fs: failed to mount devfs");
    mount("/sys", sysfs::new()).expect("fs: failed to mount sysfs");
    crate::println!("[fs] devfs mounted at /dev, sysfs mounted at /sys");
}

/// Mounts the root ext2 filesystem backed by `device`. Separate from
/// [`init`] because the root device (the boot module `kernel_entry` stages)
/// isn't known until after devfs/sysfs are already mounted.
pub fn mount_root(device: Arc<dyn blockdev::BlockDevice>) -> KernelResult<()> {
    let fs = ext2::Ext2Fs::mount(device)?;
    mount("/", Arc::new(fs))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A filesystem stub that only records which mount it is, so a test
    /// can tell which one a path resolved to without any real backing
    /// store.
    struct TaggedFs(&'static str);

    impl FsOps for TaggedFs {
        fn open(&self, _rel_path: &str, _flags: OpenFlags) -> KernelResult<Arc<dyn FileOps>> {
            Err(FsError::NotFound.into())
        }
        fn stat(&self, _rel_path: &str) -> KernelResult<Metadata> {
            Err(FsError::NotFound.into())
        }
    }

    #[test_case]
    fn longest_prefix_wins_regardless_of_mount_order() {
        // The spec's scenario exactly: mount `/` then `/mnt/a` then `/mnt`.
        // A lookup of `/mnt/a/x` must dispatch to the `/mnt/a` mount (the
        // relative path strips that whole prefix); `/mnt/b/x` has no exact
        // `/mnt/b` mount, so it falls back to `/mnt`.
        let table = MountTable::new();
        table.mount("/", Arc::new(TaggedFs("root"))).unwrap();
        table.mount("/mnt/a", Arc::new(TaggedFs("mnt-a"))).unwrap();
        table.mount("/mnt", Arc::new(TaggedFs("mnt"))).unwrap();

        let (_, rel) = table.resolve("/mnt/a/x").unwrap();
        assert_eq!(rel, "/x", "should have matched the deeper /mnt/a mount");

        let (_, rel) = table.resolve("/mnt/b/x").unwrap();
        assert_eq!(rel, "/b/x", "should have fallen back to the shallower /mnt mount");

        let (_, rel) = table.resolve("/etc/hostname").unwrap();
        assert_eq!(rel, "/etc/hostname", "should have fallen back to the root mount");
    }

    #[test_case]
    fn a_prefix_is_not_matched_mid_component() {
        // "/mn" must not match a path like "/mnt/x" just because it is a
        // string prefix - the boundary check requires the next character
        // to be a path separator.
        let table = MountTable::new();
        table.mount("/", Arc::new(TaggedFs("root"))).unwrap();
        table.mount("/mn", Arc::new(TaggedFs("mn"))).unwrap();

        let (_, rel) = table.resolve("/mnt/x").unwrap();
        assert_eq!(rel, "/mnt/x", "should have fallen back to the root mount, not the /mn partial match");
    }
}
