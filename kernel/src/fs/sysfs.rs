//! Synthetic introspection filesystem, mounted at `/sys`.
//!
//! Same flat-named-entry shape as [`super::devfs`], just aimed at kernel
//! state instead of devices. The only fixed entry today is `memfree`;
//! [`SysFs::register`]/[`SysFs::unregister`] let other subsystems publish
//! their own entries the same way, idempotent by name.

use alloc::{
    collections::BTreeMap,
    format,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use spin::RwLock;

use super::{DirEntry, FileOps, FsOps, Metadata, NodeKind, OpenFlags};
use crate::error::{FsError, KernelResult};

/// A read-only entry whose contents are computed fresh on every read from
/// `format`, then sliced by `offset` - cheap for the small, frequently
/// re-read strings this filesystem exists to serve.
struct FormattedEntry<F: Fn() -> String + Send + Sync> {
    format: F,
}

impl<F: Fn() -> String + Send + Sync> FileOps for FormattedEntry<F> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let text = (self.format)();
        let bytes = text.as_bytes();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(FsError::ReadOnly.into())
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(Metadata { kind: NodeKind::File, size: (self.format)().len() as u64, mode: 0o444, links: 1, inode: 0 })
    }
}

fn memfree_text() -> String {
    format!("{} {}\n", crate::mm::total_memory_bytes(), crate::mm::free_memory_bytes())
}

fn directory_metadata() -> KernelResult<Metadata> {
    Ok(Metadata { kind: NodeKind::Directory, size: 0, mode: 0o755, links: 1, inode: 0 })
}

pub struct SysFs {
    entries: RwLock<BTreeMap<String, Arc<dyn FileOps>>>,
}

impl SysFs {
    fn new_with_defaults() -> Self {
        let mut entries: BTreeMap<String, Arc<dyn FileOps>> = BTreeMap::new();
        entries.insert("memfree".to_string(), Arc::new(FormattedEntry { format: memfree_text }));
        Self { entries: RwLock::new(entries) }
    }

    pub fn register(&self, name: &str, node: Arc<dyn FileOps>) {
        self.entries.write().insert(name.to_string(), node);
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().remove(name);
    }
}

impl FsOps for SysFs {
    fn open(&self, rel_path: &str, _flags: OpenFlags) -> KernelResult<Arc<dyn FileOps>> {
        let name = rel_path.trim_start_matches('/');
        self.entries.read().get(name).cloned().ok_or_else(|| FsError::NotFound.into())
    }

    fn stat(&self, rel_path: &str) -> KernelResult<Metadata> {
        let name = rel_path.trim_start_matches('/');
        if name.is_empty() {
            return directory_metadata();
        }
        self.entries.read().get(name).ok_or(FsError::NotFound)?.metadata()
    }
}

impl FileOps for SysFs {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(FsError::IsADirectory.into())
    }
    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(FsError::IsADirectory.into())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        directory_metadata()
    }
    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        Ok(self
            .entries
            .read()
            .keys()
            .map(|name| DirEntry { name: name.clone(), inode: 0, kind: NodeKind::File })
            .collect())
    }
}

pub fn new() -> Arc<dyn FsOps> {
    Arc::new(SysFs::new_with_defaults())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn memfree_formats_two_byte_counts() -> KernelResult<()> {
        let fs = SysFs::new_with_defaults();
        let file = fs.open("/memfree", OpenFlags::read_only())?;
        let mut buf = [0u8; 64];
        let n = file.read(0, &mut buf)?;
        let text = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.split_whitespace().count(), 2);
        Ok(())
    }

    #[test_case]
    fn unknown_entry_is_not_found() -> KernelResult<()> {
        let fs = SysFs::new_with_defaults();
        assert!(fs.open("/nope", OpenFlags::read_only()).is_err());
        Ok(())
    }
}
