//! Device filesystem, mounted at `/dev`.
//!
//! A flat list of named entries, each an `Arc<dyn FileOps>` with its own
//! read/write/ioctl behaviour. Registration is idempotent by name:
//! [`register_block_device`] is how the IDE driver (or a test harness)
//! plugs a disk in as `/dev/ideN` after boot, alongside the fixed set of
//! nodes created by [`new`].

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use spin::{Mutex, RwLock};

use super::blockdev::BlockDevice;
use super::{DirEntry, FileOps, FsOps, Metadata, NodeKind, OpenFlags, PollEvents};
use crate::error::{FsError, KernelError, KernelResult};
use crate::mm::{vas::Vas, PageFlags, VirtualAddress};

struct NullDevice;

impl FileOps for NullDevice {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Ok(0)
    }
    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        Ok(buf.len())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        char_device_metadata()
    }
}

struct ZeroDevice;

impl FileOps for ZeroDevice {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        Ok(buf.len())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        char_device_metadata()
    }
}

/// Pseudo-random byte stream. No entropy source exists on this target, so
/// this is a plain xorshift seeded from the timer tick count - adequate for
/// `/dev/random` and `/dev/urandom`'s role as "some bytes", not for
/// anything that needs real entropy.
struct RandomDevice {
    state: Mutex<u64>,
}

impl RandomDevice {
    fn new() -> Self {
        let seed = crate::arch::x86::timer::get_ticks().wrapping_mul(0x9E3779B97F4A7C15) | 1;
        Self { state: Mutex::new(seed) }
    }

    fn next_byte(&self) -> u8 {
        let mut x = self.state.lock();
        *x ^= *x << 13;
        *x ^= *x >> 7;
        *x ^= *x << 17;
        (*x & 0xFF) as u8
    }
}

impl FileOps for RandomDevice {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        for byte in buf.iter_mut() {
            *byte = self.next_byte();
        }
        Ok(buf.len())
    }
    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        Ok(buf.len())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        char_device_metadata()
    }
}

/// A console/tty line. Input bytes are pushed by whatever keyboard or
/// serial-input driver owns the device (there is none wired up yet, so the
/// queue only ever drains what a test or future driver feeds it); reads
/// block until at least one byte is available. Writes go straight to the
/// kernel's serial console.
pub struct TtyDevice {
    input: Mutex<VecDeque<u8>>,
}

impl TtyDevice {
    fn new() -> Self {
        Self { input: Mutex::new(VecDeque::new()) }
    }

    /// Feeds a byte into this tty's input queue. Called by an input driver,
    /// not by user code.
    pub fn push_input(&self, byte: u8) {
        self.input.lock().push_back(byte);
    }
}

impl FileOps for TtyDevice {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut input = self.input.lock();
                if !input.is_empty() {
                    let n = buf.len().min(input.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = input.pop_front().unwrap_or(0);
                    }
                    return Ok(n);
                }
            }
            // No input yet: halt-and-wait, the blocking-I/O suspension
            // point the concurrency model allows.
            crate::arch::x86::enable_interrupts();
            crate::arch::x86::halt();
        }
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        for &byte in buf {
            crate::print!("{}", byte as char);
        }
        Ok(buf.len())
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        char_device_metadata()
    }

    fn poll(&self) -> PollEvents {
        PollEvents { readable: !self.input.lock().is_empty(), writable: true }
    }
}

/// Raw block access to a detected disk, exposed byte-addressed: offset and
/// length are translated into whole block reads/writes against the
/// underlying device and spliced into the caller's window.
struct IdeDevice {
    device: Arc<dyn BlockDevice>,
}

impl FileOps for IdeDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let block_size = self.device.block_size() as u64;
        let total = self.device.block_count() * block_size;
        if offset >= total {
            return Ok(0);
        }
        let n = buf.len().min((total - offset) as usize);
        let mut done = 0;
        let mut scratch = alloc::vec![0u8; block_size as usize];
        while done < n {
            let abs = offset + done as u64;
            let block = abs / block_size;
            let within = (abs % block_size) as usize;
            self.device.read_blocks(block, &mut scratch)?;
            let take = (block_size as usize - within).min(n - done);
            buf[done..done + take].copy_from_slice(&scratch[within..within + take]);
            done += take;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        let block_size = self.device.block_size() as u64;
        let mut done = 0;
        let mut scratch = alloc::vec![0u8; block_size as usize];
        while done < buf.len() {
            let abs = offset + done as u64;
            let block = abs / block_size;
            let within = (abs % block_size) as usize;
            let take = (block_size as usize - within).min(buf.len() - done);
            if within != 0 || take < block_size as usize {
                self.device.read_blocks(block, &mut scratch)?;
            }
            scratch[within..within + take].copy_from_slice(&buf[done..done + take]);
            self.device.write_blocks(block, &scratch)?;
            done += take;
        }
        Ok(done)
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(Metadata {
            kind: NodeKind::BlockDevice,
            size: self.device.block_count() * self.device.block_size() as u64,
            mode: 0o660,
            links: 1,
            inode: 0,
        })
    }
}

const GFXBUS_IOCTL_REGISTER_MASTER: u32 = 0x2f01;
const GFXBUS_IOCTL_ALLOC_BUFFER: u32 = 0x2f02;

/// Graphics compositor bus: a rendezvous point between the compositor
/// ("master") task and its clients. `ioctl(REGISTER_MASTER)` records the
/// caller as master; `ioctl(ALLOC_BUFFER, size)` carves out a shared range
/// in the caller's address space and maps the same physical frames into
/// the master's, handing back the caller-side virtual address.
struct GfxBus {
    master: Mutex<Option<u64>>,
}

impl GfxBus {
    fn new() -> Self {
        Self { master: Mutex::new(None) }
    }
}

impl FileOps for GfxBus {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(FsError::NotSupported.into())
    }
    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(FsError::NotSupported.into())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        char_device_metadata()
    }

    fn ioctl(&self, request: u32, arg: usize) -> KernelResult<usize> {
        match request {
            GFXBUS_IOCTL_REGISTER_MASTER => {
                let pid = crate::sched::current_pid()
                    .ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
                *self.master.lock() = Some(pid);
                Ok(0)
            }
            GFXBUS_IOCTL_ALLOC_BUFFER => {
                let size = arg;
                let master_pid = self.master.lock().ok_or(FsError::NotFound)?;
                let caller_vas: &Vas =
                    crate::sched::current_vas().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;

                let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
                let range = caller_vas.reserve(size.div_ceil(crate::mm::PAGE_SIZE), None, None, flags)?;

                crate::sched::with_task_vas(master_pid, |master_vas| {
                    crate::mm::vas::map_across(master_vas, caller_vas, range.start, size, flags)
                })
                .ok_or(KernelError::ProcessNotFound { pid: master_pid })??;

                Ok(range.start.as_usize())
            }
            _ => Err(FsError::NotSupported.into()),
        }
    }
}

fn char_device_metadata() -> KernelResult<Metadata> {
    Ok(Metadata { kind: NodeKind::CharDevice, size: 0, mode: 0o666, links: 1, inode: 0 })
}

fn directory_metadata() -> KernelResult<Metadata> {
    Ok(Metadata { kind: NodeKind::Directory, size: 0, mode: 0o755, links: 1, inode: 0 })
}

/// `/dev`. Holds a fixed set of nodes created at boot plus whatever block
/// devices get registered once the IDE driver finds disks.
pub struct DevFs {
    entries: RwLock<BTreeMap<String, Arc<dyn FileOps>>>,
}

impl DevFs {
    fn new_with_defaults() -> Self {
        let mut entries: BTreeMap<String, Arc<dyn FileOps>> = BTreeMap::new();
        entries.insert("null".to_string(), Arc::new(NullDevice));
        entries.insert("zero".to_string(), Arc::new(ZeroDevice));
        entries.insert("random".to_string(), Arc::new(RandomDevice::new()));
        entries.insert("urandom".to_string(), Arc::new(RandomDevice::new()));
        entries.insert("tty0".to_string(), Arc::new(TtyDevice::new()));
        entries.insert("console".to_string(), Arc::new(TtyDevice::new()));
        entries.insert("gfxbus".to_string(), Arc::new(GfxBus::new()));
        Self { entries: RwLock::new(entries) }
    }

    /// Registers (or replaces) a named entry. Idempotent: registering the
    /// same name twice just swaps the backing handle, matching the
    /// synthetic filesystem's "adding and removing entries is idempotent by
    /// name" contract.
    pub fn register(&self, name: &str, node: Arc<dyn FileOps>) {
        self.entries.write().insert(name.to_string(), node);
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().remove(name);
    }
}

impl FsOps for DevFs {
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

impl FileOps for DevFs {
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
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                inode: 0,
                kind: node.metadata().map(|m| m.kind).unwrap_or(NodeKind::CharDevice),
            })
            .collect())
    }
}

/// Registers `device` as `/dev/ideN` where `name` is e.g. `"ide1"`.
/// Idempotent by name.
pub fn register_block_device(fs: &DevFs, name: &str, device: Arc<dyn BlockDevice>) {
    fs.register(name, Arc::new(IdeDevice { device }));
}

pub fn new() -> Arc<dyn FsOps> {
    Arc::new(DevFs::new_with_defaults())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn null_and_zero_behave_as_expected() -> KernelResult<()> {
        let fs = DevFs::new_with_defaults();
        let null = fs.open("/null", OpenFlags::read_write())?;
        let mut buf = [0xAAu8; 8];
        assert_eq!(null.read(0, &mut buf)?, 0);
        assert_eq!(null.write(0, &buf)?, 8);

        let zero = fs.open("/zero", OpenFlags::read_only())?;
        let mut buf = [0xAAu8; 8];
        zero.read(0, &mut buf)?;
        assert_eq!(buf, [0u8; 8]);
        Ok(())
    }

    #[test_case]
    fn unknown_device_is_not_found() -> KernelResult<()> {
        let fs = DevFs::new_with_defaults();
        assert!(fs.open("/nope", OpenFlags::read_only()).is_err());
        Ok(())
    }

    #[test_case]
    fn register_block_device_is_idempotent_by_name() -> KernelResult<()> {
        use super::super::blockdev::RamBlockDevice;
        let fs = DevFs::new_with_defaults();
        let dev1: Arc<dyn BlockDevice> =
            Arc::new(RamBlockDevice::new(alloc::string::String::from("disk1"), 512, 4));
        register_block_device(&fs, "ide1", dev1);
        let dev2: Arc<dyn BlockDevice> =
            Arc::new(RamBlockDevice::new(alloc::string::String::from("disk1b"), 512, 8));
        register_block_device(&fs, "ide1", dev2);
        assert_eq!(fs.entries.read().len(), 8);
        Ok(())
    }
}
