//! Block device abstraction.
//!
//! Filesystems reach storage exclusively through this trait, never through
//! a concrete driver type - `ext2::Ext2Fs::mount` takes an
//! `Arc<dyn BlockDevice>` so the same code mounts against a RAM disk in
//! tests and a real IDE/ATA device at boot. All methods take `&self`: a
//! mounted filesystem holds its device behind an `Arc`, shared with
//! whatever else (a `/dev/ideN` devfs node) also needs to reach it, so any
//! mutable state a concrete device needs is its own problem to synchronize.

use alloc::{string::String, vec::Vec};

use spin::Mutex;

use crate::error::KernelError;

pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> Result<(), KernelError>;
    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> Result<(), KernelError>;

    fn flush(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

/// RAM-backed block device, used for the root filesystem image staged by
/// the bootloader and for tests.
pub struct RamBlockDevice {
    name: String,
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamBlockDevice {
    pub fn new(name: String, block_size: usize, block_count: u64) -> Self {
        let size = block_size * block_count as usize;
        Self { name, block_size, data: Mutex::new(alloc::vec![0u8; size]) }
    }

    /// Wraps an already-loaded image (e.g. a multiboot module) rather than
    /// allocating zeroed storage.
    pub fn from_image(name: String, block_size: usize, image: Vec<u8>) -> Self {
        Self { name, block_size, data: Mutex::new(image) }
    }

    pub fn size(&self) -> usize {
        self.data.lock().len()
    }
}

impl BlockDevice for RamBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.lock().len() / self.block_size) as u64
    }

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> Result<(), KernelError> {
        let start_byte = start_block as usize * self.block_size;
        let end_byte = start_byte + buffer.len();
        let data = self.data.lock();
        if end_byte > data.len() {
            return Err(KernelError::InvalidArgument { name: "block_range", value: "out_of_bounds" });
        }
        buffer.copy_from_slice(&data[start_byte..end_byte]);
        Ok(())
    }

    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> Result<(), KernelError> {
        let start_byte = start_block as usize * self.block_size;
        let end_byte = start_byte + buffer.len();
        let mut data = self.data.lock();
        if end_byte > data.len() {
            return Err(KernelError::InvalidArgument { name: "block_range", value: "out_of_bounds" });
        }
        data[start_byte..end_byte].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;

    #[test_case]
    fn ram_block_device_roundtrips() -> Result<(), KernelError> {
        let dev = RamBlockDevice::new(String::from("test"), 512, 100);
        assert_eq!(dev.block_size(), 512);
        assert_eq!(dev.block_count(), 100);

        let write_data = [0x42u8; 512];
        dev.write_blocks(0, &write_data)?;

        let mut read_data = [0u8; 512];
        dev.read_blocks(0, &mut read_data)?;
        assert_eq!(read_data, write_data);
        Ok(())
    }

    #[test_case]
    fn out_of_bounds_access_is_rejected() -> Result<(), KernelError> {
        let dev = RamBlockDevice::new(String::from("test"), 512, 4);
        let mut buf = [0u8; 512];
        assert!(dev.read_blocks(10, &mut buf).is_err());
        Ok(())
    }
}
