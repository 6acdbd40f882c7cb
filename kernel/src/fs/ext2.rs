//! ext2 filesystem driver.
//!
//! Reads superblock, blockgroup descriptors and inodes straight off the
//! block device on every call - there is no block cache here, matching
//! the non-goal of anything beyond best-effort metadata/data writes. The
//! on-disk layout follows ext2 revision 0/1: superblock at byte offset
//! 1024, blockgroup descriptor table starting at the block right after
//! the superblock's own block, inode tables per group.

#![allow(dead_code)]

use alloc::{borrow::ToOwned, string::String, sync::Arc, vec, vec::Vec};

use super::blockdev::BlockDevice;
use super::{DirEntry, FileOps, FsOps, Metadata, NodeKind, OpenFlags};
use crate::error::{FsError, KernelError, KernelResult};

const EXT2_MAGIC: u16 = 0xEF53;
const EXT2_ROOT_INODE: u32 = 2;
const EXT2_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_DEFAULT_INODE_SIZE: usize = 128;

const EXT2_S_IFMT: u16 = 0xF000;
const EXT2_S_IFDIR: u16 = 0x4000;
const EXT2_S_IFLNK: u16 = 0xA000;
const EXT2_S_IFREG: u16 = 0x8000;

/// State flag: cleanly unmounted.
const EXT2_VALID_FS: u16 = 1;

/// Feature bits this driver does not understand and will not mount over.
/// None are implemented, so any incompatible bit set is a refusal.
const SUPPORTED_INCOMPAT_FEATURES: u32 = 0;

#[derive(Debug, Clone, Copy)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    free_blocks_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    log_block_size: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    magic: u16,
    state: u16,
    rev_level: u32,
    inode_size: u16,
    feature_incompat: u32,
    feature_ro_compat: u32,
}

impl Superblock {
    fn parse(buf: &[u8]) -> KernelResult<Self> {
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let u16_at = |off: usize| u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());

        let magic = u16_at(56);
        if magic != EXT2_MAGIC {
            return Err(FsError::UnknownFsType.into());
        }
        let state = u16_at(58);
        if state != EXT2_VALID_FS {
            return Err(KernelError::InvalidState { expected: "clean ext2 filesystem", actual: "dirty or errored" });
        }

        let rev_level = u32_at(76);
        let (inode_size, feature_incompat, feature_ro_compat) = if rev_level >= 1 {
            (u16_at(88), u32_at(96), u32_at(100))
        } else {
            (EXT2_DEFAULT_INODE_SIZE as u16, 0, 0)
        };

        if feature_incompat & !SUPPORTED_INCOMPAT_FEATURES != 0 {
            return Err(KernelError::OperationNotSupported { operation: "ext2 incompatible feature bits" });
        }

        Ok(Self {
            inodes_count: u32_at(0),
            blocks_count: u32_at(4),
            free_blocks_count: u32_at(12),
            free_inodes_count: u32_at(16),
            first_data_block: u32_at(20),
            log_block_size: u32_at(24),
            blocks_per_group: u32_at(32),
            inodes_per_group: u32_at(40),
            magic,
            state,
            rev_level,
            inode_size,
            feature_incompat,
            feature_ro_compat,
        })
    }

    fn block_size(&self) -> usize {
        1024usize << self.log_block_size
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupDesc {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
}

impl GroupDesc {
    fn parse(buf: &[u8]) -> Self {
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Self { block_bitmap: u32_at(0), inode_bitmap: u32_at(4), inode_table: u32_at(8) }
    }
}

#[derive(Debug, Clone, Copy)]
struct Inode {
    mode: u16,
    size: u32,
    links_count: u16,
    block: [u32; 15],
}

impl Inode {
    fn parse(buf: &[u8]) -> Self {
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let u16_at = |off: usize| u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
        let mut block = [0u32; 15];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = u32_at(40 + i * 4);
        }
        Self { mode: u16_at(0), size: u32_at(4), links_count: u16_at(26), block }
    }

    fn write_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[26..28].copy_from_slice(&self.links_count.to_le_bytes());
        for (i, b) in self.block.iter().enumerate() {
            buf[40 + i * 4..44 + i * 4].copy_from_slice(&b.to_le_bytes());
        }
    }

    fn kind(&self) -> NodeKind {
        match self.mode & EXT2_S_IFMT {
            EXT2_S_IFDIR => NodeKind::Directory,
            EXT2_S_IFLNK => NodeKind::Symlink,
            _ => NodeKind::File,
        }
    }
}

/// Reads `len` bytes starting at byte `offset` off `device`, splicing
/// across its block boundaries. Used for the superblock (which sits at a
/// fixed byte offset unrelated to any ext2 block) and small fixed-size
/// reads elsewhere.
fn read_bytes(device: &dyn BlockDevice, offset: u64, len: usize) -> KernelResult<Vec<u8>> {
    let block_size = device.block_size() as u64;
    let mut out = vec![0u8; len];
    let mut done = 0usize;
    let mut scratch = vec![0u8; block_size as usize];
    while done < len {
        let abs = offset + done as u64;
        let block = abs / block_size;
        let within = (abs % block_size) as usize;
        device.read_blocks(block, &mut scratch)?;
        let take = (block_size as usize - within).min(len - done);
        out[done..done + take].copy_from_slice(&scratch[within..within + take]);
        done += take;
    }
    Ok(out)
}

fn write_bytes(device: &dyn BlockDevice, offset: u64, data: &[u8]) -> KernelResult<()> {
    let block_size = device.block_size() as u64;
    let mut done = 0usize;
    let mut scratch = vec![0u8; block_size as usize];
    while done < data.len() {
        let abs = offset + done as u64;
        let block = abs / block_size;
        let within = (abs % block_size) as usize;
        let take = (block_size as usize - within).min(data.len() - done);
        if within != 0 || take < block_size as usize {
            device.read_blocks(block, &mut scratch)?;
        }
        scratch[within..within + take].copy_from_slice(&data[done..done + take]);
        device.write_blocks(block, &scratch)?;
        done += take;
    }
    Ok(())
}

/// A mounted ext2 volume. Read-heavy by design: every call re-reads the
/// structures it needs rather than keeping a block cache.
pub struct Ext2Fs {
    device: Arc<dyn BlockDevice>,
    sb: Superblock,
    group_descs: Vec<GroupDesc>,
}

impl Ext2Fs {
    pub fn mount(device: Arc<dyn BlockDevice>) -> KernelResult<Self> {
        let sb_bytes = read_bytes(device.as_ref(), EXT2_SUPERBLOCK_OFFSET, 1024)?;
        let sb = Superblock::parse(&sb_bytes)?;

        if sb.feature_ro_compat != 0 {
            crate::println!("[ext2] warning: unsupported read-only-compat feature bits {:#x}", sb.feature_ro_compat);
        }

        let block_size = sb.block_size();
        let group_count = sb.blocks_count.div_ceil(sb.blocks_per_group.max(1)) as usize;
        let bgdt_block = sb.first_data_block + 1;
        let bgdt_bytes = read_bytes(device.as_ref(), bgdt_block as u64 * block_size as u64, group_count * 32)?;
        let group_descs = (0..group_count).map(|i| GroupDesc::parse(&bgdt_bytes[i * 32..i * 32 + 32])).collect();

        // Best-effort mount-count bump; failure here is not fatal to mounting.
        let _ = Self::bump_mount_count(device.as_ref(), &sb_bytes);

        Ok(Self { device, sb, group_descs })
    }

    fn bump_mount_count(device: &dyn BlockDevice, sb_bytes: &[u8]) -> KernelResult<()> {
        let mnt_count = u16::from_le_bytes(sb_bytes[52..54].try_into().unwrap());
        let mut patch = sb_bytes[52..54].to_owned();
        patch.copy_from_slice(&mnt_count.wrapping_add(1).to_le_bytes());
        write_bytes(device, EXT2_SUPERBLOCK_OFFSET + 52, &patch)
    }

    fn block_size(&self) -> usize {
        self.sb.block_size()
    }

    fn read_block(&self, block: u32) -> KernelResult<Vec<u8>> {
        read_bytes(self.device.as_ref(), block as u64 * self.block_size() as u64, self.block_size())
    }

    fn write_block(&self, block: u32, data: &[u8]) -> KernelResult<()> {
        write_bytes(self.device.as_ref(), block as u64 * self.block_size() as u64, data)
    }

    fn inode_location(&self, inode_num: u32) -> KernelResult<(u32, usize)> {
        if inode_num == 0 {
            return Err(FsError::NotFound.into());
        }
        let index = inode_num - 1;
        let group = index / self.sb.inodes_per_group;
        let index_in_group = index % self.sb.inodes_per_group;
        let desc = self.group_descs.get(group as usize).ok_or(FsError::NotFound)?;
        let inode_size = self.sb.inode_size as usize;
        let inodes_per_block = self.block_size() / inode_size;
        let block = desc.inode_table + index_in_group / inodes_per_block as u32;
        let offset = (index_in_group as usize % inodes_per_block) * inode_size;
        Ok((block, offset))
    }

    fn read_inode(&self, inode_num: u32) -> KernelResult<Inode> {
        let (block, offset) = self.inode_location(inode_num)?;
        let block_data = self.read_block(block)?;
        let inode_size = self.sb.inode_size as usize;
        Ok(Inode::parse(&block_data[offset..offset + inode_size.min(128)]))
    }

    fn write_inode(&self, inode_num: u32, inode: &Inode) -> KernelResult<()> {
        let (block, offset) = self.inode_location(inode_num)?;
        let mut block_data = self.read_block(block)?;
        inode.write_into(&mut block_data[offset..offset + self.sb.inode_size as usize]);
        self.write_block(block, &block_data)
    }

    /// Resolves a logical block index within an inode to a physical block
    /// number, walking indirect blocks as needed. Triple-indirect (index
    /// 14) is not implemented, matching the driver's documented gap at
    /// that tier.
    fn resolve_block(&self, inode: &Inode, logical: u32) -> KernelResult<Option<u32>> {
        let entries_per_block = (self.block_size() / 4) as u32;

        if logical < 12 {
            return Ok(nonzero(inode.block[logical as usize]));
        }

        let logical = logical - 12;
        if logical < entries_per_block {
            return self.resolve_indirect(inode.block[12], logical);
        }

        let logical = logical - entries_per_block;
        if logical < entries_per_block * entries_per_block {
            let outer = logical / entries_per_block;
            let inner = logical % entries_per_block;
            let Some(indirect_block) = self.resolve_indirect(inode.block[13], outer)? else {
                return Ok(None);
            };
            return self.resolve_indirect(indirect_block, inner);
        }

        Err(KernelError::NotImplemented { feature: "ext2 triple-indirect blocks" })
    }

    fn resolve_indirect(&self, indirect_block: u32, index: u32) -> KernelResult<Option<u32>> {
        if indirect_block == 0 {
            return Ok(None);
        }
        let data = self.read_block(indirect_block)?;
        let off = index as usize * 4;
        Ok(nonzero(u32::from_le_bytes(data[off..off + 4].try_into().unwrap())))
    }

    fn read_inode_data(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let size = inode.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);
        let block_size = self.block_size() as u64;
        let mut done = 0;
        while done < to_read {
            let abs = offset + done as u64;
            let logical = (abs / block_size) as u32;
            let within = (abs % block_size) as usize;
            let take = (block_size as usize - within).min(to_read - done);
            match self.resolve_block(inode, logical)? {
                Some(phys) => {
                    let block_data = self.read_block(phys)?;
                    buf[done..done + take].copy_from_slice(&block_data[within..within + take]);
                }
                None => buf[done..done + take].fill(0),
            }
            done += take;
        }
        Ok(done)
    }

    /// Best-effort write: only updates blocks already allocated to the
    /// inode, per the non-goal that rules out ext2 write support beyond
    /// best-effort metadata/data updates. Writing past the last allocated
    /// block returns an error rather than silently truncating.
    fn write_inode_data(&self, inode_num: u32, inode: &mut Inode, offset: u64, data: &[u8]) -> KernelResult<usize> {
        let block_size = self.block_size() as u64;
        let mut done = 0;
        while done < data.len() {
            let abs = offset + done as u64;
            let logical = (abs / block_size) as u32;
            let within = (abs % block_size) as usize;
            let take = (block_size as usize - within).min(data.len() - done);
            let phys = self
                .resolve_block(inode, logical)?
                .ok_or(KernelError::OperationNotSupported { operation: "ext2 write requiring block allocation" })?;
            let mut block_data = self.read_block(phys)?;
            block_data[within..within + take].copy_from_slice(&data[done..done + take]);
            self.write_block(phys, &block_data)?;
            done += take;
        }
        let new_size = offset + done as u64;
        if new_size > inode.size as u64 {
            inode.size = new_size as u32;
        }
        self.write_inode(inode_num, inode)?;
        Ok(done)
    }

    fn read_dirents(&self, dir_inode_num: u32) -> KernelResult<Vec<(String, u32, u8)>> {
        let inode = self.read_inode(dir_inode_num)?;
        if inode.kind() != NodeKind::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let mut entries = Vec::new();
        let block_size = self.block_size();
        let mut data = vec![0u8; inode.size as usize];
        self.read_inode_data(&inode, 0, &mut data)?;

        for chunk_start in (0..data.len()).step_by(block_size) {
            let block = &data[chunk_start..(chunk_start + block_size).min(data.len())];
            let mut pos = 0;
            while pos + 8 <= block.len() {
                let ino = u32::from_le_bytes(block[pos..pos + 4].try_into().unwrap());
                let rec_len = u16::from_le_bytes(block[pos + 4..pos + 6].try_into().unwrap());
                let name_len = block[pos + 6] as usize;
                if rec_len == 0 {
                    break;
                }
                if ino != 0 && pos + 8 + name_len <= block.len() {
                    let name = String::from_utf8_lossy(&block[pos + 8..pos + 8 + name_len]).into_owned();
                    let file_type = block[pos + 7];
                    entries.push((name, ino, file_type));
                }
                pos += rec_len as usize;
            }
        }
        Ok(entries)
    }

    /// Resolves an absolute path (relative to this filesystem's mount
    /// point) to an inode number, starting from the root inode and
    /// scanning each directory's dirents linearly.
    fn resolve_path(&self, path: &str) -> KernelResult<u32> {
        let mut current = EXT2_ROOT_INODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entries = self.read_dirents(current)?;
            let found = entries.iter().find(|(name, _, _)| name == component);
            current = found.ok_or(FsError::NotFound)?.1;
        }
        Ok(current)
    }

    fn read_symlink_target(&self, _inode_num: u32, inode: &Inode) -> KernelResult<String> {
        if inode.size as usize <= 60 {
            // Stored inline across the 15 block-pointer slots, 4 bytes each.
            let mut bytes = Vec::with_capacity(60);
            for b in inode.block.iter() {
                bytes.extend_from_slice(&b.to_le_bytes());
            }
            bytes.truncate(inode.size as usize);
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            let mut buf = vec![0u8; inode.size as usize];
            self.read_inode_data(inode, 0, &mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
    }

    fn metadata_for(&self, inode_num: u32) -> KernelResult<Metadata> {
        let inode = self.read_inode(inode_num)?;
        Ok(Metadata {
            kind: inode.kind(),
            size: inode.size as u64,
            mode: inode.mode & 0xFFF,
            links: inode.links_count as u32,
            inode: inode_num as u64,
        })
    }
}

fn nonzero(block: u32) -> Option<u32> {
    if block == 0 { None } else { Some(block) }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, name)) => (if parent.is_empty() { "/" } else { parent }, name),
        None => ("/", path),
    }
}

impl FsOps for Ext2Fs {
    fn open(&self, rel_path: &str, _flags: OpenFlags) -> KernelResult<Arc<dyn FileOps>> {
        let inode_num = self.resolve_path(rel_path)?;
        Ok(Arc::new(Ext2File { fs: self.clone_handle(), inode_num }))
    }

    fn stat(&self, rel_path: &str) -> KernelResult<Metadata> {
        if rel_path == "/" || rel_path.is_empty() {
            return self.metadata_for(EXT2_ROOT_INODE);
        }
        let inode_num = self.resolve_path(rel_path)?;
        self.metadata_for(inode_num)
    }

    fn unlink(&self, rel_path: &str) -> KernelResult<()> {
        let (parent_path, name) = split_parent(rel_path);
        let parent_inode = self.resolve_path(parent_path)?;
        let parent = self.read_inode(parent_inode)?;
        let block_size = self.block_size();
        let mut data = vec![0u8; parent.size as usize];
        self.read_inode_data(&parent, 0, &mut data)?;

        let mut found = false;
        for chunk_start in (0..data.len()).step_by(block_size) {
            let block_end = (chunk_start + block_size).min(data.len());
            let mut pos = chunk_start;
            while pos + 8 <= block_end {
                let ino = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                let rec_len = u16::from_le_bytes(data[pos + 4..pos + 6].try_into().unwrap()) as usize;
                let name_len = data[pos + 6] as usize;
                if rec_len == 0 {
                    break;
                }
                if ino != 0 && data[pos + 8..pos + 8 + name_len] == *name.as_bytes() {
                    // Mark the dirent deleted by zeroing its inode field.
                    // Link-count decrement and block reclamation are
                    // documented gaps, matching the driver's scope.
                    data[pos..pos + 4].copy_from_slice(&0u32.to_le_bytes());
                    found = true;
                    break;
                }
                pos += rec_len;
            }
            if found {
                let logical = (chunk_start / block_size) as u32;
                let phys = self.resolve_block(&parent, logical)?.ok_or(FsError::IoError)?;
                self.write_block(phys, &data[chunk_start..block_end])?;
                break;
            }
        }
        if !found {
            return Err(FsError::NotFound.into());
        }
        Ok(())
    }

    fn chmod(&self, rel_path: &str, mode: u16) -> KernelResult<()> {
        let inode_num = self.resolve_path(rel_path)?;
        let mut inode = self.read_inode(inode_num)?;
        inode.mode = (inode.mode & EXT2_S_IFMT) | (mode & !EXT2_S_IFMT);
        self.write_inode(inode_num, &inode)
    }

    fn readlink(&self, rel_path: &str) -> KernelResult<String> {
        let inode_num = self.resolve_path(rel_path)?;
        let inode = self.read_inode(inode_num)?;
        if inode.kind() != NodeKind::Symlink {
            return Err(FsError::NotASymlink.into());
        }
        self.read_symlink_target(inode_num, &inode)
    }
}

impl Ext2Fs {
    fn clone_handle(&self) -> Arc<Ext2FsShared> {
        Arc::new(Ext2FsShared {
            device: self.device.clone(),
            sb: self.sb,
            group_descs: self.group_descs.clone(),
        })
    }
}

/// Cheap `Arc`-cloneable snapshot of the mounted volume's static layout,
/// handed to each open file so it can resolve blocks without borrowing the
/// mount itself.
struct Ext2FsShared {
    device: Arc<dyn BlockDevice>,
    sb: Superblock,
    group_descs: Vec<GroupDesc>,
}

impl Ext2FsShared {
    fn as_fs(&self) -> Ext2Fs {
        Ext2Fs { device: self.device.clone(), sb: self.sb, group_descs: self.group_descs.clone() }
    }
}

struct Ext2File {
    fs: Arc<Ext2FsShared>,
    inode_num: u32,
}

impl FileOps for Ext2File {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let fs = self.fs.as_fs();
        let inode = fs.read_inode(self.inode_num)?;
        fs.read_inode_data(&inode, offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        let fs = self.fs.as_fs();
        let mut inode = fs.read_inode(self.inode_num)?;
        fs.write_inode_data(self.inode_num, &mut inode, offset, buf)
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        self.fs.as_fs().metadata_for(self.inode_num)
    }

    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        let fs = self.fs.as_fs();
        let entries = fs.read_dirents(self.inode_num)?;
        entries
            .into_iter()
            .map(|(name, ino, _file_type)| {
                let kind = fs.read_inode(ino).map(|i| i.kind()).unwrap_or(NodeKind::File);
                Ok(DirEntry { name, inode: ino as u64, kind })
            })
            .collect()
    }

    fn truncate(&self, len: u64) -> KernelResult<()> {
        let fs = self.fs.as_fs();
        let mut inode = fs.read_inode(self.inode_num)?;
        inode.size = len as u32;
        fs.write_inode(self.inode_num, &inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamBlockDevice;

    /// Builds a minimal one-group, 1 KiB-block ext2 image with a root
    /// directory containing a single regular file `"hello"`.
    fn build_test_image() -> RamBlockDevice {
        const BLOCK_SIZE: usize = 1024;
        const BLOCKS_PER_GROUP: u32 = 8192;
        const INODES_PER_GROUP: u32 = 64;
        const INODE_SIZE: usize = 128;
        const TOTAL_BLOCKS: u32 = 64;

        let mut image = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE];

        // Superblock at byte 1024.
        let sb = &mut image[1024..2048];
        sb[0..4].copy_from_slice(&INODES_PER_GROUP.to_le_bytes());
        sb[4..8].copy_from_slice(&TOTAL_BLOCKS.to_le_bytes());
        sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // first_data_block (1 KiB blocks)
        sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // log_block_size => 1024
        sb[32..36].copy_from_slice(&BLOCKS_PER_GROUP.to_le_bytes());
        sb[40..44].copy_from_slice(&INODES_PER_GROUP.to_le_bytes());
        sb[56..58].copy_from_slice(&EXT2_MAGIC.to_le_bytes());
        sb[58..60].copy_from_slice(&EXT2_VALID_FS.to_le_bytes());
        sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev_level = dynamic
        sb[88..90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());

        // Group descriptor table at block 2.
        let bgdt_block = 2usize;
        let bgdt = &mut image[bgdt_block * BLOCK_SIZE..bgdt_block * BLOCK_SIZE + 32];
        let block_bitmap_block = 3u32;
        let inode_bitmap_block = 4u32;
        let inode_table_block = 5u32;
        bgdt[0..4].copy_from_slice(&block_bitmap_block.to_le_bytes());
        bgdt[4..8].copy_from_slice(&inode_bitmap_block.to_le_bytes());
        bgdt[8..12].copy_from_slice(&inode_table_block.to_le_bytes());

        let inodes_per_block = BLOCK_SIZE / INODE_SIZE;
        let inode_table_blocks = (INODES_PER_GROUP as usize).div_ceil(inodes_per_block);
        let data_blocks_start = inode_table_block as usize + inode_table_blocks;
        let root_data_block = data_blocks_start as u32;
        let file_data_block = root_data_block + 1;

        // Root inode (#2): directory containing "." ".." "hello" (#11) and
        // "link" (#12, a symlink pointing at "hello").
        let root_inode_num = 2u32;
        let file_inode_num = 11u32;
        let symlink_inode_num = 12u32;

        let write_inode = |image: &mut [u8], inode_num: u32, mode: u16, size: u32, block0: u32| {
            let index = inode_num - 1;
            let idx_in_group = index % INODES_PER_GROUP;
            let byte_off = inode_table_block as usize * BLOCK_SIZE + idx_in_group as usize * INODE_SIZE;
            image[byte_off..byte_off + 2].copy_from_slice(&mode.to_le_bytes());
            image[byte_off + 4..byte_off + 8].copy_from_slice(&size.to_le_bytes());
            image[byte_off + 26..byte_off + 28].copy_from_slice(&1u16.to_le_bytes());
            image[byte_off + 40..byte_off + 44].copy_from_slice(&block0.to_le_bytes());
        };

        write_inode(&mut image, root_inode_num, EXT2_S_IFDIR, BLOCK_SIZE as u32, root_data_block);
        write_inode(&mut image, file_inode_num, EXT2_S_IFREG, 5, file_data_block);

        // Symlink target ("hello", 5 bytes) fits inline in the 60-byte
        // block-pointer area, so block0 is irrelevant here; overwrite the
        // whole block-pointer region with the target bytes afterwards.
        write_inode(&mut image, symlink_inode_num, EXT2_S_IFLNK, 5, 0);
        let symlink_idx_in_group = (symlink_inode_num - 1) % INODES_PER_GROUP;
        let symlink_byte_off =
            inode_table_block as usize * BLOCK_SIZE + symlink_idx_in_group as usize * INODE_SIZE;
        image[symlink_byte_off + 40..symlink_byte_off + 45].copy_from_slice(b"hello");

        // Root directory data block: dirents for "hello" -> #11 and
        // "link" -> #12.
        let dirent_off = root_data_block as usize * BLOCK_SIZE;
        image[dirent_off..dirent_off + 4].copy_from_slice(&file_inode_num.to_le_bytes());
        image[dirent_off + 4..dirent_off + 6].copy_from_slice(&16u16.to_le_bytes());
        image[dirent_off + 6] = 5; // name_len
        image[dirent_off + 8..dirent_off + 13].copy_from_slice(b"hello");

        let link_dirent_off = dirent_off + 16;
        image[link_dirent_off..link_dirent_off + 4].copy_from_slice(&symlink_inode_num.to_le_bytes());
        image[link_dirent_off + 4..link_dirent_off + 6]
            .copy_from_slice(&((BLOCK_SIZE - 16) as u16).to_le_bytes());
        image[link_dirent_off + 6] = 4; // name_len
        image[link_dirent_off + 8..link_dirent_off + 12].copy_from_slice(b"link");

        // File data block: "hello".
        let file_off = file_data_block as usize * BLOCK_SIZE;
        image[file_off..file_off + 5].copy_from_slice(b"hello");

        RamBlockDevice::from_image(String::from("test-ext2"), 1024, image)
    }

    #[test_case]
    fn mounts_and_reads_root_directory() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        let meta = fs.stat("/")?;
        assert_eq!(meta.kind, NodeKind::Directory);
        Ok(())
    }

    #[test_case]
    fn resolves_and_reads_a_file() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        let file = fs.open("/hello", OpenFlags::read_only())?;
        let mut buf = [0u8; 5];
        let n = file.read(0, &mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        Ok(())
    }

    #[test_case]
    fn missing_path_is_not_found() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        assert!(fs.open("/nope", OpenFlags::read_only()).is_err());
        Ok(())
    }

    #[test_case]
    fn chmod_preserves_file_type_bits() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        fs.chmod("/hello", 0o600)?;
        let meta = fs.stat("/hello")?;
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.kind, NodeKind::File);
        Ok(())
    }

    #[test_case]
    fn symlink_with_an_inline_target_resolves_to_the_same_bytes_as_the_real_file() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;

        let meta = fs.stat("/link")?;
        assert_eq!(meta.kind, NodeKind::Symlink);

        let target = fs.readlink("/link")?;
        assert_eq!(target, "hello");

        let direct = fs.open("/hello", OpenFlags::read_only())?;
        let mut direct_buf = [0u8; 5];
        direct.read(0, &mut direct_buf)?;

        let via_link = fs.open(&target, OpenFlags::read_only())?;
        let mut link_buf = [0u8; 5];
        via_link.read(0, &mut link_buf)?;

        assert_eq!(direct_buf, link_buf);
        Ok(())
    }

    #[test_case]
    fn readlink_on_a_regular_file_is_rejected() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        assert!(matches!(fs.readlink("/hello"), Err(e) if matches!(e, KernelError::FsError(FsError::NotASymlink))));
        Ok(())
    }

    #[test_case]
    fn reading_the_same_offset_twice_returns_identical_bytes() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        let file = fs.open("/hello", OpenFlags::read_only())?;

        let mut first = [0u8; 3];
        let mut second = [0u8; 3];
        file.read(1, &mut first)?;
        file.read(1, &mut second)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test_case]
    fn seeking_then_reading_matches_a_sequential_read_from_zero() -> KernelResult<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(build_test_image());
        let fs = Ext2Fs::mount(device)?;
        let file = fs.open("/hello", OpenFlags::read_only())?;

        let mut sequential = [0u8; 5];
        file.read(0, &mut sequential)?;

        let mut from_offset = [0u8; 2];
        file.read(3, &mut from_offset)?;

        assert_eq!(&from_offset[..], &sequential[3..5]);
        Ok(())
    }
}
