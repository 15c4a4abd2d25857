use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error::DeviceError;
use crate::layout::BLOCK_SIZE;

pub type Block = [u8; BLOCK_SIZE];

/// Fixed-size block storage. Every call blocks until the transfer completes.
pub trait BlockDevice: Send + Sync {
    /// Device name (for logging)
    fn name(&self) -> &str;

    /// Capacity in blocks
    fn block_count(&self) -> u32;

    fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), DeviceError>;

    fn write_block(&self, block: u32, buf: &Block) -> Result<(), DeviceError>;

    /// Read-modify-write of one block.
    ///
    /// The default is two separate transfers; implementations that can hold a
    /// lock across both should override it so concurrent updates of the same
    /// block do not lose each other's changes.
    fn update_block(
        &self,
        block: u32,
        f: &mut dyn FnMut(&mut Block),
    ) -> Result<(), DeviceError> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf)?;
        f(&mut buf);
        self.write_block(block, &buf)
    }
}

fn check_range(block: u32, count: u32) -> Result<(), DeviceError> {
    if block >= count {
        return Err(DeviceError::OutOfRange { block, count });
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RAM-backed disk, zero-filled on creation.
pub struct MemDisk {
    blocks: Mutex<Vec<Block>>,
}

impl MemDisk {
    pub fn new(block_count: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; block_count as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn name(&self) -> &str {
        "memdisk"
    }

    fn block_count(&self) -> u32 {
        lock(&self.blocks).len() as u32
    }

    fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), DeviceError> {
        let blocks = lock(&self.blocks);
        check_range(block, blocks.len() as u32)?;
        buf.copy_from_slice(&blocks[block as usize]);
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &Block) -> Result<(), DeviceError> {
        let mut blocks = lock(&self.blocks);
        check_range(block, blocks.len() as u32)?;
        blocks[block as usize].copy_from_slice(buf);
        Ok(())
    }

    fn update_block(
        &self,
        block: u32,
        f: &mut dyn FnMut(&mut Block),
    ) -> Result<(), DeviceError> {
        let mut blocks = lock(&self.blocks);
        check_range(block, blocks.len() as u32)?;
        f(&mut blocks[block as usize]);
        Ok(())
    }
}

/// Disk image stored in a host file; block `n` lives at byte `n * BLOCK_SIZE`.
pub struct FileDisk {
    file: Mutex<File>,
    block_count: u32,
}

impl FileDisk {
    /// Opens an existing image. Trailing bytes short of a full block are ignored.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let block_count = (file.metadata()?.len() / BLOCK_SIZE as u64) as u32;
        Ok(Self {
            file: Mutex::new(file),
            block_count,
        })
    }

    /// Creates (or resizes) an image holding exactly `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u32) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_count as u64 * BLOCK_SIZE as u64)?;
        debug!("disk image sized to {} blocks", block_count);
        Ok(Self {
            file: Mutex::new(file),
            block_count,
        })
    }

    fn seek_to(file: &mut File, block: u32) -> Result<(), DeviceError> {
        file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn name(&self) -> &str {
        "filedisk"
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), DeviceError> {
        check_range(block, self.block_count)?;
        let mut file = lock(&self.file);
        Self::seek_to(&mut file, block)?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &Block) -> Result<(), DeviceError> {
        check_range(block, self.block_count)?;
        let mut file = lock(&self.file);
        Self::seek_to(&mut file, block)?;
        file.write_all(buf)?;
        Ok(())
    }

    fn update_block(
        &self,
        block: u32,
        f: &mut dyn FnMut(&mut Block),
    ) -> Result<(), DeviceError> {
        check_range(block, self.block_count)?;
        let mut file = lock(&self.file);
        let mut buf = [0u8; BLOCK_SIZE];
        Self::seek_to(&mut file, block)?;
        file.read_exact(&mut buf)?;
        f(&mut buf);
        Self::seek_to(&mut file, block)?;
        file.write_all(&buf)?;
        Ok(())
    }
}
