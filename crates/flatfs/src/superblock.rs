//! Block 0: disk geometry plus the head of the free-block list.
//!
//! Free blocks are chained through their own first four bytes, so allocation
//! needs no bitmap: popping and pushing are each one block transfer.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::FsError;
use crate::inode::Inode;
use crate::layout::{
    first_data_block, get_i32, inode_area_blocks, put_i32, record_config, BLOCK_SIZE,
    FREE_LIST_END, INODES_PER_BLOCK, INODE_SIZE, MAX_BLOCKS, MAX_INODES,
};
use crate::Result;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub total_blocks: i32,
    pub total_inodes: i32,
    /// Head of the free list, or `FREE_LIST_END` when exhausted.
    pub free_list: i32,
}

impl SuperBlock {
    /// Reads block 0 as-is, without validating it.
    pub fn read(device: &dyn BlockDevice) -> Result<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf)?;
        let (superblock, _) = bincode::serde::decode_from_slice(&buf, record_config())?;
        Ok(superblock)
    }

    /// Reads block 0 and reformats the device when it does not describe it.
    pub fn load(device: &dyn BlockDevice, default_inodes: u16, format_if_invalid: bool) -> Result<Self> {
        let capacity = device.block_count();
        let mut superblock = Self::read(device)?;
        if superblock.is_valid(capacity) {
            return Ok(superblock);
        }
        if !format_if_invalid {
            return Err(FsError::Corrupt(format!(
                "superblock {:?} does not describe a {} block device",
                superblock, capacity
            )));
        }

        warn!(
            "{}: no valid superblock, formatting with {} inodes",
            device.name(),
            default_inodes
        );
        superblock = Self {
            total_blocks: capacity as i32,
            total_inodes: 0,
            free_list: FREE_LIST_END,
        };
        superblock.format(device, default_inodes)?;
        Ok(superblock)
    }

    pub fn is_valid(&self, capacity: u32) -> bool {
        if self.total_blocks as i64 != capacity as i64
            || self.total_inodes <= 0
            || self.total_inodes > MAX_INODES as i32
        {
            return false;
        }
        self.free_list == FREE_LIST_END || self.in_data_area(self.free_list as i64)
    }

    pub fn inode_count(&self) -> u16 {
        self.total_inodes as u16
    }

    pub fn data_start(&self) -> u32 {
        first_data_block(self.inode_count())
    }

    fn in_data_area(&self, block: i64) -> bool {
        block >= self.data_start() as i64 && block < self.total_blocks as i64
    }

    /// Resets the inode table and rebuilds the free list over the data area.
    pub fn format(&mut self, device: &dyn BlockDevice, inode_count: u16) -> Result<()> {
        let total_blocks = device.block_count();
        if total_blocks > MAX_BLOCKS {
            return Err(FsError::InvalidArgument(format!(
                "device has {} blocks, at most {} are addressable",
                total_blocks, MAX_BLOCKS
            )));
        }
        if inode_count == 0 || inode_count > MAX_INODES {
            return Err(FsError::InvalidArgument(format!(
                "inode count must be within 1..={}",
                MAX_INODES
            )));
        }
        let data_start = first_data_block(inode_count);
        if data_start >= total_blocks {
            return Err(FsError::InvalidArgument(format!(
                "{} inodes leave no data blocks on a {} block device",
                inode_count, total_blocks
            )));
        }

        let record = Inode::new().encode()?;
        let mut inode_block = [0u8; BLOCK_SIZE];
        for slot in 0..INODES_PER_BLOCK {
            inode_block[slot * INODE_SIZE..(slot + 1) * INODE_SIZE].copy_from_slice(&record);
        }
        for block in 1..=inode_area_blocks(inode_count) {
            device.write_block(block, &inode_block)?;
        }

        for block in data_start..total_blocks {
            let mut buf = [0u8; BLOCK_SIZE];
            let next = if block + 1 < total_blocks {
                (block + 1) as i32
            } else {
                FREE_LIST_END
            };
            put_i32(next, &mut buf, 0);
            device.write_block(block, &buf)?;
        }

        self.total_blocks = total_blocks as i32;
        self.total_inodes = inode_count as i32;
        self.free_list = data_start as i32;
        self.sync(device)?;

        info!(
            "{}: formatted {} blocks, {} inodes, data from block {}",
            device.name(),
            total_blocks,
            inode_count,
            data_start
        );
        Ok(())
    }

    pub fn sync(&self, device: &dyn BlockDevice) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        bincode::serde::encode_into_slice(self, &mut buf, record_config())?;
        device.write_block(0, &buf)?;
        Ok(())
    }

    /// Pops the head of the free list; `None` once the device is full.
    pub fn get_free_block(&mut self, device: &dyn BlockDevice) -> Result<Option<u32>> {
        if self.free_list == FREE_LIST_END {
            return Ok(None);
        }
        let block = self.free_list as u32;
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block, &mut buf)?;

        let next = get_i32(&buf, 0);
        if next != FREE_LIST_END && !self.in_data_area(next as i64) {
            return Err(FsError::Corrupt(format!(
                "free block {} links to {}",
                block, next
            )));
        }
        device.write_block(block, &[0; BLOCK_SIZE])?;
        self.free_list = next;

        debug!("allocated block {}", block);
        Ok(Some(block))
    }

    /// Pushes `block` back onto the free list.
    pub fn return_block(&mut self, device: &dyn BlockDevice, block: u32) -> Result<()> {
        if !self.in_data_area(block as i64) {
            return Err(FsError::InvalidArgument(format!(
                "block {} is not a data block",
                block
            )));
        }
        let mut buf = [0u8; BLOCK_SIZE];
        put_i32(self.free_list, &mut buf, 0);
        device.write_block(block, &buf)?;
        self.free_list = block as i32;

        debug!("released block {}", block);
        Ok(())
    }

    /// Walks the free list from its head.
    pub fn free_blocks(&self, device: &dyn BlockDevice) -> Result<Vec<u32>> {
        let mut blocks = Vec::new();
        let mut next = self.free_list;
        let mut buf = [0u8; BLOCK_SIZE];
        while next != FREE_LIST_END {
            if !self.in_data_area(next as i64) || blocks.len() >= self.total_blocks as usize {
                return Err(FsError::Corrupt(format!(
                    "free list broken after {} blocks at {}",
                    blocks.len(),
                    next
                )));
            }
            blocks.push(next as u32);
            device.read_block(next as u32, &mut buf)?;
            next = get_i32(&buf, 0);
        }
        Ok(blocks)
    }
}
