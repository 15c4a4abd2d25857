//! On-disk geometry and byte marshalling.
//!
//! Everything here is a pure computation over block numbers, byte offsets and
//! buffers; no function in this module touches a device.

pub const BLOCK_SIZE: usize = 512;

pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
pub const DIRECT_POINTERS: usize = 11;
/// Two-byte block pointers held by one index block.
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 2;
pub const MAX_FILE_BLOCKS: usize = DIRECT_POINTERS + POINTERS_PER_BLOCK;
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// Marks an unallocated direct/indirect pointer.
pub const UNUSED: i16 = -1;
/// Terminates the free list.
pub const FREE_LIST_END: i32 = -1;

pub const DEFAULT_INODES: u16 = 64;
pub const MAX_NAME_CHARS: usize = 30;
/// Bytes one directory entry occupies in the serialized table.
pub const DIR_ENTRY_SIZE: usize = 4 + MAX_NAME_CHARS * 2;
/// Block pointers are stored as `i16`, which caps the device size.
pub const MAX_BLOCKS: u32 = i16::MAX as u32 + 1;

/// Inode counts whose serialized directory still fits in one file.
pub const MAX_INODES: u16 = (MAX_FILE_SIZE / DIR_ENTRY_SIZE) as u16;

/// Codec settings shared by the superblock and inode records.
pub fn record_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Block holding inode `inumber` and the byte offset of its record.
pub fn inode_position(inumber: u16) -> (u32, usize) {
    let inumber = inumber as usize;
    let block = 1 + inumber / INODES_PER_BLOCK;
    let offset = (inumber % INODES_PER_BLOCK) * INODE_SIZE;
    (block as u32, offset)
}

/// Blocks `1..=inode_area_blocks(n)` hold the inode table.
pub fn inode_area_blocks(total_inodes: u16) -> u32 {
    (total_inodes as usize * INODE_SIZE).div_ceil(BLOCK_SIZE) as u32
}

pub fn first_data_block(total_inodes: u16) -> u32 {
    (2 + total_inodes as usize * INODE_SIZE / BLOCK_SIZE) as u32
}

/// Where a file's logical block lives in its inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Direct(usize),
    Indirect(usize),
    /// Beyond what one index block can address.
    Beyond,
}

pub fn slot_for(byte_offset: u32) -> Slot {
    let index = byte_offset as usize / BLOCK_SIZE;
    if index < DIRECT_POINTERS {
        Slot::Direct(index)
    } else if index < MAX_FILE_BLOCKS {
        Slot::Indirect(index - DIRECT_POINTERS)
    } else {
        Slot::Beyond
    }
}

pub fn get_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub fn put_i16(value: i16, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub fn put_i32(value: i32, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
