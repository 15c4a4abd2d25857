#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use flatfs::device::Block;
use flatfs::inode::Inode;
use flatfs::{BlockDevice, DeviceError, FileSystem, MemDisk};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mounted(blocks: u32) -> (Arc<MemDisk>, FileSystem) {
    init_logger();
    let disk = Arc::new(MemDisk::new(blocks));
    let fs = FileSystem::mount(disk.clone()).unwrap();
    (disk, fs)
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Every data block is either on the free list or referenced by exactly one
/// inode, never both. Only meaningful while no write is in flight.
pub fn assert_blocks_accounted(fs: &FileSystem) {
    let leaked = leaked_blocks(fs);
    assert!(leaked.is_empty(), "leaked blocks {:?}", leaked);
}

/// Checks that no block is both free and owned, and returns the data blocks
/// that are neither.
pub fn leaked_blocks(fs: &FileSystem) -> Vec<u32> {
    let device = fs.device().as_ref();
    let stats = fs.stats().unwrap();
    let free = fs.free_blocks().unwrap();

    let mut seen = BTreeSet::new();
    for &block in &free {
        assert!(seen.insert(block), "block {} twice on the free list", block);
    }
    for inumber in 0..stats.total_inodes {
        for block in referenced_blocks(device, inumber) {
            assert!(
                seen.insert(block),
                "block {} of inode {} is free or shared",
                block,
                inumber
            );
        }
    }
    assert!(
        seen.iter().all(|&b| b >= stats.data_start && b < stats.total_blocks),
        "foreign blocks in {:?}",
        seen
    );
    (stats.data_start..stats.total_blocks)
        .filter(|block| !seen.contains(block))
        .collect()
}

pub fn referenced_blocks(device: &dyn BlockDevice, inumber: u16) -> Vec<u32> {
    let mut inode = Inode::load(device, inumber).unwrap();
    let mut blocks: Vec<u32> = inode
        .direct
        .iter()
        .filter(|&&p| p >= 0)
        .map(|&p| p as u32)
        .collect();
    if let Some(index) = inode.release_indirect(device).unwrap() {
        blocks.push(index.block);
        blocks.extend(index.entries);
    }
    blocks
}

/// `MemDisk` with injectable faults. Reads fail for good once their budget
/// runs out; a write fault hits exactly one write (`write_block` or
/// `update_block`) and later writes succeed again.
pub struct FlakyDisk {
    inner: MemDisk,
    reads_left: AtomicI32,
    writes_before_fault: AtomicI32,
}

impl FlakyDisk {
    pub fn new(blocks: u32) -> Self {
        Self {
            inner: MemDisk::new(blocks),
            reads_left: AtomicI32::new(i32::MAX),
            writes_before_fault: AtomicI32::new(-1),
        }
    }

    pub fn fail_reads_after(&self, reads: i32) {
        self.reads_left.store(reads, Ordering::SeqCst);
    }

    pub fn heal_reads(&self) {
        self.reads_left.store(i32::MAX, Ordering::SeqCst);
    }

    /// Lets `writes` writes through, then fails the next one.
    pub fn fail_write_after(&self, writes: i32) {
        self.writes_before_fault.store(writes, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), DeviceError> {
        if self.writes_before_fault.fetch_sub(1, Ordering::SeqCst) == 0 {
            return Err(io::Error::other("injected write failure").into());
        }
        Ok(())
    }
}

impl BlockDevice for FlakyDisk {
    fn name(&self) -> &str {
        "flaky"
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), DeviceError> {
        if self.reads_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(io::Error::other("injected read failure").into());
        }
        self.inner.read_block(block, buf)
    }

    fn write_block(&self, block: u32, buf: &Block) -> Result<(), DeviceError> {
        self.check_write()?;
        self.inner.write_block(block, buf)
    }

    fn update_block(
        &self,
        block: u32,
        f: &mut dyn FnMut(&mut Block),
    ) -> Result<(), DeviceError> {
        self.check_write()?;
        self.inner.update_block(block, f)
    }
}

pub fn flaky_mounted(blocks: u32) -> (Arc<FlakyDisk>, FileSystem) {
    init_logger();
    let disk = Arc::new(FlakyDisk::new(blocks));
    let fs = FileSystem::mount(disk.clone()).unwrap();
    (disk, fs)
}
