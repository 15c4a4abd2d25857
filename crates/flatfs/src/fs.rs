use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::device::BlockDevice;
use crate::directory::{Directory, ROOT_NAME};
use crate::error::FsError;
use crate::file_table::{EntryState, FileHandle, FileTable, FileTableEntry, OpenMode};
use crate::inode::{Inode, LockState, Submit};
use crate::layout::{BLOCK_SIZE, DEFAULT_INODES, UNUSED};
use crate::superblock::SuperBlock;
use crate::Result;

#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Inode count used when the device has to be formatted at mount.
    pub default_inodes: u16,
    /// Format a device whose superblock does not describe it, instead of
    /// failing the mount.
    pub format_if_invalid: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            default_inodes: DEFAULT_INODES,
            format_if_invalid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = FsError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(FsError::InvalidWhence(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_blocks: u32,
    pub total_inodes: u16,
    pub data_start: u32,
    pub free_blocks: u32,
    pub files: u16,
}

/// A mounted device. Shareable across threads by reference.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    superblock: Mutex<SuperBlock>,
    table: FileTable,
}

impl FileSystem {
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::mount_with(device, MountOptions::default())
    }

    pub fn mount_with(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let superblock = SuperBlock::load(
            device.as_ref(),
            options.default_inodes,
            options.format_if_invalid,
        )?;
        clear_open_state(device.as_ref(), superblock.inode_count())?;
        let directory = Directory::new(superblock.inode_count());
        let fs = Self {
            device,
            superblock: Mutex::new(superblock),
            table: FileTable::new(directory),
        };

        let root = fs.open(ROOT_NAME, OpenMode::Read)?;
        let loaded = fs.load_directory(&root);
        fs.close(&root)?;
        loaded?;

        info!(
            "{}: mounted {} blocks, {} inodes",
            fs.device.name(),
            superblock.total_blocks,
            superblock.total_inodes
        );
        Ok(fs)
    }

    fn load_directory(&self, root: &FileHandle) -> Result<()> {
        let size = self.fsize(root)? as usize;
        if size == 0 {
            return Ok(());
        }
        let mut data = vec![0u8; size];
        let read = self.read(root, &mut data)?;
        data.truncate(read);
        self.table.with_directory(|directory| directory.deserialize(&data))
    }

    fn superblock(&self) -> MutexGuard<'_, SuperBlock> {
        self.superblock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the directory into inode 0's file and persists the superblock.
    pub fn sync(&self) -> Result<()> {
        let data = self.table.with_directory(|directory| directory.serialize());
        let root = self.open(ROOT_NAME, OpenMode::Write)?;
        let written = self.write(&root, &data);
        self.close(&root)?;
        written?;
        self.superblock().sync(self.device.as_ref())?;
        debug!("synced directory ({} bytes) and superblock", data.len());
        Ok(())
    }

    /// Syncs and releases the device.
    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        info!("{}: unmounted", self.device.name());
        Ok(())
    }

    /// Reformats the device for `max_files` inodes once every descriptor has
    /// been closed.
    pub fn format(&self, max_files: u16) -> Result<()> {
        let mut table = self.table.lock_idle();
        let mut superblock = self.superblock();
        superblock.format(self.device.as_ref(), max_files)?;
        table.directory = Directory::new(superblock.inode_count());
        Ok(())
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> Result<FileHandle> {
        self.open_inner(name, mode, true)
    }

    fn open_inner(&self, name: &str, mode: OpenMode, create: bool) -> Result<FileHandle> {
        let entry = self.table.acquire(self.device.as_ref(), name, mode, create)?;
        if mode == OpenMode::Write {
            let truncated = {
                let mut state = entry.lock();
                self.truncate(entry.as_ref(), &mut state)
            };
            if let Err(err) = truncated {
                self.table.ffree(self.device.as_ref(), &entry)?;
                return Err(err);
            }
        }
        Ok(FileHandle(entry))
    }

    /// Returns every block of the file to the free list and zeroes its length.
    fn truncate(&self, entry: &FileTableEntry, state: &mut EntryState) -> Result<()> {
        let device = self.device.as_ref();
        if state.inode.count != 1 {
            return Err(FsError::Busy(entry.inumber()));
        }
        let original = state.inode;
        let mut blocks = Vec::new();
        if let Some(index) = state.inode.release_indirect(device)? {
            blocks.extend(index.entries);
            blocks.push(index.block);
        }
        for pointer in state.inode.direct.iter_mut() {
            if *pointer != UNUSED {
                blocks.push(*pointer as u32);
                *pointer = UNUSED;
            }
        }
        state.inode.length = 0;

        // The cleared record must be on disk before any of its blocks is free.
        if let Err(err) = state.inode.save(device, entry.inumber()) {
            state.inode = original;
            return Err(err);
        }
        state.seek = 0;

        let mut superblock = self.superblock();
        let mut first_error = None;
        let mut lost = 0;
        for block in blocks {
            if let Err(err) = superblock.return_block(device, block) {
                lost += 1;
                first_error.get_or_insert(err);
            }
        }
        drop(superblock);
        match first_error {
            None => Ok(()),
            Some(err) => {
                error!(
                    "truncating inode {} lost {} blocks: {}",
                    entry.inumber(),
                    lost,
                    err
                );
                Err(err)
            }
        }
    }

    pub fn read(&self, fd: &FileHandle, buffer: &mut [u8]) -> Result<usize> {
        if !fd.mode().can_read() {
            return Err(FsError::ModeMismatch(fd.mode()));
        }
        let device = self.device.as_ref();
        let mut state = fd.0.lock_open()?;
        let size = state.inode.size();
        let mut read = 0;
        let mut block = [0u8; BLOCK_SIZE];

        while read < buffer.len() && state.seek < size {
            let Some(number) = state.inode.find_block_number(device, state.seek)? else {
                break;
            };
            device.read_block(number, &mut block)?;
            let offset = state.seek as usize % BLOCK_SIZE;
            let len = (BLOCK_SIZE - offset)
                .min(buffer.len() - read)
                .min((size - state.seek) as usize);
            buffer[read..read + len].copy_from_slice(&block[offset..offset + len]);
            read += len;
            state.seek += len as u32;
        }
        Ok(read)
    }

    pub fn write(&self, fd: &FileHandle, buffer: &[u8]) -> Result<usize> {
        if !fd.mode().can_write() {
            return Err(FsError::ModeMismatch(fd.mode()));
        }
        let device = self.device.as_ref();
        let mut state = fd.0.lock_open()?;
        let mut written = 0;
        let result = self.write_blocks(&mut state, buffer, &mut written);
        let saved = state.inode.save(device, fd.inumber());
        match result {
            Ok(()) => saved.map(|()| written),
            Err(err) => {
                error!(
                    "write to inode {} stopped after {} bytes: {}",
                    fd.inumber(),
                    written,
                    err
                );
                if let Err(save_err) = saved {
                    error!("inode {} not saved: {}", fd.inumber(), save_err);
                }
                Err(err)
            }
        }
    }

    fn write_blocks(&self, state: &mut EntryState, buffer: &[u8], written: &mut usize) -> Result<()> {
        let device = self.device.as_ref();
        let mut block = [0u8; BLOCK_SIZE];
        while *written < buffer.len() {
            let number = match state.inode.find_block_number(device, state.seek)? {
                Some(number) => number,
                None => self.allocate_block(&mut state.inode, state.seek)?,
            };
            device.read_block(number, &mut block)?;
            let offset = state.seek as usize % BLOCK_SIZE;
            let len = (BLOCK_SIZE - offset).min(buffer.len() - *written);
            block[offset..offset + len].copy_from_slice(&buffer[*written..*written + len]);
            device.write_block(number, &block)?;

            *written += len;
            state.seek += len as u32;
            if state.seek > state.inode.size() {
                state.inode.length = state.seek as i32;
            }
        }
        Ok(())
    }

    /// Takes a free block and registers it at `offset`, installing an index
    /// block first when the offset lies past the direct pointers.
    fn allocate_block(&self, inode: &mut Inode, offset: u32) -> Result<u32> {
        let device = self.device.as_ref();
        let mut superblock = self.superblock();
        let candidate = superblock.get_free_block(device)?.ok_or(FsError::NoSpace)?;

        let result = register_block(&mut superblock, device, inode, offset, candidate);
        if result.is_err() {
            if let Err(err) = superblock.return_block(device, candidate) {
                error!("block {} lost: {}", candidate, err);
            }
        }
        result.map(|()| candidate)
    }

    pub fn seek(&self, fd: &FileHandle, offset: i64, whence: Whence) -> Result<u32> {
        let mut state = fd.0.lock_open()?;
        let size = state.inode.size();
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => state.seek as i64,
            Whence::End => size as i64,
        };
        let position = base
            .checked_add(offset)
            .filter(|position| (0..=size as i64).contains(position))
            .ok_or(FsError::SeekOutOfRange {
                position: base.saturating_add(offset),
                size,
            })?;
        state.seek = position as u32;
        Ok(state.seek)
    }

    /// Adds a share to `fd`; it stays open until every share is closed.
    pub fn dup(&self, fd: &FileHandle) -> Result<FileHandle> {
        let mut state = fd.0.lock_open()?;
        state.share_count += 1;
        Ok(fd.clone())
    }

    pub fn close(&self, fd: &FileHandle) -> Result<()> {
        {
            let mut state = fd.0.lock_open()?;
            state.share_count -= 1;
            if state.share_count > 0 {
                return Ok(());
            }
        }
        if self.table.ffree(self.device.as_ref(), &fd.0)? {
            Ok(())
        } else {
            Err(FsError::BadDescriptor)
        }
    }

    /// Truncates `name` under the write lock and removes it from the
    /// directory. Waits for current holders of the file to close it first.
    pub fn delete(&self, name: &str) -> Result<()> {
        if name == ROOT_NAME {
            return Err(FsError::InvalidArgument("cannot delete the root directory".into()));
        }
        let fd = self.open_inner(name, OpenMode::Write, false)?;
        fd.0.lock().share_count = 0;
        if self.table.funlink(self.device.as_ref(), &fd.0)? {
            debug!("deleted {:?} (inode {})", name, fd.inumber());
            Ok(())
        } else {
            Err(FsError::NotFound(name.to_string()))
        }
    }

    pub fn fsize(&self, fd: &FileHandle) -> Result<u32> {
        Ok(fd.0.lock_open()?.inode.size())
    }

    /// Allocated directory entries, excluding the root.
    pub fn list(&self) -> Vec<(u16, String)> {
        self.table.with_directory(|directory| {
            directory
                .entries()
                .filter(|&(inumber, _)| inumber != 0)
                .collect()
        })
    }

    /// Current members of the free list, head first.
    pub fn free_blocks(&self) -> Result<Vec<u32>> {
        self.superblock().free_blocks(self.device.as_ref())
    }

    pub fn stats(&self) -> Result<FsStats> {
        let files = self.list().len() as u16;
        let superblock = self.superblock();
        Ok(FsStats {
            total_blocks: superblock.total_blocks as u32,
            total_inodes: superblock.inode_count(),
            data_start: superblock.data_start(),
            free_blocks: superblock.free_blocks(self.device.as_ref())?.len() as u32,
            files,
        })
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}

/// Records `candidate` in `inode`, taking a second free block for the index
/// block when needed. On failure the caller still owns `candidate`.
fn register_block(
    superblock: &mut SuperBlock,
    device: &dyn BlockDevice,
    inode: &mut Inode,
    offset: u32,
    candidate: u32,
) -> Result<()> {
    let mut status = inode.submit_block(device, offset, candidate)?;
    if status == Submit::IndirectEmpty {
        let index = superblock.get_free_block(device)?.ok_or(FsError::NoSpace)?;
        let installed = inode.set_index_block(device, index);
        if !matches!(installed, Ok(true)) {
            superblock.return_block(device, index)?;
        }
        if !installed? {
            return Err(FsError::Inconsistent(format!(
                "index block refused at offset {}",
                offset
            )));
        }
        debug!("installed index block {}", index);
        status = inode.submit_block(device, offset, candidate)?;
    }

    match status {
        Submit::Registered => Ok(()),
        other => Err(FsError::Inconsistent(format!(
            "block submission at offset {} returned {:?}",
            offset, other
        ))),
    }
}

/// Nothing is open right after mount, so reference counts and lock states
/// left behind by an unclean shutdown are stale.
fn clear_open_state(device: &dyn BlockDevice, inode_count: u16) -> Result<()> {
    for inumber in 0..inode_count {
        let mut inode = Inode::load(device, inumber)?;
        if inode.count != 0 || inode.flag != LockState::Free {
            warn!(
                "inode {} left open ({} refs, {:?}); resetting",
                inumber, inode.count, inode.flag
            );
            inode.count = 0;
            inode.flag = LockState::Free;
            inode.save(device, inumber)?;
        }
    }
    Ok(())
}
