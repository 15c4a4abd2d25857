//! Open-file table: registers descriptors and arbitrates concurrent opens of
//! the same inode through its persisted lock state.
//!
//! A caller whose open conflicts with the current lock state sleeps on the
//! table's condition variable. Every release wakes all sleepers, which then
//! re-check their inode from the top.

use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::device::BlockDevice;
use crate::directory::{Directory, ROOT_NAME};
use crate::error::FsError;
use crate::inode::{Inode, LockState};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        self != OpenMode::Read
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "w+" => Ok(OpenMode::ReadWrite),
            "a" => Ok(OpenMode::Append),
            other => Err(FsError::InvalidMode(other.to_string())),
        }
    }
}

/// Mutable part of a descriptor, guarded by the descriptor's own lock.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub inode: Inode,
    pub seek: u32,
    pub share_count: u32,
}

#[derive(Debug)]
pub struct FileTableEntry {
    inumber: u16,
    mode: OpenMode,
    state: Mutex<EntryState>,
}

impl FileTableEntry {
    fn new(inode: Inode, inumber: u16, mode: OpenMode) -> Self {
        let seek = if mode == OpenMode::Append { inode.size() } else { 0 };
        Self {
            inumber,
            mode,
            state: Mutex::new(EntryState {
                inode,
                seek,
                share_count: 1,
            }),
        }
    }

    pub fn inumber(&self) -> u16 {
        self.inumber
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the descriptor, failing once its last share has been closed.
    pub(crate) fn lock_open(&self) -> Result<MutexGuard<'_, EntryState>> {
        let state = self.lock();
        if state.share_count == 0 {
            return Err(FsError::BadDescriptor);
        }
        Ok(state)
    }
}

/// Opaque handle to an open file. Clones refer to the same descriptor.
#[derive(Debug, Clone)]
pub struct FileHandle(pub(crate) Arc<FileTableEntry>);

impl FileHandle {
    pub fn inumber(&self) -> u16 {
        self.0.inumber()
    }

    pub fn mode(&self) -> OpenMode {
        self.0.mode()
    }
}

pub(crate) struct TableState {
    entries: Vec<Arc<FileTableEntry>>,
    pub directory: Directory,
}

impl TableState {
    fn remove(&mut self, entry: &Arc<FileTableEntry>) -> bool {
        match self.entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

pub struct FileTable {
    state: Mutex<TableState>,
    released: Condvar,
}

impl FileTable {
    pub fn new(directory: Directory) -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: Vec::new(),
                directory,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, TableState>) -> MutexGuard<'a, TableState> {
        self.released
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no descriptor is open and returns the table still locked.
    pub(crate) fn lock_idle(&self) -> MutexGuard<'_, TableState> {
        let mut state = self.lock();
        while !state.entries.is_empty() {
            state = self.wait(state);
        }
        state
    }

    pub fn with_directory<T>(&self, f: impl FnOnce(&mut Directory) -> T) -> T {
        f(&mut self.lock().directory)
    }

    /// Opens `name`, creating it for writable modes.
    pub fn falloc(&self, device: &dyn BlockDevice, name: &str, mode: OpenMode) -> Result<Arc<FileTableEntry>> {
        self.acquire(device, name, mode, true)
    }

    /// Waits until `name` may be opened in `mode`, then registers a descriptor.
    pub(crate) fn acquire(
        &self,
        device: &dyn BlockDevice,
        name: &str,
        mode: OpenMode,
        create: bool,
    ) -> Result<Arc<FileTableEntry>> {
        let mut state = self.lock();
        let (inumber, mut inode) = loop {
            let found = if name == ROOT_NAME {
                Some(0)
            } else {
                state.directory.namei(name)
            };

            let Some(inumber) = found else {
                if mode == OpenMode::Read || !create {
                    return Err(FsError::NotFound(name.to_string()));
                }
                let inumber = state.directory.ialloc(name).ok_or(FsError::DirectoryFull)?;
                let mut inode = Inode::new();
                inode.flag = LockState::Writing;
                debug!("created {:?} as inode {}", name, inumber);
                break (inumber, inode);
            };

            let mut inode = Inode::load(device, inumber)?;
            if mode == OpenMode::Read {
                match inode.flag {
                    LockState::Free => {
                        inode.flag = LockState::Reading;
                        break (inumber, inode);
                    }
                    LockState::Reading => break (inumber, inode),
                    _ => {}
                }
            } else {
                match inode.flag {
                    LockState::Free | LockState::Committed => {
                        inode.flag = LockState::Writing;
                        break (inumber, inode);
                    }
                    LockState::Reading | LockState::Writing => {
                        // The holder may be saving its own copy concurrently.
                        inode = Inode::modify(device, inumber, |inode| {
                            inode.flag = LockState::WritePending
                        })?;
                    }
                    LockState::WritePending => {}
                }
            }
            debug!("open {:?} ({:?}) waits on inode {} in {:?}", name, mode, inumber, inode.flag);
            state = self.wait(state);
        };

        inode.count += 1;
        inode.save(device, inumber)?;
        let entry = Arc::new(FileTableEntry::new(inode, inumber, mode));
        state.entries.push(Arc::clone(&entry));
        debug!("opened {:?} as inode {} ({:?})", name, inumber, mode);
        Ok(entry)
    }

    /// Unregisters `entry`, drops its reference on the inode and wakes every
    /// waiting opener. Returns false if the entry was not registered.
    pub fn ffree(&self, device: &dyn BlockDevice, entry: &Arc<FileTableEntry>) -> Result<bool> {
        let mut state = self.lock();
        self.release(&mut state, device, entry)
    }

    /// Like [`FileTable::ffree`], but also removes the inode's directory entry
    /// before any other opener can observe the released inode.
    pub fn funlink(&self, device: &dyn BlockDevice, entry: &Arc<FileTableEntry>) -> Result<bool> {
        let mut state = self.lock();
        if !self.release(&mut state, device, entry)? {
            return Ok(false);
        }
        Ok(state.directory.ifree(entry.inumber))
    }

    fn release(
        &self,
        state: &mut TableState,
        device: &dyn BlockDevice,
        entry: &Arc<FileTableEntry>,
    ) -> Result<bool> {
        if !state.remove(entry) {
            return Ok(false);
        }
        // Other descriptors may share this inode, so the persisted record is
        // the authoritative reference count, not this entry's copy.
        let result = Inode::modify(device, entry.inumber, |inode| {
            inode.count = (inode.count - 1).max(0);
            if inode.count == 0 {
                inode.flag = LockState::Free;
            }
        });
        self.released.notify_all();
        let inode = result?;
        debug!(
            "released inode {} (count {}, {:?})",
            entry.inumber, inode.count, inode.flag
        );
        Ok(true)
    }

    pub fn fempty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
