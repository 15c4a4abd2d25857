//! Per-file metadata: size, open-reference count, lock state and block map.
//!
//! The block map has 11 direct pointers and one indirect pointer to an index
//! block of 256 further pointers. Pointers are two-byte block numbers with
//! `UNUSED` (-1) for "not allocated".

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::FsError;
use crate::layout::{
    get_i16, inode_position, put_i16, record_config, slot_for, Slot, BLOCK_SIZE,
    DIRECT_POINTERS, INODE_SIZE, POINTERS_PER_BLOCK, UNUSED,
};
use crate::Result;

/// Open-time coordination state persisted in each inode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "i16", into = "i16")]
#[repr(i16)]
pub enum LockState {
    #[default]
    Free = 0,
    Reading = 1,
    Writing = 2,
    /// Left behind by a finished writer; treated like `Free` by writers.
    Committed = 3,
    /// A writer is waiting for current holders to close.
    WritePending = 4,
}

#[derive(Debug)]
pub struct InvalidLockState(i16);

impl fmt::Display for InvalidLockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid inode lock state {}", self.0)
    }
}

impl TryFrom<i16> for LockState {
    type Error = InvalidLockState;

    fn try_from(value: i16) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(LockState::Free),
            1 => Ok(LockState::Reading),
            2 => Ok(LockState::Writing),
            3 => Ok(LockState::Committed),
            4 => Ok(LockState::WritePending),
            other => Err(InvalidLockState(other)),
        }
    }
}

impl From<LockState> for i16 {
    fn from(state: LockState) -> Self {
        state as i16
    }
}

/// Outcome of trying to register a freshly allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Registered,
    InUse,
    /// The offset needs the index block, which does not exist yet.
    IndirectEmpty,
    /// A direct slot was requested while an earlier one is still empty.
    OutOfOrder,
}

/// Index block detached by [`Inode::release_indirect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedIndex {
    pub block: u32,
    /// Data blocks referenced from the index block.
    pub entries: Vec<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub length: i32,
    pub count: i16,
    pub flag: LockState,
    pub direct: [i16; DIRECT_POINTERS],
    pub indirect: i16,
}

impl Default for Inode {
    fn default() -> Self {
        Self::new()
    }
}

impl Inode {
    pub fn new() -> Self {
        Self {
            length: 0,
            count: 0,
            flag: LockState::Free,
            direct: [UNUSED; DIRECT_POINTERS],
            indirect: UNUSED,
        }
    }

    pub fn encode(&self) -> Result<[u8; INODE_SIZE]> {
        let mut record = [0u8; INODE_SIZE];
        bincode::serde::encode_into_slice(self, &mut record, record_config())?;
        Ok(record)
    }

    pub fn decode(record: &[u8]) -> Result<Self> {
        let (inode, _) = bincode::serde::decode_from_slice(record, record_config())?;
        Ok(inode)
    }

    pub fn load(device: &dyn BlockDevice, inumber: u16) -> Result<Self> {
        let (block, offset) = inode_position(inumber);
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block, &mut buf)?;
        Self::decode(&buf[offset..offset + INODE_SIZE])
    }

    /// Writes this record back, leaving the other inodes of its block intact.
    pub fn save(&self, device: &dyn BlockDevice, inumber: u16) -> Result<()> {
        let record = self.encode()?;
        let (block, offset) = inode_position(inumber);
        device.update_block(block, &mut |buf: &mut [u8; BLOCK_SIZE]| {
            buf[offset..offset + INODE_SIZE].copy_from_slice(&record)
        })?;
        Ok(())
    }

    /// Applies `f` to the persisted record within one read-modify-write of
    /// its block and returns the updated record.
    pub fn modify(device: &dyn BlockDevice, inumber: u16, f: impl FnOnce(&mut Inode)) -> Result<Self> {
        let (block, offset) = inode_position(inumber);
        let mut f = Some(f);
        let mut outcome = None;
        device.update_block(block, &mut |buf: &mut [u8; BLOCK_SIZE]| {
            let record = &mut buf[offset..offset + INODE_SIZE];
            outcome = Some(Self::decode(record).and_then(|mut inode| {
                if let Some(f) = f.take() {
                    f(&mut inode);
                }
                record.copy_from_slice(&inode.encode()?);
                Ok(inode)
            }));
        })?;
        outcome.unwrap_or_else(|| Err(FsError::Inconsistent(format!("inode {} not updated", inumber))))
    }

    pub fn size(&self) -> u32 {
        self.length.max(0) as u32
    }

    /// Physical block backing `byte_offset`, if one is allocated.
    pub fn find_block_number(&self, device: &dyn BlockDevice, byte_offset: u32) -> Result<Option<u32>> {
        let pointer = match slot_for(byte_offset) {
            Slot::Direct(index) => self.direct[index],
            Slot::Indirect(index) => {
                if self.indirect == UNUSED {
                    return Ok(None);
                }
                let buf = self.read_index(device)?;
                get_i16(&buf, index * 2)
            }
            Slot::Beyond => return Ok(None),
        };
        Ok(pointer_to_block(pointer))
    }

    /// Records `candidate` as the block backing `byte_offset`.
    ///
    /// Direct slots must be filled in order; indirect slots are written to the
    /// index block immediately, while direct slots only change this in-memory
    /// copy until the caller saves the inode.
    pub fn submit_block(
        &mut self,
        device: &dyn BlockDevice,
        byte_offset: u32,
        candidate: u32,
    ) -> Result<Submit> {
        let pointer = block_to_pointer(candidate)?;
        match slot_for(byte_offset) {
            Slot::Direct(index) => {
                if self.direct[index] != UNUSED {
                    return Ok(Submit::InUse);
                }
                if index > 0 && self.direct[index - 1] == UNUSED {
                    return Ok(Submit::OutOfOrder);
                }
                self.direct[index] = pointer;
                Ok(Submit::Registered)
            }
            Slot::Indirect(index) => {
                if self.indirect == UNUSED {
                    return Ok(Submit::IndirectEmpty);
                }
                let mut buf = self.read_index(device)?;
                if get_i16(&buf, index * 2) != UNUSED {
                    return Ok(Submit::InUse);
                }
                put_i16(pointer, &mut buf, index * 2);
                device.write_block(self.indirect as u32, &buf)?;
                Ok(Submit::Registered)
            }
            Slot::Beyond => Err(FsError::FileTooLarge),
        }
    }

    /// Installs `block` as the index block. Only allowed once every direct
    /// slot is in use and no index block exists yet.
    pub fn set_index_block(&mut self, device: &dyn BlockDevice, block: u32) -> Result<bool> {
        if self.direct.contains(&UNUSED) || self.indirect != UNUSED {
            return Ok(false);
        }
        let pointer = block_to_pointer(block)?;
        let mut buf = [0u8; BLOCK_SIZE];
        for slot in 0..POINTERS_PER_BLOCK {
            put_i16(UNUSED, &mut buf, slot * 2);
        }
        device.write_block(block, &buf)?;
        self.indirect = pointer;
        Ok(true)
    }

    /// Detaches the index block and hands back everything it referenced.
    pub fn release_indirect(&mut self, device: &dyn BlockDevice) -> Result<Option<ReleasedIndex>> {
        if self.indirect == UNUSED {
            return Ok(None);
        }
        let buf = self.read_index(device)?;
        let entries = (0..POINTERS_PER_BLOCK)
            .filter_map(|slot| pointer_to_block(get_i16(&buf, slot * 2)))
            .collect();
        let block = self.indirect as u32;
        self.indirect = UNUSED;
        Ok(Some(ReleasedIndex { block, entries }))
    }

    fn read_index(&self, device: &dyn BlockDevice) -> Result<[u8; BLOCK_SIZE]> {
        if self.indirect < 0 {
            return Err(FsError::Corrupt(format!(
                "index block pointer {}",
                self.indirect
            )));
        }
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(self.indirect as u32, &mut buf)?;
        Ok(buf)
    }
}

fn pointer_to_block(pointer: i16) -> Option<u32> {
    (pointer >= 0).then_some(pointer as u32)
}

fn block_to_pointer(block: u32) -> Result<i16> {
    i16::try_from(block)
        .map_err(|_| FsError::InvalidArgument(format!("block {} exceeds pointer range", block)))
}
