use thiserror::Error;

use crate::file_table::OpenMode;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("block {block} out of range (device has {count} blocks)")]
    OutOfRange { block: u32, count: u32 },

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("device failure: {0}")]
    Device(#[from] DeviceError),

    #[error("record encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("record decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("descriptor is not open")]
    BadDescriptor,

    #[error("invalid open mode: {0:?}")]
    InvalidMode(String),

    #[error("invalid whence: {0}")]
    InvalidWhence(i32),

    #[error("seek to {position} outside file of {size} bytes")]
    SeekOutOfRange { position: i64, size: u32 },

    #[error("operation not permitted in {0:?} mode")]
    ModeMismatch(OpenMode),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("no free blocks left on device")]
    NoSpace,

    #[error("directory is full")]
    DirectoryFull,

    #[error("file would exceed the maximum size")]
    FileTooLarge,

    #[error("block map inconsistency: {0}")]
    Inconsistent(String),

    #[error("inode {0} is shared and cannot be truncated")]
    Busy(u16),

    #[error("corrupt file system: {0}")]
    Corrupt(String),
}
