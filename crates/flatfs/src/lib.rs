//! FlatFS: a small Unix-style file system over a fixed-size block device.
//!
//! Disk layout:
//! superblock | inode blocks | (gap) | data blocks chained into a free list
//!
//! A single flat directory lives in the file owned by inode 0.

pub mod device;
pub mod directory;
pub mod error;
pub mod file_table;
pub mod inode;
pub mod layout;
pub mod superblock;

mod fs;

pub use device::{BlockDevice, FileDisk, MemDisk};
pub use error::{DeviceError, FsError};
pub use file_table::{FileHandle, OpenMode};
pub use fs::{FileSystem, FsStats, MountOptions, Whence};
pub use layout::BLOCK_SIZE;

pub type Result<T> = core::result::Result<T, FsError>;
