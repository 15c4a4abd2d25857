//! The single flat directory: one `(size, name)` entry per inode number.
//!
//! Names are kept as UTF-16 code units in fixed 30-unit buffers. Serialized
//! form (the content of inode 0's file): every size as a big-endian `i32` in
//! index order, followed by every name as a 60-byte UTF-16BE slot.

use crate::error::FsError;
use crate::layout::{get_i32, put_i32, DIR_ENTRY_SIZE, MAX_NAME_CHARS};
use crate::Result;

pub const ROOT_NAME: &str = "/";

type NameBuf = [u16; MAX_NAME_CHARS];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    sizes: Vec<u16>,
    names: Vec<NameBuf>,
}

/// Encodes `name` and cuts it to the name capacity without splitting a
/// surrogate pair.
fn normalize(name: &str) -> Vec<u16> {
    let mut units: Vec<u16> = name.encode_utf16().take(MAX_NAME_CHARS + 1).collect();
    if units.len() > MAX_NAME_CHARS {
        units.truncate(MAX_NAME_CHARS);
        if units
            .last()
            .is_some_and(|unit| (0xd800..0xdc00).contains(unit))
        {
            units.pop();
        }
    }
    units
}

impl Directory {
    pub fn new(max_inumber: u16) -> Self {
        let count = max_inumber.max(1) as usize;
        let mut directory = Self {
            sizes: vec![0; count],
            names: vec![[0; MAX_NAME_CHARS]; count],
        };
        directory.record(0, &normalize(ROOT_NAME));
        directory
    }

    pub fn capacity(&self) -> usize {
        self.sizes.len()
    }

    fn record(&mut self, inumber: usize, units: &[u16]) {
        self.sizes[inumber] = units.len() as u16;
        self.names[inumber][..units.len()].copy_from_slice(units);
    }

    fn name_units(&self, inumber: usize) -> &[u16] {
        &self.names[inumber][..self.sizes[inumber] as usize]
    }

    /// Claims the first free entry for `name`.
    pub fn ialloc(&mut self, name: &str) -> Option<u16> {
        let units = normalize(name);
        let inumber = (1..self.sizes.len()).find(|&i| self.sizes[i] == 0)?;
        self.record(inumber, &units);
        Some(inumber as u16)
    }

    /// Releases an entry; returns whether it was allocated. The root entry is
    /// never released.
    pub fn ifree(&mut self, inumber: u16) -> bool {
        let inumber = inumber as usize;
        if inumber == 0 || inumber >= self.sizes.len() || self.sizes[inumber] == 0 {
            return false;
        }
        self.sizes[inumber] = 0;
        true
    }

    pub fn namei(&self, name: &str) -> Option<u16> {
        let units = normalize(name);
        (0..self.sizes.len())
            .find(|&i| self.sizes[i] as usize == units.len() && self.name_units(i) == units)
            .map(|i| i as u16)
    }

    /// Allocated entries, root included.
    pub fn entries(&self) -> impl Iterator<Item = (u16, String)> + '_ {
        (0..self.sizes.len())
            .filter(|&i| self.sizes[i] > 0)
            .map(|i| (i as u16, String::from_utf16_lossy(self.name_units(i))))
    }

    pub fn serialized_len(&self) -> usize {
        self.sizes.len() * DIR_ENTRY_SIZE
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.serialized_len()];
        let mut offset = 0;
        for &size in &self.sizes {
            put_i32(size as i32, &mut data, offset);
            offset += 4;
        }
        for inumber in 0..self.sizes.len() {
            for (i, unit) in self.name_units(inumber).iter().enumerate() {
                data[offset + i * 2..offset + i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
            }
            offset += MAX_NAME_CHARS * 2;
        }
        data
    }

    /// Replaces every entry with the content of `data`.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.serialized_len() {
            return Err(FsError::Corrupt(format!(
                "directory of {} bytes, expected {}",
                data.len(),
                self.serialized_len()
            )));
        }
        let count = self.sizes.len();
        let mut sizes = Vec::with_capacity(count);
        for inumber in 0..count {
            let size = get_i32(data, inumber * 4);
            if !(0..=MAX_NAME_CHARS as i32).contains(&size) {
                return Err(FsError::Corrupt(format!(
                    "directory entry {} has name size {}",
                    inumber, size
                )));
            }
            sizes.push(size as u16);
        }
        if sizes[0] == 0 {
            return Err(FsError::Corrupt("root directory entry is empty".into()));
        }

        let mut offset = count * 4;
        for (inumber, &size) in sizes.iter().enumerate() {
            let mut name = [0u16; MAX_NAME_CHARS];
            for (i, unit) in name.iter_mut().take(size as usize).enumerate() {
                let at = offset + i * 2;
                *unit = u16::from_be_bytes([data[at], data[at + 1]]);
            }
            self.names[inumber] = name;
            offset += MAX_NAME_CHARS * 2;
        }
        self.sizes = sizes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn root_occupies_entry_zero() {
        let directory = Directory::new(8);
        assert_eq!(directory.namei("/"), Some(0));
        assert_eq!(directory.entries().collect::<Vec<_>>(), vec![(0, "/".to_string())]);
    }

    #[test]
    fn ialloc_takes_first_free_slot() {
        let mut directory = Directory::new(4);
        assert_eq!(directory.ialloc("a"), Some(1));
        assert_eq!(directory.ialloc("b"), Some(2));
        assert_eq!(directory.ialloc("c"), Some(3));
        assert_eq!(directory.ialloc("d"), None);

        assert!(directory.ifree(2));
        assert!(!directory.ifree(2));
        assert_eq!(directory.namei("b"), None);
        assert_eq!(directory.ialloc("dd"), Some(2));
        assert_eq!(directory.namei("dd"), Some(2));
    }

    #[test]
    fn reused_slot_does_not_match_stale_name() {
        let mut directory = Directory::new(4);
        let inumber = directory.ialloc("longer-name").unwrap();
        directory.ifree(inumber);
        assert_eq!(directory.ialloc("lo"), Some(inumber));
        assert_eq!(directory.namei("longer-name"), None);
        assert_eq!(directory.namei("lo"), Some(inumber));
    }

    #[test]
    fn root_and_out_of_range_cannot_be_freed() {
        let mut directory = Directory::new(4);
        assert!(!directory.ifree(0));
        assert!(!directory.ifree(4));
        assert_eq!(directory.namei("/"), Some(0));
    }

    #[test]
    fn long_names_are_truncated_consistently() {
        let mut directory = Directory::new(4);
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let inumber = directory.ialloc(long).unwrap();
        assert_eq!(directory.namei(long), Some(inumber));
        assert_eq!(directory.namei(&long[..30]), Some(inumber));
        assert_eq!(directory.namei(&long[..29]), None);
    }

    #[test]
    fn truncation_keeps_surrogate_pairs_whole() {
        let name = format!("{}{}", "x".repeat(29), '\u{1f600}');
        assert_eq!(normalize(&name).len(), 29);
    }

    #[test]
    fn deserialize_rejects_bad_blobs() {
        let mut directory = Directory::new(4);
        assert!(directory.deserialize(&[0; 10]).is_err());

        let mut blob = Directory::new(4).serialize();
        put_i32(0, &mut blob, 0);
        assert!(directory.deserialize(&blob).is_err());

        let mut blob = Directory::new(4).serialize();
        put_i32(31, &mut blob, 4);
        assert!(directory.deserialize(&blob).is_err());
    }

    #[test]
    fn serialized_layout_puts_sizes_first() {
        let mut directory = Directory::new(2);
        directory.ialloc("ab");
        let blob = directory.serialize();
        assert_eq!(blob.len(), 2 * DIR_ENTRY_SIZE);
        assert_eq!(&blob[..8], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&blob[8..10], &[0, b'/']);
        assert_eq!(&blob[68..72], &[0, b'a', 0, b'b']);
    }

    proptest! {
        #[test]
        fn serialize_round_trips(
            names in prop::collection::vec(prop::option::of("[a-zA-Z0-9._-]{1,40}"), 1..16)
        ) {
            let mut directory = Directory::new(names.len() as u16 + 1);
            for name in names.iter() {
                match name {
                    Some(name) => { directory.ialloc(name); }
                    None => {
                        let inumber = directory.ialloc("scratch").unwrap();
                        directory.ifree(inumber);
                    }
                }
            }
            let mut restored = Directory::new(names.len() as u16 + 1);
            restored.deserialize(&directory.serialize()).unwrap();
            prop_assert_eq!(restored.sizes.clone(), directory.sizes.clone());
            for inumber in 0..directory.capacity() {
                prop_assert_eq!(restored.name_units(inumber), directory.name_units(inumber));
            }
        }
    }
}
