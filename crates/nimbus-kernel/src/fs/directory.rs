//! Directory: a fixed table of name-to-header-sector entries, backed by a
//! regular file.
//!
//! On disk each in-use entry is the fixed record followed by its name,
//! null-padded to a 4-byte boundary; free slots are not serialized at all,
//! so readers walk the records by `total_size`.

use crate::error::FsError;
use crate::fs::open_file::OpenFile;
use crate::fs::synch_disk::SynchDisk;
use bytemuck::bytes_of;
use log::debug;
use nimbus_fs::{padded_name_size, Bitmap, RawDirEntry, DIR_ENTRY_FIXED_SIZE, NUM_DIR_ENTRIES};

#[derive(Debug, Clone, Default)]
struct DirSlot {
    in_use: bool,
    sector: u32,
    name: String,
}

pub struct Directory {
    table: Vec<DirSlot>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    /// An empty directory table. Call [`Directory::fetch_from`] to load one
    /// from disk; a freshly formatted directory is empty already.
    pub fn new() -> Self {
        Self {
            table: vec![DirSlot::default(); NUM_DIR_ENTRIES],
        }
    }

    /// Replace the in-memory table with the contents of the directory file.
    pub fn fetch_from(&mut self, disk: &mut SynchDisk, file: &OpenFile) {
        for slot in &mut self.table {
            *slot = DirSlot::default();
        }
        let size = file.length() as usize;
        let mut buf = vec![0u8; size];
        file.read_at(disk, &mut buf, 0);

        let mut offset = 0;
        let mut slot = 0;
        while offset + DIR_ENTRY_FIXED_SIZE <= size && slot < self.table.len() {
            let record: RawDirEntry =
                bytemuck::pod_read_unaligned(&buf[offset..offset + DIR_ENTRY_FIXED_SIZE]);
            assert!(
                record.total_size as usize > DIR_ENTRY_FIXED_SIZE
                    && offset + record.total_size as usize <= size,
                "corrupted directory record at byte {offset}"
            );
            let name_bytes =
                &buf[offset + DIR_ENTRY_FIXED_SIZE..offset + record.total_size as usize];
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();
            self.table[slot] = DirSlot {
                in_use: record.in_use != 0,
                sector: record.sector as u32,
                name,
            };
            offset += record.total_size as usize;
            slot += 1;
        }
    }

    /// Serialize every in-use entry back through the directory file. The
    /// file's logical length is truncated first so stale tail records do not
    /// survive; the backing allocation grows on demand.
    pub fn write_back(
        &self,
        disk: &mut SynchDisk,
        free_map: &mut Bitmap,
        file: &mut OpenFile,
    ) -> Result<(), FsError> {
        let mut buf = Vec::new();
        for slot in self.table.iter().filter(|s| s.in_use) {
            let name_size = padded_name_size(slot.name.len());
            let record = RawDirEntry {
                in_use: 1,
                sector: slot.sector as i32,
                name_size: name_size as u32,
                total_size: (DIR_ENTRY_FIXED_SIZE + name_size) as u32,
            };
            buf.extend_from_slice(bytes_of(&record));
            buf.extend_from_slice(slot.name.as_bytes());
            buf.resize(buf.len() + name_size - slot.name.len(), 0);
        }
        file.truncate();
        if !buf.is_empty() {
            file.write_at(disk, free_map, &buf, 0)?;
        } else {
            file.flush_header(disk);
        }
        Ok(())
    }

    /// Sector of the header for `name`, if present.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.table
            .iter()
            .find(|s| s.in_use && s.name == name)
            .map(|s| s.sector)
    }

    /// Bind `name` to a header sector in the first free slot.
    pub fn add(&mut self, name: &str, sector: u32) -> Result<(), FsError> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let slot = self
            .table
            .iter_mut()
            .find(|s| !s.in_use)
            .ok_or(FsError::DirectoryFull)?;
        *slot = DirSlot {
            in_use: true,
            sector,
            name: name.to_string(),
        };
        debug!("directory: added {name} -> sector {sector}");
        Ok(())
    }

    /// Drop `name` from the table. The caller owns writing the change back.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.table.iter_mut().find(|s| s.in_use && s.name == name) {
            Some(slot) => {
                *slot = DirSlot::default();
                true
            }
            None => false,
        }
    }

    /// Names of all in-use entries, in table order.
    pub fn names(&self) -> Vec<String> {
        self.table
            .iter()
            .filter(|s| s.in_use)
            .map(|s| s.name.clone())
            .collect()
    }

    /// (name, header sector) pairs of all in-use entries.
    pub fn entries(&self) -> Vec<(String, u32)> {
        self.table
            .iter()
            .filter(|s| s.in_use)
            .map(|s| (s.name.clone(), s.sector))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut dir = Directory::new();
        dir.add("alpha", 17).unwrap();
        dir.add("beta", 23).unwrap();
        assert_eq!(dir.find("alpha"), Some(17));
        assert_eq!(dir.find("gamma"), None);
        assert!(matches!(
            dir.add("alpha", 99),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(dir.remove("alpha"));
        assert!(!dir.remove("alpha"));
        assert_eq!(dir.names(), vec!["beta".to_string()]);
    }

    #[test]
    fn table_capacity_is_bounded() {
        let mut dir = Directory::new();
        for i in 0..NUM_DIR_ENTRIES {
            dir.add(&format!("f{i}"), i as u32).unwrap();
        }
        assert!(matches!(dir.add("one-more", 0), Err(FsError::DirectoryFull)));
        // Freeing a slot makes room again.
        assert!(dir.remove("f3"));
        dir.add("one-more", 50).unwrap();
        assert_eq!(dir.find("one-more"), Some(50));
    }
}
