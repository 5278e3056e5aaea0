//! File header (i-node) operations: mapping logical file offsets to disk
//! sectors and growing or releasing the backing allocation.

use crate::error::FsError;
use crate::fs::synch_disk::SynchDisk;
use nimbus_fs::{
    indirect_entries, indirect_sector, FileKind, RawFileHeader, DIRECT_ENTRIES, ENTRIES_PER_SECTOR,
    NO_SECTOR, SECTOR_SIZE,
};

/// Data sectors addressable by one header.
const MAX_DATA_SECTORS: usize = DIRECT_ENTRIES + INDIRECT_CAPACITY;
const INDIRECT_CAPACITY: usize = nimbus_fs::INDIRECT_ENTRIES * ENTRIES_PER_SECTOR;

/// Most recently fetched indirect block, so sequential I/O does not re-read
/// it for every sector. Callers must not carry a cache across operations
/// that change the mapping.
pub type IndirectCache = Option<(u32, [i32; ENTRIES_PER_SECTOR])>;

/// In-memory copy of an on-disk file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    raw: RawFileHeader,
}

fn indirect_blocks_for(sectors: usize) -> usize {
    if sectors <= DIRECT_ENTRIES {
        0
    } else {
        (sectors - DIRECT_ENTRIES).div_ceil(ENTRIES_PER_SECTOR)
    }
}

impl FileHeader {
    pub fn new(kind: FileKind) -> Self {
        Self {
            raw: RawFileHeader::new(kind),
        }
    }

    pub fn fetch_from(disk: &mut SynchDisk, sector: u32) -> Self {
        Self {
            raw: RawFileHeader::from_sector(&disk.read_sector(sector)),
        }
    }

    pub fn write_back(&self, disk: &mut SynchDisk, sector: u32) {
        disk.write_sector(sector, &self.raw.as_sector());
    }

    /// `None` when the kind field holds garbage, which mount-time checks
    /// treat as an unformatted disk.
    pub fn try_kind(&self) -> Option<FileKind> {
        FileKind::from_raw(self.raw.kind)
    }

    pub fn kind(&self) -> FileKind {
        self.try_kind().expect("corrupted file header kind")
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Logical file length in bytes.
    pub fn length(&self) -> u32 {
        self.raw.num_bytes as u32
    }

    /// Bytes covered by the allocated data sectors.
    pub fn space(&self) -> u32 {
        (self.raw.num_sectors as usize * SECTOR_SIZE) as u32
    }

    /// Extend the logical length into space the caller already allocated.
    pub fn advance_length(&mut self, delta: u32) {
        self.raw.num_bytes += delta as i32;
        debug_assert!(self.length() <= self.space());
    }

    /// Truncate the logical length to zero; the allocation stays.
    pub fn clear_length(&mut self) {
        self.raw.num_bytes = 0;
    }

    /// Grow the allocation by enough sectors to cover `extra_bytes` more
    /// bytes past the currently allocated space.
    ///
    /// The total requirement (new data sectors plus any new indirect
    /// sectors, computed from the final sector count) is checked against
    /// the free map before anything is touched, so a failed call has no
    /// side effect.
    pub fn allocate(
        &mut self,
        disk: &mut SynchDisk,
        free_map: &mut nimbus_fs::Bitmap,
        extra_bytes: u32,
    ) -> Result<(), FsError> {
        if extra_bytes == 0 {
            return Ok(());
        }
        let cur = self.raw.num_sectors as usize;
        let data_needed = (extra_bytes as usize).div_ceil(SECTOR_SIZE);
        let new_total = cur + data_needed;
        if new_total > MAX_DATA_SECTORS {
            return Err(FsError::FileTooLarge);
        }
        let indirect_now = indirect_blocks_for(cur);
        let indirect_needed = indirect_blocks_for(new_total) - indirect_now;
        if data_needed + indirect_needed > free_map.count_clear() {
            return Err(FsError::NoFreeSectors);
        }

        let mut remaining = data_needed;

        // Unused direct slots first.
        let mut slot = cur.min(DIRECT_ENTRIES);
        while remaining > 0 && slot < DIRECT_ENTRIES {
            self.raw.data_sectors[slot] = self.grab(free_map)?;
            slot += 1;
            remaining -= 1;
        }

        // Then the remaining room in the last partial indirect block.
        if remaining > 0 && indirect_now > 0 {
            let used_in_last = cur - DIRECT_ENTRIES - (indirect_now - 1) * ENTRIES_PER_SECTOR;
            if used_in_last < ENTRIES_PER_SECTOR {
                let ind = self.raw.data_sectors[DIRECT_ENTRIES + indirect_now - 1] as u32;
                let mut entries = indirect_entries(&disk.read_sector(ind));
                let mut i = used_in_last;
                while remaining > 0 && i < ENTRIES_PER_SECTOR {
                    entries[i] = self.grab(free_map)?;
                    i += 1;
                    remaining -= 1;
                }
                disk.write_sector(ind, &indirect_sector(&entries));
            }
        }

        // Fresh indirect blocks for whatever is left.
        let mut ind_slot = DIRECT_ENTRIES + indirect_now;
        while remaining > 0 {
            let ind = self.grab(free_map)?;
            self.raw.data_sectors[ind_slot] = ind;
            let mut entries = [NO_SECTOR; ENTRIES_PER_SECTOR];
            let mut i = 0;
            while remaining > 0 && i < ENTRIES_PER_SECTOR {
                entries[i] = self.grab(free_map)?;
                i += 1;
                remaining -= 1;
            }
            disk.write_sector(ind as u32, &indirect_sector(&entries));
            ind_slot += 1;
        }

        self.raw.num_sectors = new_total as i32;
        Ok(())
    }

    fn grab(&self, free_map: &mut nimbus_fs::Bitmap) -> Result<i32, FsError> {
        free_map.find().map(|s| s as i32).ok_or(FsError::NoFreeSectors)
    }

    /// Release every data sector and every indirect sector. The sector
    /// holding the header itself is the caller's to clear.
    pub fn deallocate(&mut self, disk: &mut SynchDisk, free_map: &mut nimbus_fs::Bitmap) {
        let total = self.raw.num_sectors as usize;
        for i in 0..total.min(DIRECT_ENTRIES) {
            free_map.clear(self.raw.data_sectors[i] as usize);
        }
        let indirect = indirect_blocks_for(total);
        for block in 0..indirect {
            let ind = self.raw.data_sectors[DIRECT_ENTRIES + block] as u32;
            let entries = indirect_entries(&disk.read_sector(ind));
            let in_block = if block == indirect - 1 {
                total - DIRECT_ENTRIES - (indirect - 1) * ENTRIES_PER_SECTOR
            } else {
                ENTRIES_PER_SECTOR
            };
            for &entry in &entries[..in_block] {
                free_map.clear(entry as usize);
            }
            free_map.clear(ind as usize);
        }
        self.raw.num_sectors = 0;
        self.raw.num_bytes = 0;
        self.raw.data_sectors = [NO_SECTOR; nimbus_fs::NUM_ENTRIES];
    }

    /// Disk sector holding the `index`-th data sector of the file.
    pub fn nth_sector(&self, disk: &mut SynchDisk, index: u32, cache: &mut IndirectCache) -> u32 {
        let index = index as usize;
        debug_assert!(index < self.raw.num_sectors as usize);
        if index < DIRECT_ENTRIES {
            return self.raw.data_sectors[index] as u32;
        }
        let block = (index - DIRECT_ENTRIES) / ENTRIES_PER_SECTOR;
        let ind = self.raw.data_sectors[DIRECT_ENTRIES + block] as u32;
        let entries = match cache {
            Some((sector, entries)) if *sector == ind => *entries,
            _ => {
                let entries = indirect_entries(&disk.read_sector(ind));
                *cache = Some((ind, entries));
                entries
            }
        };
        entries[(index - DIRECT_ENTRIES) % ENTRIES_PER_SECTOR] as u32
    }

    /// Disk sector containing byte `offset` of the file.
    pub fn byte_to_sector(&self, disk: &mut SynchDisk, offset: u32, cache: &mut IndirectCache) -> u32 {
        self.nth_sector(disk, offset / SECTOR_SIZE as u32, cache)
    }
}
