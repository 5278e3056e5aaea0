//! Open-file handles: positioned and random-access I/O against a file
//! header, one sector at a time through the synchronous disk.

use crate::error::FsError;
use crate::fs::header::{FileHeader, IndirectCache};
use crate::fs::synch_disk::SynchDisk;
use nimbus_fs::{Bitmap, FileKind, SECTOR_SIZE};

/// Reference into the process-wide open-file table: slot index plus the
/// generation the slot had when the file was opened, so a recycled slot
/// cannot be confused with the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub slot: usize,
    pub generation: u32,
}

/// A handle onto one file: the header it was opened from, a seek position,
/// and (for files opened through the facade) the open-table registration.
#[derive(Debug)]
pub struct OpenFile {
    sector: u32,
    hdr: FileHeader,
    seek_position: u32,
    pub table_ref: Option<TableRef>,
}

impl OpenFile {
    /// Bind a handle to the header stored in `sector`.
    pub fn open(disk: &mut SynchDisk, sector: u32) -> Self {
        Self {
            sector,
            hdr: FileHeader::fetch_from(disk, sector),
            seek_position: 0,
            table_ref: None,
        }
    }

    pub fn header_sector(&self) -> u32 {
        self.sector
    }

    pub fn kind(&self) -> FileKind {
        self.hdr.kind()
    }

    pub fn is_directory(&self) -> bool {
        self.hdr.is_directory()
    }

    pub fn length(&self) -> u32 {
        self.hdr.length()
    }

    pub fn seek(&mut self, position: u32) {
        self.seek_position = position;
    }

    /// Truncate the in-memory header's logical length. Persisted by the
    /// next write or an explicit [`OpenFile::flush_header`].
    pub fn truncate(&mut self) {
        self.hdr.clear_length();
    }

    pub fn flush_header(&self, disk: &mut SynchDisk) {
        self.hdr.write_back(disk, self.sector);
    }

    /// Read up to `buf.len()` bytes starting at `position`, clamped to the
    /// file length. Returns the byte count actually copied.
    pub fn read_at(&self, disk: &mut SynchDisk, buf: &mut [u8], position: u32) -> usize {
        let length = self.hdr.length() as usize;
        let position = position as usize;
        if position >= length || buf.is_empty() {
            return 0;
        }
        let num = buf.len().min(length - position);
        let first = position / SECTOR_SIZE;
        let last = (position + num - 1) / SECTOR_SIZE;

        let mut cache = IndirectCache::None;
        let mut copied = 0;
        for s in first..=last {
            let sector = self.hdr.nth_sector(disk, s as u32, &mut cache);
            let data = disk.read_sector(sector);
            let sector_start = s * SECTOR_SIZE;
            let lo = position.max(sector_start) - sector_start;
            let hi = (position + num).min(sector_start + SECTOR_SIZE) - sector_start;
            buf[copied..copied + hi - lo].copy_from_slice(&data[lo..hi]);
            copied += hi - lo;
        }
        num
    }

    /// Write `buf` at `position`, growing the allocation (and the logical
    /// length) as needed. Partially covered sectors are read, patched, and
    /// written back. The header is persisted afterwards; a grown allocation
    /// leaves the free map dirty for the caller to flush.
    pub fn write_at(
        &mut self,
        disk: &mut SynchDisk,
        free_map: &mut Bitmap,
        buf: &[u8],
        position: u32,
    ) -> Result<usize, FsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let position = position as usize;
        let end = position + buf.len();
        if end > self.hdr.space() as usize {
            self.hdr
                .allocate(disk, free_map, (end - self.hdr.space() as usize) as u32)?;
        }
        if end > self.hdr.length() as usize {
            self.hdr.advance_length((end - self.hdr.length() as usize) as u32);
        }

        let first = position / SECTOR_SIZE;
        let last = (end - 1) / SECTOR_SIZE;
        let mut cache = IndirectCache::None;
        let mut written = 0;
        for s in first..=last {
            let sector = self.hdr.nth_sector(disk, s as u32, &mut cache);
            let sector_start = s * SECTOR_SIZE;
            let lo = position.max(sector_start) - sector_start;
            let hi = end.min(sector_start + SECTOR_SIZE) - sector_start;
            if lo == 0 && hi == SECTOR_SIZE {
                let mut data = [0u8; SECTOR_SIZE];
                data.copy_from_slice(&buf[written..written + SECTOR_SIZE]);
                disk.write_sector(sector, &data);
            } else {
                let mut data = disk.read_sector(sector);
                data[lo..hi].copy_from_slice(&buf[written..written + hi - lo]);
                disk.write_sector(sector, &data);
            }
            written += hi - lo;
        }
        self.flush_header(disk);
        Ok(buf.len())
    }

    /// Sequential read from the seek position.
    pub fn read(&mut self, disk: &mut SynchDisk, buf: &mut [u8]) -> usize {
        let n = self.read_at(disk, buf, self.seek_position);
        self.seek_position += n as u32;
        n
    }

    /// Sequential write at the seek position.
    pub fn write(
        &mut self,
        disk: &mut SynchDisk,
        free_map: &mut Bitmap,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        let n = self.write_at(disk, free_map, buf, self.seek_position)?;
        self.seek_position += n as u32;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_vm::Disk;

    fn open_fresh_file(disk: &mut SynchDisk) -> (OpenFile, Bitmap) {
        let mut map = Bitmap::new();
        // Reserve a header sector by hand; these tests bypass the facade.
        let sector = map.find().unwrap();
        FileHeader::new(FileKind::Regular).write_back(disk, sector);
        (OpenFile::open(disk, sector), map)
    }

    #[test]
    fn read_back_what_was_written() {
        let mut disk = SynchDisk::new(Disk::new());
        let (mut file, mut map) = open_fresh_file(&mut disk);
        let payload = b"what is written in sector stays in sector";
        assert_eq!(
            file.write_at(&mut disk, &mut map, payload, 0).unwrap(),
            payload.len()
        );

        let mut back = vec![0u8; payload.len()];
        assert_eq!(file.read_at(&mut disk, &mut back, 0), payload.len());
        assert_eq!(&back, payload);

        // A reopened handle sees the persisted header.
        let reopened = OpenFile::open(&mut disk, file.header_sector());
        assert_eq!(reopened.length() as usize, payload.len());
    }

    #[test]
    fn reads_clamp_to_file_length() {
        let mut disk = SynchDisk::new(Disk::new());
        let (mut file, mut map) = open_fresh_file(&mut disk);
        file.write_at(&mut disk, &mut map, b"abc", 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read_at(&mut disk, &mut buf, 0), 3);
        assert_eq!(file.read_at(&mut disk, &mut buf, 3), 0);
        assert_eq!(file.read_at(&mut disk, &mut buf, 100), 0);
    }

    #[test]
    fn unaligned_overwrite_preserves_neighbors() {
        let mut disk = SynchDisk::new(Disk::new());
        let (mut file, mut map) = open_fresh_file(&mut disk);
        let base = vec![b'.'; 3 * SECTOR_SIZE];
        file.write_at(&mut disk, &mut map, &base, 0).unwrap();
        // Straddle the first sector boundary.
        file.write_at(&mut disk, &mut map, b"XYZ", SECTOR_SIZE as u32 - 2)
            .unwrap();

        let mut back = vec![0u8; 3 * SECTOR_SIZE];
        file.read_at(&mut disk, &mut back, 0);
        assert_eq!(&back[SECTOR_SIZE - 3..SECTOR_SIZE + 3], b".XYZ..");
        assert_eq!(back.len(), file.length() as usize);
    }

    #[test]
    fn sequential_io_advances_the_seek_position() {
        let mut disk = SynchDisk::new(Disk::new());
        let (mut file, mut map) = open_fresh_file(&mut disk);
        file.write(&mut disk, &mut map, b"one").unwrap();
        file.write(&mut disk, &mut map, b"two").unwrap();
        file.seek(0);
        let mut buf = [0u8; 6];
        assert_eq!(file.read(&mut disk, &mut buf), 6);
        assert_eq!(&buf, b"onetwo");
    }

    #[test]
    fn growth_spans_the_indirect_boundary() {
        let mut disk = SynchDisk::new(Disk::new());
        let (mut file, mut map) = open_fresh_file(&mut disk);
        let len = nimbus_fs::DIRECT_ENTRIES * SECTOR_SIZE + 64;
        let pattern = vec![0xab; len];
        file.write_at(&mut disk, &mut map, &pattern, 0).unwrap();

        let mut back = vec![0u8; len];
        assert_eq!(file.read_at(&mut disk, &mut back, 0), len);
        assert_eq!(back, pattern);
    }
}
