use log::debug;
use nimbus_fs::{NUM_SECTORS, SECTOR_SIZE};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Simulated seek-and-transfer latency, in ticks, for one sector.
pub const DISK_TICKS_PER_OP: u32 = 2;

/// Raised by [`Disk::tick`] when the outstanding operation completes. This
/// is the disk interrupt: the synchronous wrapper in the kernel pumps ticks
/// until it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInterrupt;

#[derive(Debug, Clone, Copy)]
enum PendingOp {
    Read { sector: usize },
    Write { sector: usize },
}

/// Sector-addressed simulated disk. The image lives in memory and is
/// optionally loaded from and flushed to a host file; the simulated device
/// itself never fails, so only host I/O returns errors.
///
/// At most one operation may be outstanding; issuing a second while busy is
/// a driver bug and fatal.
pub struct Disk {
    data: Vec<u8>,
    image: Option<PathBuf>,
    buffer: [u8; SECTOR_SIZE],
    pending: Option<PendingOp>,
    ticks_remaining: u32,
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk {
    /// A fresh zeroed disk with no host image.
    pub fn new() -> Self {
        Self {
            data: vec![0; NUM_SECTORS * SECTOR_SIZE],
            image: None,
            buffer: [0; SECTOR_SIZE],
            pending: None,
            ticks_remaining: 0,
        }
    }

    /// Load an existing image file. Short images are padded with zeroes;
    /// anything past the disk geometry is ignored.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut data = fs::read(path)?;
        data.resize(NUM_SECTORS * SECTOR_SIZE, 0);
        debug!("opened disk image {}", path.display());
        Ok(Self {
            data,
            image: Some(path.to_path_buf()),
            buffer: [0; SECTOR_SIZE],
            pending: None,
            ticks_remaining: 0,
        })
    }

    /// A fresh zeroed disk that will flush to `path`.
    pub fn create(path: &Path) -> Self {
        let mut disk = Self::new();
        disk.image = Some(path.to_path_buf());
        disk
    }

    /// Write the in-memory image back to its host file, if it has one.
    pub fn flush(&self) -> io::Result<()> {
        if let Some(path) = &self.image {
            fs::write(path, &self.data)?;
            debug!("flushed disk image {}", path.display());
        }
        Ok(())
    }

    /// Schedule a sector read; the data lands in [`Disk::buffer`] when the
    /// completion interrupt fires.
    pub fn read_request(&mut self, sector: usize) {
        assert!(sector < NUM_SECTORS, "sector {sector} out of range");
        assert!(self.pending.is_none(), "disk request issued while busy");
        self.pending = Some(PendingOp::Read { sector });
        self.ticks_remaining = DISK_TICKS_PER_OP;
    }

    /// Schedule a sector write from `buf`.
    pub fn write_request(&mut self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < NUM_SECTORS, "sector {sector} out of range");
        assert!(self.pending.is_none(), "disk request issued while busy");
        self.buffer = *buf;
        self.pending = Some(PendingOp::Write { sector });
        self.ticks_remaining = DISK_TICKS_PER_OP;
    }

    /// Advance simulated time; performs the transfer and raises the
    /// completion interrupt when the outstanding operation's latency has
    /// elapsed.
    pub fn tick(&mut self) -> Option<DiskInterrupt> {
        let op = self.pending?;
        self.ticks_remaining -= 1;
        if self.ticks_remaining > 0 {
            return None;
        }
        match op {
            PendingOp::Read { sector } => {
                let start = sector * SECTOR_SIZE;
                self.buffer.copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
            }
            PendingOp::Write { sector } => {
                let start = sector * SECTOR_SIZE;
                self.data[start..start + SECTOR_SIZE].copy_from_slice(&self.buffer);
            }
        }
        self.pending = None;
        Some(DiskInterrupt)
    }

    pub fn busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Sector buffer holding the payload of the last completed read.
    pub fn buffer(&self) -> &[u8; SECTOR_SIZE] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_completes_after_seek_latency() {
        let mut disk = Disk::new();
        let payload = [0xabu8; SECTOR_SIZE];
        disk.write_request(7, &payload);
        assert!(disk.busy());
        assert_eq!(disk.tick(), None);
        assert_eq!(disk.tick(), Some(DiskInterrupt));
        assert!(!disk.busy());

        disk.read_request(7);
        while disk.tick().is_none() {}
        assert_eq!(disk.buffer(), &payload);
    }

    #[test]
    fn unwritten_sectors_read_zero() {
        let mut disk = Disk::new();
        disk.read_request(1023);
        while disk.tick().is_none() {}
        assert_eq!(disk.buffer(), &[0u8; SECTOR_SIZE]);
    }

    #[test]
    #[should_panic(expected = "busy")]
    fn double_issue_is_fatal() {
        let mut disk = Disk::new();
        disk.read_request(0);
        disk.read_request(1);
    }
}
