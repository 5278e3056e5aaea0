//! The file-system facade.
//!
//! Both the free-sector map and the root directory live on disk as ordinary
//! files whose headers sit in well-known sectors, so the system can find
//! them at boot. Operations that mutate the disk fetch working copies of the
//! free map and directory, mutate those, and only write them back once the
//! whole operation has succeeded, so a failed operation leaves no partial
//! state visible to later calls.
//!
//! The facade also owns the process-wide open-file table, which is what
//! gives `remove` its unlink-while-open semantics: removal of an open name
//! is deferred until the last close.

pub mod directory;
pub mod header;
pub mod open_file;
pub mod synch_disk;

use crate::error::FsError;
use crate::sync::Lock;
use crate::thread::ThreadId;
use directory::Directory;
use header::FileHeader;
use log::{debug, warn};
use nimbus_fs::{
    Bitmap, FileKind, DIRECTORY_SECTOR, DIR_ENTRY_FIXED_SIZE, FREE_MAP_FILE_SIZE, FREE_MAP_SECTOR,
    NUM_DIR_ENTRIES,
};
use open_file::{OpenFile, TableRef};
use std::fmt::Write as _;
use std::io;
use synch_disk::SynchDisk;

/// Simultaneously open names, process-wide.
pub const MAX_OPEN_FILES: usize = 10;
/// Per-thread file-descriptor slots; 0 and 1 are the console.
pub const FD_COUNT: usize = 16;

/// Initial allocation for a fresh directory file.
const DIRECTORY_FILE_SIZE: u32 = (DIR_ENTRY_FIXED_SIZE * NUM_DIR_ENTRIES) as u32;

/// One registered open name.
pub struct OpenEntry {
    pub name: String,
    pub lock: Lock,
    pub refcount: u32,
    pub should_delete: bool,
}

struct OpenSlot {
    entry: Option<OpenEntry>,
    generation: u32,
}

pub struct FileSystem {
    disk: SynchDisk,
    free_map_file: OpenFile,
    open_table: Vec<OpenSlot>,
}

impl FileSystem {
    /// Lay down an empty file system: mark the two well-known header
    /// sectors, allocate the free-map and root-directory files, and persist
    /// the bootstrap state.
    pub fn format(disk: nimbus_vm::Disk) -> Result<Self, FsError> {
        debug!("formatting the file system");
        let mut disk = SynchDisk::new(disk);
        let mut free_map = Bitmap::new();
        free_map.mark(FREE_MAP_SECTOR as usize);
        free_map.mark(DIRECTORY_SECTOR as usize);

        let mut map_hdr = FileHeader::new(FileKind::Regular);
        map_hdr.allocate(&mut disk, &mut free_map, FREE_MAP_FILE_SIZE as u32)?;
        map_hdr.write_back(&mut disk, FREE_MAP_SECTOR);

        let mut dir_hdr = FileHeader::new(FileKind::Directory);
        dir_hdr.allocate(&mut disk, &mut free_map, DIRECTORY_FILE_SIZE)?;
        dir_hdr.write_back(&mut disk, DIRECTORY_SECTOR);

        let free_map_file = OpenFile::open(&mut disk, FREE_MAP_SECTOR);
        let mut fs = Self {
            disk,
            free_map_file,
            open_table: Self::empty_table(),
        };
        // The root directory is empty; only the free map has content to
        // persist.
        fs.flush_free_map(&mut free_map)?;
        Ok(fs)
    }

    /// Open an already-formatted disk.
    pub fn mount(disk: nimbus_vm::Disk) -> Result<Self, FsError> {
        let mut disk = SynchDisk::new(disk);
        let root = FileHeader::fetch_from(&mut disk, DIRECTORY_SECTOR);
        if root.try_kind() != Some(FileKind::Directory) {
            return Err(FsError::BadHeader(DIRECTORY_SECTOR));
        }
        let free_map_file = OpenFile::open(&mut disk, FREE_MAP_SECTOR);
        Ok(Self {
            disk,
            free_map_file,
            open_table: Self::empty_table(),
        })
    }

    fn empty_table() -> Vec<OpenSlot> {
        (0..MAX_OPEN_FILES)
            .map(|_| OpenSlot {
                entry: None,
                generation: 0,
            })
            .collect()
    }

    pub fn disk_mut(&mut self) -> &mut SynchDisk {
        &mut self.disk
    }

    /// Flush the disk image to its host file.
    pub fn sync(&self) -> io::Result<()> {
        self.disk.flush()
    }

    /// Tear the facade down and hand the device back, e.g. to remount.
    pub fn unmount(self) -> nimbus_vm::Disk {
        self.disk.into_inner()
    }

    fn fetch_free_map(&mut self) -> Bitmap {
        let mut bytes = vec![0u8; FREE_MAP_FILE_SIZE];
        let Self {
            disk, free_map_file, ..
        } = self;
        free_map_file.read_at(disk, &mut bytes, 0);
        Bitmap::from_bytes(&bytes)
    }

    fn flush_free_map(&mut self, map: &mut Bitmap) -> Result<(), FsError> {
        let bytes = map.as_bytes().to_vec();
        let Self {
            disk, free_map_file, ..
        } = self;
        // The free-map file never grows, so `map` is only read here.
        free_map_file.write_at(disk, map, &bytes, 0)?;
        Ok(())
    }

    /// Allocated-sector count straight from the persisted free map.
    pub fn allocated_sectors(&mut self) -> usize {
        self.fetch_free_map().count_set()
    }

    /// Walk every intermediate component of `path`, returning the parent
    /// directory (in memory), the parent's backing file, and the leaf name.
    fn resolve_parent(&mut self, path: &str) -> Result<(Directory, OpenFile, String), FsError> {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let leaf = components
            .pop()
            .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;

        let mut dir_file = OpenFile::open(&mut self.disk, DIRECTORY_SECTOR);
        let mut directory = Directory::new();
        directory.fetch_from(&mut self.disk, &dir_file);

        for component in components {
            let sector = directory
                .find(component)
                .ok_or_else(|| FsError::NotFound(component.to_string()))?;
            let file = OpenFile::open(&mut self.disk, sector);
            if !file.is_directory() {
                return Err(FsError::NotADirectory(component.to_string()));
            }
            directory.fetch_from(&mut self.disk, &file);
            dir_file = file;
        }
        Ok((directory, dir_file, leaf.to_string()))
    }

    /// Resolve a whole path to a directory file; `None` means the root.
    fn resolve_directory(&mut self, path: Option<&str>) -> Result<Directory, FsError> {
        let mut directory = Directory::new();
        match path {
            None => {
                let root = OpenFile::open(&mut self.disk, DIRECTORY_SECTOR);
                directory.fetch_from(&mut self.disk, &root);
            }
            Some(path) => {
                let (parent, _, leaf) = self.resolve_parent(path)?;
                let sector = parent.find(&leaf).ok_or_else(|| FsError::NotFound(leaf.clone()))?;
                let file = OpenFile::open(&mut self.disk, sector);
                if !file.is_directory() {
                    return Err(FsError::NotADirectory(leaf));
                }
                directory.fetch_from(&mut self.disk, &file);
            }
        }
        Ok(directory)
    }

    /// Create a file or directory of `initial_size` bytes: reserve a header
    /// sector, enter the name, allocate the data, then persist header,
    /// directory, and free map. On any failure the in-memory copies are
    /// simply discarded.
    pub fn create(&mut self, path: &str, initial_size: u32, kind: FileKind) -> Result<(), FsError> {
        debug!("create {path}, size {initial_size}, {kind:?}");
        let (mut directory, mut dir_file, leaf) = self.resolve_parent(path)?;
        if directory.find(&leaf).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let mut free_map = self.fetch_free_map();
        let sector = free_map.find().ok_or(FsError::NoFreeSectors)?;
        directory.add(&leaf, sector)?;

        let mut hdr = FileHeader::new(kind);
        hdr.allocate(&mut self.disk, &mut free_map, initial_size)?;

        hdr.write_back(&mut self.disk, sector);
        directory.write_back(&mut self.disk, &mut free_map, &mut dir_file)?;
        self.flush_free_map(&mut free_map)?;
        Ok(())
    }

    /// Open `path`, registering the name in the open-file table. Re-opening
    /// a name already in the table shares its slot and bumps the refcount.
    pub fn open(&mut self, path: &str) -> Result<OpenFile, FsError> {
        let (directory, _, leaf) = self.resolve_parent(path)?;
        let sector = directory
            .find(&leaf)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let table_ref = self.register_open(path)?;
        let mut file = OpenFile::open(&mut self.disk, sector);
        file.table_ref = Some(table_ref);
        Ok(file)
    }

    fn register_open(&mut self, path: &str) -> Result<TableRef, FsError> {
        if let Some(slot) = self
            .open_table
            .iter()
            .position(|s| s.entry.as_ref().is_some_and(|e| e.name == path))
        {
            let s = &mut self.open_table[slot];
            let entry = s.entry.as_mut().expect("checked above");
            entry.refcount += 1;
            return Ok(TableRef {
                slot,
                generation: s.generation,
            });
        }
        let slot = self
            .open_table
            .iter()
            .position(|s| s.entry.is_none())
            .ok_or(FsError::OpenTableFull)?;
        self.open_table[slot].entry = Some(OpenEntry {
            name: path.to_string(),
            lock: Lock::new(),
            refcount: 1,
            should_delete: false,
        });
        Ok(TableRef {
            slot,
            generation: self.open_table[slot].generation,
        })
    }

    fn entry_mut(&mut self, table_ref: TableRef) -> Result<&mut OpenEntry, FsError> {
        let slot = &mut self.open_table[table_ref.slot];
        if slot.generation != table_ref.generation {
            return Err(FsError::StaleHandle);
        }
        slot.entry.as_mut().ok_or(FsError::StaleHandle)
    }

    /// Drop a handle. When the last handle on a name goes away, a pending
    /// remove is carried out.
    pub fn close(&mut self, file: OpenFile) {
        let Some(table_ref) = file.table_ref else {
            return;
        };
        drop(file);
        let entry = match self.entry_mut(table_ref) {
            Ok(entry) => entry,
            Err(_) => {
                warn!("close of a stale open-file handle");
                return;
            }
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let slot = &mut self.open_table[table_ref.slot];
        let entry = slot.entry.take().expect("refcount outlived entry");
        slot.generation += 1;
        if entry.should_delete {
            debug!("deferred remove of {} on last close", entry.name);
            if let Err(e) = self.remove_now(&entry.name) {
                warn!("deferred remove of {} failed: {e}", entry.name);
            }
        }
    }

    /// Unlink `path`. If the name is open, the removal is deferred to the
    /// final close and `Ok(false)` is returned.
    pub fn remove(&mut self, path: &str) -> Result<bool, FsError> {
        let open_slot = self
            .open_table
            .iter_mut()
            .find_map(|s| s.entry.as_mut().filter(|e| e.name == path));
        if let Some(entry) = open_slot {
            entry.should_delete = true;
            debug!("remove {path} deferred: file is open");
            return Ok(false);
        }
        self.remove_now(path)?;
        Ok(true)
    }

    fn remove_now(&mut self, path: &str) -> Result<(), FsError> {
        debug!("remove {path}");
        let (mut directory, mut dir_file, leaf) = self.resolve_parent(path)?;
        let sector = directory
            .find(&leaf)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;

        let mut hdr = FileHeader::fetch_from(&mut self.disk, sector);
        let mut free_map = self.fetch_free_map();
        hdr.deallocate(&mut self.disk, &mut free_map);
        // The facade, not the header, owns the header's own sector.
        free_map.clear(sector as usize);
        directory.remove(&leaf);

        directory.write_back(&mut self.disk, &mut free_map, &mut dir_file)?;
        self.flush_free_map(&mut free_map)?;
        Ok(())
    }

    /// Names in a directory; `None` lists the root.
    pub fn list(&mut self, path: Option<&str>) -> Result<Vec<String>, FsError> {
        Ok(self.resolve_directory(path)?.names())
    }

    /// Whole contents of a regular file.
    pub fn cat(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let file = self.open(path)?;
        let mut contents = vec![0u8; file.length() as usize];
        let n = file.read_at(&mut self.disk, &mut contents, 0);
        contents.truncate(n);
        self.close(file);
        Ok(contents)
    }

    /// Positioned read through a handle.
    pub fn read_at(&mut self, file: &OpenFile, buf: &mut [u8], position: u32) -> usize {
        file.read_at(&mut self.disk, buf, position)
    }

    /// Positioned write through a handle, persisting any free-map growth.
    pub fn write_at(
        &mut self,
        file: &mut OpenFile,
        buf: &[u8],
        position: u32,
    ) -> Result<usize, FsError> {
        let mut free_map = self.fetch_free_map();
        let n = file.write_at(&mut self.disk, &mut free_map, buf, position)?;
        self.flush_free_map(&mut free_map)?;
        Ok(n)
    }

    /// Sequential read advancing the handle's seek position.
    pub fn read_seq(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> usize {
        file.read(&mut self.disk, buf)
    }

    /// Sequential write advancing the handle's seek position.
    pub fn write_seq(&mut self, file: &mut OpenFile, buf: &[u8]) -> Result<usize, FsError> {
        let mut free_map = self.fetch_free_map();
        let n = file.write(&mut self.disk, &mut free_map, buf)?;
        self.flush_free_map(&mut free_map)?;
        Ok(n)
    }

    /// Try to take the per-name lock for a file-I/O call. `false` means the
    /// caller was queued and must retry once woken.
    pub fn try_lock(&mut self, table_ref: TableRef, tid: ThreadId) -> Result<bool, FsError> {
        Ok(self.entry_mut(table_ref)?.lock.try_acquire(tid))
    }

    /// Release the per-name lock; returns the next holder to wake, if any.
    pub fn unlock(&mut self, table_ref: TableRef, tid: ThreadId) -> Option<ThreadId> {
        match self.entry_mut(table_ref) {
            Ok(entry) => entry.lock.release(tid),
            Err(_) => None,
        }
    }

    /// Dump of the file-system metadata: free map usage, the root directory,
    /// and each file's header.
    pub fn print(&mut self) -> Result<String, FsError> {
        let mut out = String::new();
        let free_map = self.fetch_free_map();
        writeln!(
            out,
            "free map: {} of {} sectors allocated",
            free_map.count_set(),
            nimbus_fs::NUM_SECTORS
        )
        .expect("writing to a String");
        let directory = self.resolve_directory(None)?;
        for (name, sector) in directory.entries() {
            let hdr = FileHeader::fetch_from(&mut self.disk, sector);
            writeln!(
                out,
                "{name}: header sector {sector}, {:?}, {} bytes in {} sectors",
                hdr.try_kind(),
                hdr.length(),
                hdr.space() as usize / nimbus_fs::SECTOR_SIZE,
            )
            .expect("writing to a String");
        }
        Ok(out)
    }
}
