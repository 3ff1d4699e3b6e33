//! Page I/O on the single database file.
//!
//! The disk manager owns the file descriptor and the exclusive advisory
//! lock on the sibling `.lock` file. All page transfer between memory
//! and disk goes through it; one positioned syscall per page. Torn-page
//! safety comes from the write-ahead log, not from write atomicity.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use fs2::FileExt as _;
use log::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::page::{Page, PageId, PAGE_SIZE};

const DB_EXTENSION: &str = "db";

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub corruption_events: u64,
}

pub struct DiskManager {
    path: PathBuf,
    lock_path: PathBuf,
    file: File,
    lock_file: File,
    read_only: bool,
    sync_writes: bool,
    verify_checksums: bool,

    /// Cached file size in bytes; page count derives from it.
    size: AtomicU64,
    /// Serializes file growth so concurrent writers past EOF don't race
    /// on `set_len`.
    grow: Mutex<()>,
    closed: AtomicBool,

    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    corruption_events: AtomicU64,
}

impl DiskManager {
    /// Opens (or creates) the database file, taking the exclusive
    /// advisory lock. Fails with `StorageLocked` if another process
    /// holds the database.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                reason: "database path is empty".to_string(),
            });
        }

        let mut path = path.to_path_buf();
        if path.extension().is_none() {
            path.set_extension(DB_EXTENSION);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::io("create_dir_all", e))?;
            }
        }

        let mut lock_os = path.clone().into_os_string();
        lock_os.push(".lock");
        let lock_path = PathBuf::from(lock_os);

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| Error::io("open lock file", e))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::StorageLocked { path });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!config.read_only)
            .open(&path)
            .map_err(|e| {
                // The lock is ours but the data file failed; don't leave
                // the sentinel behind.
                let _ = fs2::FileExt::unlock(&lock_file);
                let _ = fs::remove_file(&lock_path);
                Error::io("open database file", e)
            })?;

        let mut size = file
            .metadata()
            .map_err(|e| Error::io("stat database file", e))?
            .len();

        if !config.read_only && config.preallocate_size > size {
            let target = config.preallocate_size.next_multiple_of(PAGE_SIZE as u64);
            file.set_len(target)
                .map_err(|e| Error::io("preallocate", e))?;
            size = target;
        }

        debug!(
            "opened database file {:?}: {} bytes, {} pages",
            path,
            size,
            size / PAGE_SIZE as u64
        );

        Ok(Self {
            path,
            lock_path,
            file,
            lock_file,
            read_only: config.read_only,
            sync_writes: config.sync_writes,
            verify_checksums: config.checksum_enabled,
            size: AtomicU64::new(size),
            grow: Mutex::new(()),
            closed: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            corruption_events: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&self, id: PageId) -> Result<Page> {
        self.check_open()?;

        let offset = id as u64 * PAGE_SIZE as u64;
        let size = self.size.load(Ordering::Acquire);
        if offset + PAGE_SIZE as u64 > size {
            return Err(Error::PageOutOfRange {
                page_id: id,
                page_count: (size / PAGE_SIZE as u64) as u32,
            });
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::io("read_page", e))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);

        let page = Page::deserialize(&buf, self.verify_checksums).map_err(|e| {
            if matches!(e, Error::ChecksumMismatch { .. }) {
                self.corruption_events.fetch_add(1, Ordering::Relaxed);
                warn!("checksum mismatch reading page {}", id);
            }
            e
        })?;

        if page.id != id {
            self.corruption_events.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Corrupted {
                context: format!("page at slot {} claims id {}", id, page.id),
            });
        }
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let offset = page.id as u64 * PAGE_SIZE as u64;
        let end = offset + PAGE_SIZE as u64;
        if end > self.size.load(Ordering::Acquire) {
            let _guard = self.grow.lock().unwrap();
            if end > self.size.load(Ordering::Acquire) {
                self.file.set_len(end).map_err(map_write_err)?;
                self.size.store(end, Ordering::Release);
            }
        }

        let image = page.serialize();
        self.file
            .write_all_at(&image, offset)
            .map_err(map_write_err)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);

        if self.sync_writes {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.file.sync_data().map_err(|e| Error::io("fsync", e))
    }

    pub fn page_count(&self) -> u32 {
        (self.size.load(Ordering::Acquire) / PAGE_SIZE as u64) as u32
    }

    /// Structural sanity check: the file must be a whole number of
    /// pages. Per-page verification happens lazily on read; a
    /// preallocated tail of zero pages is legitimate and not flagged.
    pub fn check_integrity(&self) -> Result<()> {
        self.check_open()?;
        let size = self.size.load(Ordering::Acquire);
        if size % PAGE_SIZE as u64 != 0 {
            return Err(Error::Corrupted {
                context: format!(
                    "file size {} is not a multiple of the page size {}",
                    size, PAGE_SIZE
                ),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            corruption_events: self.corruption_events.load(Ordering::Relaxed),
        }
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.read_only {
            self.file.sync_all().map_err(|e| Error::io("fsync", e))?;
        }
        let _ = fs2::FileExt::unlock(&self.lock_file);
        let _ = fs::remove_file(&self.lock_path);
        debug!("closed database file {:?}", self.path);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn map_write_err(e: std::io::Error) -> Error {
    // ENOSPC
    if e.raw_os_error() == Some(28) {
        Error::StorageFull
    } else {
        Error::io("write_page", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;
    use crate::test_support::temp_db_path;

    #[test]
    fn test_open_appends_extension_and_creates_lock() {
        let path = temp_db_path("disk_ext");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        assert_eq!(disk.path().extension().unwrap(), "db");

        let mut lock_os = disk.path().to_path_buf().into_os_string();
        lock_os.push(".lock");
        let lock_path = std::path::PathBuf::from(lock_os);
        assert!(lock_path.exists());
        disk.close().unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_second_open_is_refused() {
        let path = temp_db_path("disk_locked");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        match DiskManager::open(&path, &Config::default()) {
            Err(Error::StorageLocked { .. }) => {}
            other => panic!("expected StorageLocked, got {:?}", other.map(|_| ())),
        }
        disk.close().unwrap();

        // After a clean close the file can be opened again.
        DiskManager::open(&path, &Config::default()).unwrap();
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let path = temp_db_path("disk_rw");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();

        let mut page = Page::new(3, PageType::Leaf);
        page.lsn = 17;
        page.set_body(b"payload", 1);
        disk.write_page(&page).unwrap();

        // Pages 0..=2 exist as zero regions after the growth.
        assert_eq!(disk.page_count(), 4);

        let back = disk.read_page(3).unwrap();
        assert_eq!(back.lsn, 17);
        assert_eq!(&back.body()[..7], b"payload");

        let stats = disk.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_written, PAGE_SIZE as u64);
    }

    #[test]
    fn test_read_out_of_range() {
        let path = temp_db_path("disk_range");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        match disk.read_page(12) {
            Err(Error::PageOutOfRange { page_id: 12, .. }) => {}
            other => panic!("expected PageOutOfRange, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_corrupted_page_detected_and_counted() {
        let path = temp_db_path("disk_corrupt");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        let page = Page::new(0, PageType::Meta);
        disk.write_page(&page).unwrap();

        // Flip a byte in the stored body behind the manager's back.
        let file = OpenOptions::new()
            .write(true)
            .open(disk.path())
            .unwrap();
        file.write_all_at(&[0xff], 100).unwrap();

        assert!(matches!(
            disk.read_page(0),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(disk.stats().corruption_events, 1);
    }

    #[test]
    fn test_integrity_check() {
        let path = temp_db_path("disk_integrity");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        disk.write_page(&Page::new(1, PageType::Leaf)).unwrap();
        disk.check_integrity().unwrap();
    }

    #[test]
    fn test_preallocation_rounds_to_page_size() {
        let path = temp_db_path("disk_prealloc");
        let mut config = Config::default();
        config.preallocate_size = PAGE_SIZE as u64 * 4 + 1;
        let disk = DiskManager::open(&path, &config).unwrap();
        assert_eq!(disk.page_count(), 5);
        disk.check_integrity().unwrap();
    }

    #[test]
    fn test_closed_operations_fail() {
        let path = temp_db_path("disk_closed");
        let disk = DiskManager::open(&path, &Config::default()).unwrap();
        disk.close().unwrap();
        assert!(matches!(disk.read_page(0), Err(Error::Closed)));
        assert!(matches!(
            disk.write_page(&Page::new(0, PageType::Meta)),
            Err(Error::Closed)
        ));
    }
}
