//! Write-ahead log.
//!
//! Records are appended to an in-memory tail buffer and made durable by
//! `flush_until`. The WAL rule is enforced by callers: any dirty page
//! with `page.lsn = L` is written back only after `flush_until(L)`
//! returns. Commits ride the same path; concurrent commits share one
//! fsync because the first flusher carries everyone's records down with
//! it (group commit).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use crate::codec::ByteWriter;
use crate::error::{Error, Result};
use crate::wal::record::{DecodeOutcome, LogRecord, LogRecordKind, Lsn, NO_LSN};

pub struct LogManager {
    inner: Mutex<LogInner>,
    /// Durable-through watermark, readable without the mutex.
    durable_lsn: AtomicU64,
    /// Highest assigned LSN, readable without the mutex.
    last_lsn: AtomicU64,
}

struct LogInner {
    path: PathBuf,
    file: File,
    /// Encoded records not yet written to the file.
    tail: Vec<u8>,
    next_lsn: Lsn,
    durable_lsn: Lsn,
}

impl LogManager {
    /// Opens the log at `<db-path>.wal`, scanning existing records to
    /// find the next LSN. A torn tail (partial or checksum-corrupt
    /// record) is truncated away; everything past it is lost, which is
    /// exactly the crash semantics the commit protocol promises.
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut os = db_path.to_path_buf().into_os_string();
        os.push(".wal");
        let path = PathBuf::from(os);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io("open log file", e))?;

        let buf = std::fs::read(&path).map_err(|e| Error::io("read log file", e))?;
        let mut pos = 0;
        let mut max_lsn = NO_LSN;
        loop {
            match LogRecord::decode(&buf, pos) {
                DecodeOutcome::Record(rec, next) => {
                    max_lsn = max_lsn.max(rec.lsn);
                    pos = next;
                }
                DecodeOutcome::End => break,
                DecodeOutcome::Torn(at) => {
                    warn!(
                        "truncating torn log tail at offset {} (file length {})",
                        at,
                        buf.len()
                    );
                    file.set_len(at as u64)
                        .map_err(|e| Error::io("truncate log", e))?;
                    break;
                }
            }
        }

        debug!("opened log {:?}: {} bytes, last lsn {}", path, pos, max_lsn);

        Ok(Self {
            durable_lsn: AtomicU64::new(max_lsn),
            last_lsn: AtomicU64::new(max_lsn),
            inner: Mutex::new(LogInner {
                path,
                file,
                tail: Vec::new(),
                next_lsn: max_lsn + 1,
                durable_lsn: max_lsn,
            }),
        })
    }

    /// Appends a record, assigning its LSN. The record is durable only
    /// after a later `flush_until` covers it.
    pub fn append(
        &self,
        kind: LogRecordKind,
        txn_id: u64,
        prev_lsn: Lsn,
        payload: Vec<u8>,
    ) -> Result<Lsn> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;

        let record = LogRecord {
            lsn,
            kind,
            txn_id,
            prev_lsn,
            payload,
        };
        let mut w = ByteWriter::new();
        record.encode_into(&mut w);
        inner.tail.extend_from_slice(w.as_slice());

        self.last_lsn.store(lsn, Ordering::Release);
        Ok(lsn)
    }

    /// Makes the log durable through at least `lsn`.
    pub fn flush_until(&self, lsn: Lsn) -> Result<()> {
        if self.durable_lsn.load(Ordering::Acquire) >= lsn {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        // Another flusher may have carried our records down while we
        // waited on the mutex.
        if inner.durable_lsn >= lsn {
            return Ok(());
        }
        inner.flush()?;
        self.durable_lsn.store(inner.durable_lsn, Ordering::Release);
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.flush_until(self.last_lsn.load(Ordering::Acquire))
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::Acquire)
    }

    /// Reads every record currently in the log, oldest first. Flushes
    /// the tail first so the scan sees everything appended so far.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        self.flush_all()?;
        let inner = self.inner.lock().unwrap();
        let buf = std::fs::read(&inner.path).map_err(|e| Error::io("read log file", e))?;

        let mut records = Vec::new();
        let mut pos = 0;
        loop {
            match LogRecord::decode(&buf, pos) {
                DecodeOutcome::Record(rec, next) => {
                    records.push(rec);
                    pos = next;
                }
                DecodeOutcome::End => break,
                DecodeOutcome::Torn(at) => {
                    // open() truncates the tail, so mid-run corruption
                    // here means the disk is actively lying to us.
                    warn!("ignoring torn log tail at offset {}", at);
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Drops every record below `horizon` by rewriting the live tail
    /// into a fresh file and renaming it over the old one. Called after
    /// a checkpoint makes the head reclaimable.
    pub fn compact(&self, horizon: Lsn) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush()?;
        self.durable_lsn.store(inner.durable_lsn, Ordering::Release);

        let buf = std::fs::read(&inner.path).map_err(|e| Error::io("read log file", e))?;
        let mut keep = Vec::new();
        let mut pos = 0;
        let mut dropped = 0u64;
        loop {
            match LogRecord::decode(&buf, pos) {
                DecodeOutcome::Record(rec, next) => {
                    if rec.lsn >= horizon {
                        keep.extend_from_slice(&buf[pos..next]);
                    } else {
                        dropped += 1;
                    }
                    pos = next;
                }
                DecodeOutcome::End | DecodeOutcome::Torn(_) => break,
            }
        }
        if dropped == 0 {
            return Ok(());
        }

        let mut tmp_os = inner.path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);
        let mut tmp = File::create(&tmp_path).map_err(|e| Error::io("create compacted log", e))?;
        tmp.write_all(&keep)
            .map_err(|e| Error::io("write compacted log", e))?;
        tmp.sync_data().map_err(|e| Error::io("fsync", e))?;
        std::fs::rename(&tmp_path, &inner.path).map_err(|e| Error::io("rename log", e))?;

        inner.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&inner.path)
            .map_err(|e| Error::io("reopen log", e))?;
        debug!(
            "compacted log below lsn {}: dropped {} records, kept {} bytes",
            horizon,
            dropped,
            keep.len()
        );
        Ok(())
    }
}

impl LogInner {
    fn flush(&mut self) -> Result<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        use std::io::Seek;
        self.file
            .seek(std::io::SeekFrom::End(0))
            .map_err(|e| Error::io("seek log", e))?;
        self.file
            .write_all(&self.tail)
            .map_err(|e| Error::io("append log", e))?;
        self.file.sync_data().map_err(|e| Error::io("fsync log", e))?;
        self.tail.clear();
        self.durable_lsn = self.next_lsn - 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db_path;
    use std::os::unix::fs::FileExt;

    #[test]
    fn test_lsn_assignment_and_flush() {
        let path = temp_db_path("wal_basic");
        let wal = LogManager::open(&path).unwrap();

        let a = wal
            .append(LogRecordKind::Begin, 1, NO_LSN, Vec::new())
            .unwrap();
        let b = wal
            .append(LogRecordKind::Commit, 1, a, Vec::new())
            .unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(wal.durable_lsn(), NO_LSN);

        wal.flush_until(b).unwrap();
        assert_eq!(wal.durable_lsn(), b);

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, LogRecordKind::Begin);
        assert_eq!(records[1].prev_lsn, a);
    }

    #[test]
    fn test_lsns_continue_after_reopen() {
        let path = temp_db_path("wal_reopen");
        let last = {
            let wal = LogManager::open(&path).unwrap();
            let lsn = wal
                .append(LogRecordKind::Begin, 1, NO_LSN, Vec::new())
                .unwrap();
            wal.flush_all().unwrap();
            lsn
        };

        let wal = LogManager::open(&path).unwrap();
        let next = wal
            .append(LogRecordKind::Begin, 2, NO_LSN, Vec::new())
            .unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let path = temp_db_path("wal_torn");
        {
            let wal = LogManager::open(&path).unwrap();
            wal.append(LogRecordKind::Begin, 1, NO_LSN, Vec::new())
                .unwrap();
            wal.append(LogRecordKind::Update, 1, 1, vec![7u8; 32])
                .unwrap();
            wal.flush_all().unwrap();
        }

        // Corrupt the second record on disk.
        let mut log_os = path.clone().into_os_string();
        log_os.push(".wal");
        let log_path = PathBuf::from(log_os);
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        let len = file.metadata().unwrap().len();
        file.write_all_at(&[0xa5], len - 10).unwrap();

        let wal = LogManager::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, LogRecordKind::Begin);
    }

    #[test]
    fn test_compaction_drops_old_records() {
        let path = temp_db_path("wal_compact");
        let wal = LogManager::open(&path).unwrap();
        for i in 0..10 {
            wal.append(LogRecordKind::Update, 1, i, vec![0u8; 16])
                .unwrap();
        }
        wal.flush_all().unwrap();

        let records = wal.read_all().unwrap();
        let horizon = records[5].lsn;
        wal.compact(horizon).unwrap();

        let kept = wal.read_all().unwrap();
        assert_eq!(kept.len(), 5);
        assert!(kept.iter().all(|r| r.lsn >= horizon));

        // Appends continue seamlessly after compaction.
        let next = wal
            .append(LogRecordKind::Commit, 1, NO_LSN, Vec::new())
            .unwrap();
        assert_eq!(next, records.last().unwrap().lsn + 1);
        wal.flush_all().unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 6);
    }
}
