//! Log record format.
//!
//! The log is an append-only sequence of checksummed records:
//!
//! ```text
//! u64 lsn | u8 kind | u64 txn_id | u64 prev_lsn | u32 payload_len | payload | u32 checksum
//! ```
//!
//! `prev_lsn` links a transaction's records into its undo chain. The
//! checksum is CRC32 over everything before it; a mismatch marks the
//! torn tail of the log after a crash.

use std::io::Cursor;

use crate::codec::{read_len_prefixed, ByteWriter, Decode};
use crate::error::{Error, Result};
use crate::storage::page::{PageId, PAGE_SIZE};

pub type Lsn = u64;

/// "No record": the prev_lsn of a transaction's first record.
pub const NO_LSN: Lsn = 0;

/// Fixed part of an encoded record: everything but payload + checksum.
pub const RECORD_HEADER_SIZE: usize = 8 + 1 + 8 + 8 + 4;

/// A page image plus framing; anything larger is corruption.
const MAX_IMAGE_SIZE: usize = PAGE_SIZE + 64;
/// Checkpoint payloads scale with table sizes; bound generously.
const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordKind {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Update = 3,
    Compensation = 4,
    Checkpoint = 5,
}

impl LogRecordKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogRecordKind::Begin),
            1 => Ok(LogRecordKind::Commit),
            2 => Ok(LogRecordKind::Abort),
            3 => Ok(LogRecordKind::Update),
            4 => Ok(LogRecordKind::Compensation),
            5 => Ok(LogRecordKind::Checkpoint),
            other => Err(Error::Corrupted {
                context: format!("invalid log record kind {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub kind: LogRecordKind,
    pub txn_id: u64,
    pub prev_lsn: Lsn,
    pub payload: Vec<u8>,
}

/// Result of pulling one record off a byte buffer.
pub enum DecodeOutcome {
    /// A whole, checksum-clean record; `usize` is the offset just past it.
    Record(LogRecord, usize),
    /// Clean end of the buffer.
    End,
    /// A partial or corrupt record starts at this offset; the log must
    /// be truncated here.
    Torn(usize),
}

impl LogRecord {
    pub fn encode_into(&self, w: &mut ByteWriter) {
        let start = w.len();
        w.put(&self.lsn);
        w.put(&(self.kind as u8));
        w.put(&self.txn_id);
        w.put(&self.prev_lsn);
        w.put_len_prefixed(&self.payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&w.as_slice()[start..]);
        w.put(&hasher.finalize());
    }

    pub fn decode(buf: &[u8], pos: usize) -> DecodeOutcome {
        if pos == buf.len() {
            return DecodeOutcome::End;
        }
        if pos + RECORD_HEADER_SIZE > buf.len() {
            return DecodeOutcome::Torn(pos);
        }

        let mut r = Cursor::new(&buf[pos..]);
        // Header reads cannot fail past the length check above.
        let lsn = Lsn::decode_from(&mut r).unwrap();
        let kind_tag = u8::decode_from(&mut r).unwrap();
        let txn_id = u64::decode_from(&mut r).unwrap();
        let prev_lsn = Lsn::decode_from(&mut r).unwrap();
        let payload_len = u32::decode_from(&mut r).unwrap() as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return DecodeOutcome::Torn(pos);
        }
        let body_end = pos + RECORD_HEADER_SIZE + payload_len;
        if body_end + 4 > buf.len() {
            return DecodeOutcome::Torn(pos);
        }

        let stored = u32::from_le_bytes(buf[body_end..body_end + 4].try_into().unwrap());
        let computed = crc32fast::hash(&buf[pos..body_end]);
        if stored != computed {
            return DecodeOutcome::Torn(pos);
        }

        let kind = match LogRecordKind::from_u8(kind_tag) {
            Ok(kind) => kind,
            Err(_) => return DecodeOutcome::Torn(pos),
        };

        DecodeOutcome::Record(
            LogRecord {
                lsn,
                kind,
                txn_id,
                prev_lsn,
                payload: buf[pos + RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            body_end + 4,
        )
    }
}

/// Payload of an `Update` record: before and after images of one page.
#[derive(Debug, Clone)]
pub struct UpdatePayload {
    pub page_id: PageId,
    pub offset: u16,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

impl UpdatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.before.len() + self.after.len() + 16);
        w.put(&self.page_id);
        w.put(&self.offset);
        w.put_len_prefixed(&self.before);
        w.put_len_prefixed(&self.after);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            page_id: PageId::decode_from(&mut r)?,
            offset: u16::decode_from(&mut r)?,
            before: read_len_prefixed(&mut r, MAX_IMAGE_SIZE)?,
            after: read_len_prefixed(&mut r, MAX_IMAGE_SIZE)?,
        })
    }
}

/// Payload of a `Compensation` record: the image the undo restored,
/// plus where to continue undoing if recovery is interrupted.
#[derive(Debug, Clone)]
pub struct CompensationPayload {
    pub page_id: PageId,
    pub undo_next_lsn: Lsn,
    pub image: Vec<u8>,
}

impl CompensationPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.image.len() + 16);
        w.put(&self.page_id);
        w.put(&self.undo_next_lsn);
        w.put_len_prefixed(&self.image);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            page_id: PageId::decode_from(&mut r)?,
            undo_next_lsn: Lsn::decode_from(&mut r)?,
            image: read_len_prefixed(&mut r, MAX_IMAGE_SIZE)?,
        })
    }
}

/// Payload of a `Checkpoint` record: snapshots of the transaction table
/// and the dirty page table at checkpoint time.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPayload {
    /// (txn_id, last_lsn) of every active transaction.
    pub active_txns: Vec<(u64, Lsn)>,
    /// (page_id, recovery_lsn): first LSN that dirtied the page since
    /// its last flush.
    pub dirty_pages: Vec<(PageId, Lsn)>,
}

impl CheckpointPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put(&(self.active_txns.len() as u32));
        for (txn_id, last_lsn) in &self.active_txns {
            w.put(txn_id);
            w.put(last_lsn);
        }
        w.put(&(self.dirty_pages.len() as u32));
        for (page_id, rec_lsn) in &self.dirty_pages {
            w.put(page_id);
            w.put(rec_lsn);
        }
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let txn_count = u32::decode_from(&mut r)?;
        let mut active_txns = Vec::with_capacity(txn_count as usize);
        for _ in 0..txn_count {
            active_txns.push((u64::decode_from(&mut r)?, Lsn::decode_from(&mut r)?));
        }
        let page_count = u32::decode_from(&mut r)?;
        let mut dirty_pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            dirty_pages.push((PageId::decode_from(&mut r)?, Lsn::decode_from(&mut r)?));
        }
        Ok(Self {
            active_txns,
            dirty_pages,
        })
    }
}
