//! Crate-wide error type.
//!
//! Every layer returns `Error` directly; lower layers attach the
//! operation and resource context (path, page id, key) in the variant
//! fields so upper layers can wrap without losing the cause chain.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::page::PageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Caller bugs.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("key is {len} bytes, maximum is {max}")]
    KeyTooLarge { len: usize, max: usize },

    #[error("value is {len} bytes, maximum is {max}")]
    ValueTooLarge { len: usize, max: usize },

    // Expected conditions.
    #[error("key not found")]
    KeyNotFound,

    // Lifecycle.
    #[error("database is closed")]
    Closed,

    #[error("iterator is closed")]
    IteratorClosed,

    // Integrity.
    #[error("corrupted data: {context}")]
    Corrupted { context: String },

    #[error("checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },

    // Environment.
    #[error("io error during {op}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("storage is full")]
    StorageFull,

    #[error("database at {path} is locked by another process")]
    StorageLocked { path: PathBuf },

    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("page {page_id} is out of range (file holds {page_count} pages)")]
    PageOutOfRange { page_id: PageId, page_count: u32 },

    #[error("page {page_id} is not cached")]
    PageNotCached { page_id: PageId },

    #[error("buffer pool exhausted: all frames are pinned")]
    BufferExhausted,

    // Concurrency.
    #[error("transaction {txn_id} conflicts with a concurrent transaction")]
    TxnConflict { txn_id: u64 },

    #[error("transaction {txn_id} was chosen as a deadlock victim")]
    TxnDeadlock { txn_id: u64 },

    #[error("transaction {txn_id} timed out")]
    TxnTimeout { txn_id: u64 },

    #[error("database is opened read-only")]
    ReadOnly,

    // Startup.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Error::Io { op, source }
    }

    /// Whether a caller may retry the failed operation and expect it to
    /// succeed. Conflicts and deadlocks clear once the competing
    /// transaction finishes; transient storage pressure clears on its
    /// own. Everything else is either a bug or a permanent condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TxnConflict { .. }
                | Error::TxnDeadlock { .. }
                | Error::StorageUnavailable { .. }
        )
    }
}
