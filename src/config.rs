//! Database configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::page::{PAGE_BODY_SIZE, PAGE_SIZE};
use crate::btree::node::NODE_HEADER_SIZE;

/// Transaction isolation level, enforced by read-lock duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// No read locks.
    ReadUncommitted,
    /// Shared locks released as soon as the read completes.
    ReadCommitted,
    /// Shared locks held until transaction end.
    RepeatableRead,
    /// Repeatable read plus scan locks held until transaction end.
    Serializable,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Options for a single transaction, overriding the database defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    pub isolation: Option<IsolationLevel>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub read_only: bool,

    /// Buffer pool size in bytes; translated to a frame count.
    pub buffer_pool_size: usize,
    /// Buffer pool size as an explicit page count; overrides
    /// `buffer_pool_size` when non-zero.
    pub cache_size: usize,

    /// Must equal [`PAGE_SIZE`]; recognized for format compatibility
    /// checks only, runtime-variable page sizes are not supported.
    pub page_size: usize,
    /// fsync the data file after every page write.
    pub sync_writes: bool,
    pub checksum_enabled: bool,
    /// Preallocate the data file to this many bytes at open.
    pub preallocate_size: u64,

    pub default_isolation_level: IsolationLevel,
    /// 0 means unlimited.
    pub max_active_transactions: usize,
    pub transaction_timeout: Option<Duration>,
    pub deadlock_detection_enabled: bool,
    pub deadlock_detection_interval: Duration,
    pub retry_policy: RetryPolicy,

    /// 0 means unlimited.
    pub max_concurrent_reads: usize,
    /// 0 means unlimited.
    pub max_concurrent_writes: usize,

    /// Maximum number of keys in an internal node is
    /// `branching_factor - 1`.
    pub branching_factor: usize,
    /// Maximum number of entries in a leaf.
    pub leaf_capacity: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_only: false,
            buffer_pool_size: 64 * 1024 * 1024,
            cache_size: 0,
            page_size: PAGE_SIZE,
            sync_writes: false,
            checksum_enabled: true,
            preallocate_size: 0,
            default_isolation_level: IsolationLevel::ReadCommitted,
            max_active_transactions: 0,
            transaction_timeout: None,
            deadlock_detection_enabled: true,
            deadlock_detection_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            max_concurrent_reads: 0,
            max_concurrent_writes: 0,
            branching_factor: 32,
            leaf_capacity: 8,
            max_key_size: 128,
            max_value_size: 512,
        }
    }
}

impl Config {
    /// Number of buffer pool frames this configuration yields.
    pub fn frame_count(&self) -> usize {
        if self.cache_size > 0 {
            self.cache_size
        } else {
            self.buffer_pool_size / PAGE_SIZE
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > 65536 {
            return Err(invalid(format!(
                "page_size {} out of bounds 1..=65536",
                self.page_size
            )));
        }
        if self.page_size != PAGE_SIZE {
            return Err(invalid(format!(
                "page_size must be {}, runtime-variable page sizes are not supported",
                PAGE_SIZE
            )));
        }

        // The pool must hold the meta pages plus one full root-to-leaf
        // descent at the same time.
        if self.frame_count() < 8 {
            return Err(invalid(format!(
                "buffer pool of {} frames is too small, need at least 8",
                self.frame_count()
            )));
        }

        if self.branching_factor < 3 {
            return Err(invalid("branching_factor must be at least 3".to_string()));
        }
        if self.leaf_capacity < 2 {
            return Err(invalid("leaf_capacity must be at least 2".to_string()));
        }
        if self.max_key_size == 0 {
            return Err(invalid("max_key_size must be at least 1".to_string()));
        }

        // A node one entry over its split trigger must still serialize
        // into a page body, for all admissible keys and values.
        let leaf_entry = 8 + self.max_key_size + self.max_value_size;
        let leaf_worst = NODE_HEADER_SIZE + (self.leaf_capacity + 1) * leaf_entry;
        if leaf_worst > PAGE_BODY_SIZE {
            return Err(invalid(format!(
                "a full leaf may need {} bytes but a page body holds {}; \
                 lower leaf_capacity, max_key_size or max_value_size",
                leaf_worst, PAGE_BODY_SIZE
            )));
        }
        let internal_worst = NODE_HEADER_SIZE
            + self.branching_factor * (4 + self.max_key_size)
            + (self.branching_factor + 1) * 4;
        if internal_worst > PAGE_BODY_SIZE {
            return Err(invalid(format!(
                "a full internal node may need {} bytes but a page body holds {}; \
                 lower branching_factor or max_key_size",
                internal_worst, PAGE_BODY_SIZE
            )));
        }

        if self.retry_policy.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry_policy.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.deadlock_detection_enabled && self.deadlock_detection_interval.is_zero() {
            return Err(invalid(
                "deadlock_detection_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidConfig { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_foreign_page_size() {
        let mut config = Config::default();
        config.page_size = 4096;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        config.page_size = 0;
        assert!(config.validate().is_err());
        config.page_size = 1 << 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_node_config() {
        let mut config = Config::default();
        config.leaf_capacity = 4;
        config.max_value_size = 4096;
        // 5 * (8 + 128 + 4096) > 8160
        assert!(config.validate().is_err());

        config.max_value_size = 1024;
        // 5 * (8 + 128 + 1024) = 5800, fits
        config.validate().unwrap();
    }

    #[test]
    fn test_cache_size_overrides_pool_bytes() {
        let mut config = Config::default();
        config.cache_size = 16;
        assert_eq!(config.frame_count(), 16);
        config.cache_size = 0;
        assert_eq!(config.frame_count(), 64 * 1024 * 1024 / PAGE_SIZE);
    }
}
