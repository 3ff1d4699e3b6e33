//! Buffer pool: a fixed-capacity cache of pages with pin/unpin
//! semantics and LRU eviction.
//!
//! One pool-wide mutex serializes the frame table and the LRU list;
//! statistics are atomics. A pinned frame is never evicted. Before any
//! dirty page reaches disk the log is flushed through the page's LSN
//! (the WAL rule), whether the write-back comes from eviction or from
//! an explicit flush.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageId};
use crate::wal::log_manager::LogManager;
use crate::wal::record::{Lsn, NO_LSN};

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferPoolStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_evictions: u64,
}

struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: u32,
    is_dirty: bool,
    /// LSN of the record that first dirtied this page since its last
    /// flush; the recovery_lsn reported to checkpoints.
    first_dirty_lsn: Lsn,
}

struct PoolInner {
    frames: HashMap<PageId, Frame>,
    /// Front = most recently used. Invariant: same key set as `frames`.
    lru: VecDeque<PageId>,
}

pub struct BufferPool {
    disk: Arc<DiskManager>,
    wal: Arc<LogManager>,
    capacity: usize,
    inner: Mutex<PoolInner>,

    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    dirty_evictions: AtomicU64,
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>, wal: Arc<LogManager>, capacity: usize) -> Self {
        Self {
            disk,
            wal,
            capacity,
            inner: Mutex::new(PoolInner {
                frames: HashMap::with_capacity(capacity),
                lru: VecDeque::with_capacity(capacity),
            }),
            total_requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            dirty_evictions: AtomicU64::new(0),
        }
    }

    /// Returns the cached page, loading it from disk on a miss, and
    /// pins it. Every call must be paired with `unpin_page`.
    pub fn get_page(&self, id: PageId) -> Result<Arc<RwLock<Page>>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.pin_count += 1;
            let page = Arc::clone(&frame.page);
            touch_lru(&mut inner.lru, id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if inner.frames.len() >= self.capacity {
            self.evict(&mut inner)?;
        }

        let page = self.disk.read_page(id)?;
        trace!("loaded page {} into the pool", id);
        let page = Arc::new(RwLock::new(page));
        inner.frames.insert(
            id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                is_dirty: false,
                first_dirty_lsn: NO_LSN,
            },
        );
        inner.lru.push_front(id);
        Ok(page)
    }

    /// Inserts a freshly allocated page that has no disk image yet. The
    /// frame starts dirty so eviction writes it out, and pinned like
    /// any `get_page` result.
    pub fn put_new_page(&self, page: Page) -> Result<Arc<RwLock<Page>>> {
        let id = page.id;
        let mut inner = self.inner.lock().unwrap();
        if inner.frames.len() >= self.capacity {
            self.evict(&mut inner)?;
        }

        let page = Arc::new(RwLock::new(page));
        let replaced = inner.frames.insert(
            id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                is_dirty: true,
                first_dirty_lsn: NO_LSN,
            },
        );
        assert!(replaced.is_none(), "page {} already cached", id);
        inner.lru.push_front(id);
        Ok(page)
    }

    pub fn unpin_page(&self, id: PageId, is_dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner
            .frames
            .get_mut(&id)
            .ok_or(Error::PageNotCached { page_id: id })?;
        assert!(frame.pin_count > 0, "unpin of unpinned page {}", id);
        frame.pin_count -= 1;
        if is_dirty && !frame.is_dirty {
            frame.is_dirty = true;
            frame.first_dirty_lsn = frame.page.read().unwrap().lsn;
        }
        Ok(())
    }

    pub fn flush_page(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner
            .frames
            .get_mut(&id)
            .ok_or(Error::PageNotCached { page_id: id })?;
        self.write_back(frame)
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<PageId> = inner.frames.keys().copied().collect();
        for id in ids {
            let frame = inner.frames.get_mut(&id).unwrap();
            self.write_back(frame)?;
        }
        Ok(())
    }

    /// Drops a cached page without writing it back. Used when an abort
    /// has already restored the page's content elsewhere, and when a
    /// deallocated page's cached copy must not resurface.
    pub fn discard_page(&self, id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.frames.remove(&id).is_some() {
            inner.lru.retain(|&p| p != id);
        }
    }

    /// Snapshot of (page_id, recovery_lsn) for every dirty frame; the
    /// dirty page table a checkpoint records.
    pub fn dirty_page_table(&self) -> Vec<(PageId, Lsn)> {
        let inner = self.inner.lock().unwrap();
        inner
            .frames
            .iter()
            .filter(|(_, f)| f.is_dirty)
            .map(|(&id, f)| (id, f.first_dirty_lsn))
            .collect()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dirty_evictions: self.dirty_evictions.load(Ordering::Relaxed),
        }
    }

    /// Evicts the least recently used unpinned frame, writing it back
    /// first if dirty. Fails with `BufferExhausted` when every frame is
    /// pinned.
    fn evict(&self, inner: &mut PoolInner) -> Result<()> {
        let victim = inner
            .lru
            .iter()
            .rev()
            .copied()
            .find(|id| inner.frames[id].pin_count == 0)
            .ok_or(Error::BufferExhausted)?;

        let frame = inner.frames.get_mut(&victim).unwrap();
        if frame.is_dirty {
            self.write_back(frame)?;
            self.dirty_evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.frames.remove(&victim);
        inner.lru.retain(|&p| p != victim);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("evicted page {}", victim);
        Ok(())
    }

    fn write_back(&self, frame: &mut Frame) -> Result<()> {
        if !frame.is_dirty {
            return Ok(());
        }
        let page = frame.page.read().unwrap();
        self.wal.flush_until(page.lsn)?;
        self.disk.write_page(&page)?;
        drop(page);
        frame.is_dirty = false;
        frame.first_dirty_lsn = NO_LSN;
        Ok(())
    }
}

fn touch_lru(lru: &mut VecDeque<PageId>, id: PageId) {
    if lru.front() == Some(&id) {
        return;
    }
    if let Some(pos) = lru.iter().position(|&p| p == id) {
        lru.remove(pos);
    }
    lru.push_front(id);
}
