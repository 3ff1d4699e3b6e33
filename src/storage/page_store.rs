//! Page allocation and database-level metadata.
//!
//! The store owns the allocation state: the next fresh page id and the
//! free list, which is persisted as a chain through the `next_page`
//! field of `Free`-typed pages. The meta page (page 0) additionally
//! carries the key count, the clean-shutdown marker and the last
//! checkpoint LSN. Allocation is not transactional: a crash can leak a
//! freshly allocated page, never corrupt one.

use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::codec::{ByteWriter, Decode};
use crate::error::{Error, Result};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::disk::DiskManager;
use crate::storage::page::{
    Page, PageId, PageType, INVALID_PAGE_ID, META_PAGE_ID, TREE_META_PAGE_ID,
};
use crate::wal::record::Lsn;

const META_MAGIC: u32 = 0x4252_5557; // "BURW"
const META_FORMAT_VERSION: u32 = 1;

/// Decoded content of the meta page.
#[derive(Debug, Clone, Copy)]
pub struct MetaState {
    pub next_page_id: PageId,
    pub free_list_head: PageId,
    pub free_page_count: u32,
    pub num_keys: i64,
    pub clean_shutdown: bool,
    pub last_checkpoint_lsn: Lsn,
}

struct AllocState {
    next_page_id: PageId,
    free_list_head: PageId,
    free_page_count: u32,
}

pub struct PageStore {
    pool: Arc<BufferPool>,
    disk: Arc<DiskManager>,
    alloc: Mutex<AllocState>,
    num_keys: AtomicI64,
}

impl PageStore {
    /// Lays out a fresh database: meta page, tree meta page, and an
    /// empty root leaf. Runs below the buffer pool, before anything
    /// else touches the file.
    pub fn initialize(disk: &DiskManager) -> Result<()> {
        let meta = MetaState {
            next_page_id: 3,
            free_list_head: INVALID_PAGE_ID,
            free_page_count: 0,
            num_keys: 0,
            clean_shutdown: true,
            last_checkpoint_lsn: 0,
        };
        disk.write_page(&encode_meta_page(&meta))?;

        let mut tree_meta = Page::new(TREE_META_PAGE_ID, PageType::Meta);
        let mut w = ByteWriter::new();
        w.put(&2u32); // root
        w.put(&0u32); // height
        tree_meta.set_body(w.as_slice(), 0);
        disk.write_page(&tree_meta)?;

        disk.write_page(&Page::new(2, PageType::Leaf))?;
        disk.sync()?;
        debug!("initialized fresh database layout");
        Ok(())
    }

    pub fn load(pool: Arc<BufferPool>, disk: Arc<DiskManager>) -> Result<Self> {
        let meta = read_meta(&disk)?;
        Ok(Self {
            pool,
            disk,
            alloc: Mutex::new(AllocState {
                next_page_id: meta.next_page_id,
                free_list_head: meta.free_list_head,
                free_page_count: meta.free_page_count,
            }),
            num_keys: AtomicI64::new(meta.num_keys),
        })
    }

    pub fn read_meta_state(disk: &DiskManager) -> Result<MetaState> {
        read_meta(disk)
    }

    /// Returns a pinned, in-pool page of the requested type, reusing a
    /// free page when one exists.
    pub fn allocate(&self, page_type: PageType) -> Result<Arc<RwLock<Page>>> {
        let mut alloc = self.alloc.lock().unwrap();

        if alloc.free_list_head != INVALID_PAGE_ID {
            let id = alloc.free_list_head;
            let page_rc = self.pool.get_page(id)?;
            {
                let mut page = page_rc.write().unwrap();
                if page.page_type != PageType::Free {
                    // A stale chain head (possible after a crash before
                    // the meta page was rewritten): disown the list
                    // rather than hand out a live page.
                    warn!("free list head {} is not a free page, dropping list", id);
                    alloc.free_list_head = INVALID_PAGE_ID;
                    alloc.free_page_count = 0;
                    drop(page);
                    self.pool.unpin_page(id, false)?;
                    drop(alloc);
                    return self.allocate(page_type);
                }
                alloc.free_list_head = page.next_page;
                alloc.free_page_count -= 1;

                page.page_type = page_type;
                page.next_page = INVALID_PAGE_ID;
                page.set_body(&[], 0);
            }
            debug!("allocated page {} from the free list", id);
            return Ok(page_rc);
        }

        let id = alloc.next_page_id;
        alloc.next_page_id += 1;
        drop(alloc);
        debug!("allocated fresh page {}", id);
        self.pool.put_new_page(Page::new(id, page_type))
    }

    /// Marks a page free and pushes it onto the free-list chain. The
    /// meta page and the freed page are not part of any transaction;
    /// callers only free pages no committed state references.
    pub fn free_page(&self, id: PageId) -> Result<()> {
        if id == INVALID_PAGE_ID || id == META_PAGE_ID || id == TREE_META_PAGE_ID {
            return Err(Error::Corrupted {
                context: format!("attempt to free reserved page {}", id),
            });
        }
        let mut alloc = self.alloc.lock().unwrap();
        let page_rc = self.pool.get_page(id)?;
        {
            let mut page = page_rc.write().unwrap();
            page.page_type = PageType::Free;
            page.next_page = alloc.free_list_head;
            page.set_body(&[], 0);
        }
        self.pool.unpin_page(id, true)?;
        alloc.free_list_head = id;
        alloc.free_page_count += 1;
        debug!("freed page {}", id);
        Ok(())
    }

    pub fn num_keys(&self) -> i64 {
        self.num_keys.load(Ordering::Acquire)
    }

    pub fn add_keys(&self, delta: i64) {
        self.num_keys.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set_num_keys(&self, value: i64) {
        self.num_keys.store(value, Ordering::Release);
    }

    pub fn free_page_count(&self) -> u32 {
        self.alloc.lock().unwrap().free_page_count
    }

    /// Raises the fresh-id watermark; recovery calls this with the
    /// highest page id named in the log.
    pub fn ensure_next_page_id(&self, floor: PageId) {
        let mut alloc = self.alloc.lock().unwrap();
        if alloc.next_page_id < floor {
            alloc.next_page_id = floor;
        }
    }

    /// Re-walks the persisted free chain after a crash, truncating it
    /// at the first page that is no longer free (the head recorded at
    /// the last checkpoint may have been reallocated since).
    pub fn rebuild_free_list(&self) -> Result<()> {
        let mut alloc = self.alloc.lock().unwrap();
        let mut head = alloc.free_list_head;
        let mut count = 0u32;
        let mut cursor = head;
        while cursor != INVALID_PAGE_ID {
            match self.disk.read_page(cursor) {
                Ok(page) if page.page_type == PageType::Free => {
                    count += 1;
                    cursor = page.next_page;
                }
                _ => {
                    if count == 0 {
                        head = INVALID_PAGE_ID;
                    } else {
                        // Truncation happens implicitly: the chain up
                        // to here stays linked, the stale tail is
                        // abandoned.
                        warn!("free list truncated at page {}", cursor);
                    }
                    break;
                }
            }
        }
        if count == 0 {
            head = INVALID_PAGE_ID;
        }
        alloc.free_list_head = head;
        alloc.free_page_count = count;
        Ok(())
    }

    /// Writes the meta page straight to disk and fsyncs. Called at
    /// checkpoint and close; never part of a transaction.
    pub fn save_meta(&self, clean_shutdown: bool, last_checkpoint_lsn: Lsn) -> Result<()> {
        let alloc = self.alloc.lock().unwrap();
        let meta = MetaState {
            next_page_id: alloc.next_page_id,
            free_list_head: alloc.free_list_head,
            free_page_count: alloc.free_page_count,
            num_keys: self.num_keys.load(Ordering::Acquire),
            clean_shutdown,
            last_checkpoint_lsn,
        };
        drop(alloc);
        // Drop any cached copy so later reads see this version.
        self.pool.discard_page(META_PAGE_ID);
        self.disk.write_page(&encode_meta_page(&meta))?;
        self.disk.sync()
    }
}

fn encode_meta_page(meta: &MetaState) -> Page {
    let mut w = ByteWriter::new();
    w.put(&META_MAGIC);
    w.put(&META_FORMAT_VERSION);
    w.put(&meta.next_page_id);
    w.put(&meta.free_list_head);
    w.put(&meta.free_page_count);
    w.put(&meta.num_keys);
    w.put(&meta.clean_shutdown);
    w.put(&meta.last_checkpoint_lsn);

    let mut page = Page::new(META_PAGE_ID, PageType::Meta);
    page.set_body(w.as_slice(), 0);
    page
}

fn read_meta(disk: &DiskManager) -> Result<MetaState> {
    let page = disk.read_page(META_PAGE_ID)?;
    let mut r = Cursor::new(page.body());

    let magic = u32::decode_from(&mut r)?;
    if magic != META_MAGIC {
        return Err(Error::Corrupted {
            context: format!("bad meta page magic {:#010x}", magic),
        });
    }
    let version = u32::decode_from(&mut r)?;
    if version != META_FORMAT_VERSION {
        return Err(Error::Corrupted {
            context: format!("unsupported format version {}", version),
        });
    }

    Ok(MetaState {
        next_page_id: PageId::decode_from(&mut r)?,
        free_list_head: PageId::decode_from(&mut r)?,
        free_page_count: u32::decode_from(&mut r)?,
        num_keys: i64::decode_from(&mut r)?,
        clean_shutdown: bool::decode_from(&mut r)?,
        last_checkpoint_lsn: Lsn::decode_from(&mut r)?,
    })
}
