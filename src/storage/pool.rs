//! # Buffer Pool
//!
//! The pool owns `pages.bin` and mediates every page access: loads on
//! miss, strict LRU eviction that respects pins, allocation of fresh
//! pages, and the header round-trip that persists allocation state.
//!
//! ## Handles and Pinning
//!
//! Pages are handed out as [`PageHandle`]s (`Rc<RefCell<RecordPage>>`).
//! The `Rc` strong count doubles as the pin count: while any caller holds
//! a handle the count exceeds one and the page cannot be evicted. Dropping
//! the handle unpins it. There is no other locking in the system.
//!
//! ## Eviction
//!
//! On a miss with a full cache, the LRU list is scanned from the tail for
//! the first unpinned entry; that page is serialized to its offset and
//! dropped. If every cached page is pinned the operation fails: that is
//! a caller pinning-discipline bug, not a recoverable condition.
//!
//! Only cache hits promote an entry to the head of the list; newly
//! installed entries also start at the head.
//!
//! ## Allocation
//!
//! New pages come from, in order of preference:
//!
//! 1. the high-water region, while `empty_pages_start + P` still fits in
//!    the file (left behind by tail discards),
//! 2. the discarded-offset list (LIFO),
//! 3. growing the file by one page.
//!
//! `discard_page` is the inverse: a discard at the high-water boundary
//! shrinks the mark, anything else joins the discarded list. The list
//! must fit in the header page; overflowing it is an error.
//!
//! ## Shutdown
//!
//! `close` serializes every cached page and then writes the header page, so the
//! header is the file's last write, followed by fsync. `Drop` runs
//! the same path best-effort for pools abandoned without a close.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{is_data_page_offset, RecordPage, StoreHeader};
use crate::config::MIN_POOL_CAPACITY;

/// Shared, reference-counted alias for a cached page. The strong count is
/// the pin count: 1 means only the pool holds the page.
pub type PageHandle<const P: usize, const R: usize, const K: usize> =
    Rc<RefCell<RecordPage<P, R, K>>>;

/// LRU page cache over `pages.bin` with pin-aware eviction and free-space
/// management.
pub struct BufferPool<const P: usize, const R: usize, const K: usize> {
    file: RefCell<File>,
    path: PathBuf,
    capacity: usize,
    /// MRU at the front.
    lru: RefCell<VecDeque<u64>>,
    pages: RefCell<HashMap<u64, PageHandle<P, R, K>>>,
    empty_pages_start: Cell<u64>,
    discarded: RefCell<Vec<u64>>,
    closed: Cell<bool>,
}

impl<const P: usize, const R: usize, const K: usize> BufferPool<P, R, K> {
    /// Opens `pages.bin`, creating it with a fresh header when absent.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= MIN_POOL_CAPACITY,
            "pool capacity {} below minimum {}",
            capacity,
            MIN_POOL_CAPACITY
        );
        ensure!(K <= R, "key size {} exceeds record size {}", K, R);
        ensure!(
            RecordPage::<P, R, K>::CAPACITY >= 2,
            "page size {} cannot hold two {}-byte records plus the page header",
            P,
            R
        );

        let path = path.as_ref().to_path_buf();
        let fresh = !path.exists();
        if fresh {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
                }
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;

        let header = if fresh {
            let header = StoreHeader::new(P);
            file.set_len(P as u64)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.to_bytes(P)?)?;
            debug!(path = %path.display(), "created pages file");
            header
        } else {
            let mut block = vec![0u8; P];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut block)
                .wrap_err("failed to read store header")?;
            let header = StoreHeader::from_bytes(&block, P)?;
            let file_size = file.metadata()?.len();
            ensure!(
                header.empty_pages_start <= file_size,
                "store header corrupt: empty_pages_start {:#x} beyond file end {:#x}",
                header.empty_pages_start,
                file_size
            );
            header
        };

        Ok(Self {
            file: RefCell::new(file),
            path,
            capacity,
            lru: RefCell::new(VecDeque::with_capacity(capacity)),
            pages: RefCell::new(HashMap::with_capacity(capacity)),
            empty_pages_start: Cell::new(header.empty_pages_start),
            discarded: RefCell::new(header.discarded_offsets),
            closed: Cell::new(false),
        })
    }

    /// Handle to the page at `offset`, loading it from disk on a miss.
    /// A hit promotes the page to the head of the LRU.
    pub fn get_page(&self, offset: u64) -> Result<PageHandle<P, R, K>> {
        self.ensure_data_offset(offset)?;

        let hit = self.pages.borrow().get(&offset).cloned();
        if let Some(handle) = hit {
            self.touch(offset);
            return Ok(handle);
        }

        let file_size = self.file_size()?;
        ensure!(
            offset + P as u64 <= file_size,
            "invalid offset {:#x}: beyond end of {} ({:#x} bytes)",
            offset,
            self.path.display(),
            file_size
        );

        self.make_room()?;

        let mut block = vec![0u8; P];
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut block)
                .wrap_err_with(|| format!("failed to read page at {:#x}", offset))?;
        }
        let handle: PageHandle<P, R, K> = Rc::new(RefCell::new(RecordPage::from_bytes(&block)?));

        self.install(offset, Rc::clone(&handle));
        debug!(offset, "loaded page");
        Ok(handle)
    }

    /// Allocates a page and returns a handle plus its offset. The page's
    /// next-pointer starts at `next_page_offset` (use
    /// [`crate::storage::NONE_OFFSET`] for a chain tail); nothing is read
    /// from disk, even when a discarded offset is reused.
    pub fn get_new_page(&self, next_page_offset: u64) -> Result<(PageHandle<P, R, K>, u64)> {
        let file_size = self.file_size()?;
        let offset = if self.empty_pages_start.get() + P as u64 <= file_size {
            let offset = self.empty_pages_start.get();
            self.empty_pages_start.set(offset + P as u64);
            offset
        } else if let Some(offset) = self.discarded.borrow_mut().pop() {
            offset
        } else {
            let offset = file_size;
            self.file.borrow().set_len(file_size + P as u64)?;
            self.empty_pages_start.set(offset + P as u64);
            offset
        };

        self.make_room()?;
        let handle: PageHandle<P, R, K> =
            Rc::new(RefCell::new(RecordPage::new(next_page_offset)));
        self.install(offset, Rc::clone(&handle));
        debug!(offset, "allocated page");
        Ok((handle, offset))
    }

    /// Drops the page at `offset` from the cache without flushing and
    /// returns its slot to the free space: a discard at the high-water
    /// boundary shrinks the mark, anything else joins the discarded list.
    pub fn discard_page(&self, offset: u64) -> Result<()> {
        self.ensure_data_offset(offset)?;

        self.pages.borrow_mut().remove(&offset);
        let mut lru = self.lru.borrow_mut();
        if let Some(pos) = lru.iter().position(|&o| o == offset) {
            lru.remove(pos);
        }
        drop(lru);

        if offset + P as u64 == self.empty_pages_start.get() {
            self.empty_pages_start.set(offset);
        } else {
            let mut discarded = self.discarded.borrow_mut();
            ensure!(
                discarded.len() < StoreHeader::max_discarded(P),
                "discarded page list no longer fits the header page ({} entries)",
                discarded.len()
            );
            discarded.push(offset);
        }
        debug!(offset, "discarded page");
        Ok(())
    }

    /// True iff the page at `offset` is currently cached.
    pub fn query_page(&self, offset: u64) -> bool {
        self.pages.borrow().contains_key(&offset)
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.pages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.borrow().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Serializes every cached page to its offset. The cache keeps its
    /// contents; this is the bulk half of `close`.
    pub fn flush_all(&self) -> Result<()> {
        let pages = self.pages.borrow();
        for (&offset, handle) in pages.iter() {
            self.write_page(offset, &handle.borrow())?;
        }
        Ok(())
    }

    /// Flushes all pages, then writes the header page (the file's
    /// last write), then fsyncs.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        let header = StoreHeader {
            empty_pages_start: self.empty_pages_start.get(),
            discarded_offsets: self.discarded.borrow().clone(),
        };
        let block = header.to_bytes(P)?;
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&block)?;
            file.sync_all()?;
        }
        self.closed.set(true);
        debug!(path = %self.path.display(), "closed pages file");
        Ok(())
    }

    /// Current size of the pages file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.borrow().metadata()?.len())
    }

    fn ensure_data_offset(&self, offset: u64) -> Result<()> {
        ensure!(
            is_data_page_offset(offset, P),
            "invalid offset {:#x}: not a data page in {}-byte pages",
            offset,
            P
        );
        Ok(())
    }

    fn touch(&self, offset: u64) {
        let mut lru = self.lru.borrow_mut();
        if let Some(pos) = lru.iter().position(|&o| o == offset) {
            lru.remove(pos);
        }
        lru.push_front(offset);
    }

    fn install(&self, offset: u64, handle: PageHandle<P, R, K>) {
        self.pages.borrow_mut().insert(offset, handle);
        self.lru.borrow_mut().push_front(offset);
    }

    /// Evicts the least recently used unpinned page when the cache is at
    /// capacity, serializing it first.
    fn make_room(&self) -> Result<()> {
        if self.pages.borrow().len() < self.capacity {
            return Ok(());
        }

        let victim = {
            let lru = self.lru.borrow();
            let pages = self.pages.borrow();
            lru.iter()
                .rev()
                .find(|offset| {
                    pages
                        .get(*offset)
                        .is_some_and(|handle| Rc::strong_count(handle) == 1)
                })
                .copied()
        };
        let Some(offset) = victim else {
            bail!(
                "all pages pinned: cannot evict from a pool of {} pages",
                self.capacity
            );
        };

        let handle = match self.pages.borrow_mut().remove(&offset) {
            Some(handle) => handle,
            None => bail!("eviction victim {:#x} vanished from the cache", offset),
        };
        let mut lru = self.lru.borrow_mut();
        if let Some(pos) = lru.iter().position(|&o| o == offset) {
            lru.remove(pos);
        }
        drop(lru);

        self.write_page(offset, &handle.borrow())?;
        debug!(offset, "evicted page");
        Ok(())
    }

    fn write_page(&self, offset: u64, page: &RecordPage<P, R, K>) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.as_bytes())
            .wrap_err_with(|| format!("failed to write page at {:#x}", offset))?;
        Ok(())
    }
}

impl<const P: usize, const R: usize, const K: usize> Drop for BufferPool<P, R, K> {
    fn drop(&mut self) {
        if !self.closed.get() {
            if let Err(err) = self.close() {
                warn!(path = %self.path.display(), %err, "buffer pool close failed during drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NONE_OFFSET;
    use tempfile::tempdir;

    const PAGE: usize = 256;
    const REC: usize = 32;
    const KEY: usize = 8;
    type TestPool = BufferPool<PAGE, REC, KEY>;

    fn record(key: u64) -> [u8; REC] {
        let mut r = [0u8; REC];
        r[..8].copy_from_slice(&key.to_be_bytes());
        r
    }

    #[test]
    fn open_creates_file_with_header_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");

        let pool = TestPool::open(&path, 4).unwrap();
        assert!(pool.is_empty());
        drop(pool);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE as u64);
    }

    #[test]
    fn open_rejects_degenerate_geometry() {
        let dir = tempdir().unwrap();
        // 32-byte pages cannot hold two 32-byte records.
        assert!(BufferPool::<32, 32, 8>::open(dir.path().join("p.bin"), 4).is_err());
        assert!(TestPool::open(dir.path().join("q.bin"), 1).is_err());
    }

    #[test]
    fn new_pages_get_distinct_aligned_offsets() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 16).unwrap();

        let mut offsets = Vec::new();
        for _ in 0..10 {
            let (handle, offset) = pool.get_new_page(NONE_OFFSET).unwrap();
            assert_ne!(offset, 0);
            assert_eq!(offset % PAGE as u64, 0);
            assert!(pool.query_page(offset));
            offsets.push(offset);
            drop(handle);
        }
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 10);
    }

    #[test]
    fn get_page_rejects_bad_offsets() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 4).unwrap();

        assert!(pool.get_page(0).is_err());
        assert!(pool.get_page(NONE_OFFSET).is_err());
        assert!(pool.get_page(PAGE as u64 + 1).is_err());
        // Aligned but beyond the end of the file.
        assert!(pool.get_page(100 * PAGE as u64).is_err());
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 3).unwrap();

        let mut offsets = Vec::new();
        for _ in 0..3 {
            let (_, offset) = pool.get_new_page(NONE_OFFSET).unwrap();
            offsets.push(offset);
        }
        // Touch the oldest so the middle one becomes the victim.
        let _ = pool.get_page(offsets[0]).unwrap();
        let (_, fourth) = pool.get_new_page(NONE_OFFSET).unwrap();

        assert!(pool.query_page(offsets[0]));
        assert!(!pool.query_page(offsets[1]));
        assert!(pool.query_page(offsets[2]));
        assert!(pool.query_page(fourth));
    }

    #[test]
    fn eviction_skips_pinned_pages() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 2).unwrap();

        let (pinned, pinned_offset) = pool.get_new_page(NONE_OFFSET).unwrap();
        let (_, second) = pool.get_new_page(NONE_OFFSET).unwrap();
        let (_, third) = pool.get_new_page(NONE_OFFSET).unwrap();

        // The pinned page is older than `second`, yet survives.
        assert!(pool.query_page(pinned_offset));
        assert!(!pool.query_page(second));
        assert!(pool.query_page(third));
        drop(pinned);
    }

    #[test]
    fn all_pages_pinned_fails() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 2).unwrap();

        let _a = pool.get_new_page(NONE_OFFSET).unwrap();
        let _b = pool.get_new_page(NONE_OFFSET).unwrap();

        let result = pool.get_new_page(NONE_OFFSET);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("pinned"));
    }

    #[test]
    fn evicted_pages_are_flushed_and_reloadable() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 2).unwrap();

        let (handle, offset) = pool.get_new_page(NONE_OFFSET).unwrap();
        handle.borrow_mut().insert(&record(42), true);
        drop(handle);

        // Force the first page out of the cache.
        let (_, _b) = pool.get_new_page(NONE_OFFSET).unwrap();
        let (_, _c) = pool.get_new_page(NONE_OFFSET).unwrap();
        assert!(!pool.query_page(offset));

        let reloaded = pool.get_page(offset).unwrap();
        assert!(reloaded.borrow().search(&record(42)).is_some());
    }

    #[test]
    fn discard_at_high_water_mark_shrinks_it() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 4).unwrap();

        let (_, a) = pool.get_new_page(NONE_OFFSET).unwrap();
        let (b_handle, b) = pool.get_new_page(NONE_OFFSET).unwrap();
        drop(b_handle);
        assert!(b > a);

        pool.discard_page(b).unwrap();
        assert!(!pool.query_page(b));

        // The slot below the shrunk mark is reused first.
        let (_, again) = pool.get_new_page(NONE_OFFSET).unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn discarded_offsets_are_reused_lifo() {
        let dir = tempdir().unwrap();
        let pool = TestPool::open(dir.path().join("pages.bin"), 8).unwrap();

        let mut offsets = Vec::new();
        for _ in 0..4 {
            let (_, offset) = pool.get_new_page(NONE_OFFSET).unwrap();
            offsets.push(offset);
        }
        // Interior discards (the last page would shrink the mark instead).
        pool.discard_page(offsets[1]).unwrap();
        pool.discard_page(offsets[2]).unwrap();

        let (_, first) = pool.get_new_page(NONE_OFFSET).unwrap();
        let (_, second) = pool.get_new_page(NONE_OFFSET).unwrap();
        assert_eq!(first, offsets[2]);
        assert_eq!(second, offsets[1]);
    }

    #[test]
    fn header_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");

        let first_discard;
        {
            let pool = TestPool::open(&path, 8).unwrap();
            for _ in 0..4 {
                pool.get_new_page(NONE_OFFSET).unwrap();
            }
            let (_, victim) = pool.get_new_page(NONE_OFFSET).unwrap();
            // Make it interior by allocating one more past it.
            pool.get_new_page(NONE_OFFSET).unwrap();
            pool.discard_page(victim).unwrap();
            first_discard = victim;
            pool.close().unwrap();
        }

        let pool = TestPool::open(&path, 8).unwrap();
        let (_, reused) = pool.get_new_page(NONE_OFFSET).unwrap();
        assert_eq!(reused, first_discard);
    }

    #[test]
    fn pages_survive_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");

        let offset;
        {
            let pool = TestPool::open(&path, 4).unwrap();
            let (handle, o) = pool.get_new_page(NONE_OFFSET).unwrap();
            handle.borrow_mut().insert(&record(7), true);
            offset = o;
            pool.close().unwrap();
        }

        let pool = TestPool::open(&path, 4).unwrap();
        let page = pool.get_page(offset).unwrap();
        assert!(page.borrow().search(&record(7)).is_some());
        assert_eq!(page.borrow().len(), 1);
    }
}
