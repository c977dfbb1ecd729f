//! # Store Coordinator
//!
//! The exposed façade of slotdb. A `Store` glues the three layers
//! together: the branch index locates the leaf for a key, the buffer pool
//! produces a pinned handle to it, and the record page does the in-page
//! work. Structural maintenance (splits on the way up, merges and
//! borrows on the way down) runs here, because only the coordinator can
//! keep all three structures consistent across one operation.
//!
//! ## Bootstrap
//!
//! A fresh store allocates two leaves: the working left leaf, installed
//! in the branch index under the all-zero separator, and the tail leaf it
//! links to. The tail never receives records or an index entry; it
//! terminates the chain and gives `verify_order` a fixed endpoint.
//!
//! ## Insert
//!
//! ```text
//! locate leaf ──► equal-key chain walk by page minima
//!        │
//!        ▼
//!    leaf full? ──yes──► get_new_page ► split_with ► promote key
//!        │                                   │
//!        no ◄── pick side by promoted record ┘
//!        ▼
//!    page insert ──► (cursor, inserted)
//! ```
//!
//! ## Erase and Rebalance
//!
//! After an in-page erase drops a leaf below half capacity, the index
//! right neighbor decides the fix: merge when both fit in one page
//! (erase the neighbor's separator, discard its page), otherwise borrow
//! leading records and re-key the neighbor's separator. A rebalance
//! invalidates outstanding positions, so erase returns a boolean rather
//! than a cursor.
//!
//! ## Shutdown
//!
//! `close` writes `btree.bin`, then flushes the pool; the pages-file
//! header is the last write. Dropping an unclosed store runs the same
//! sequence best-effort.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result};
use tracing::{debug, warn};

use super::branch::{BranchIndex, Entry};
use super::iter::{Cursor, Iter};
use crate::config::{DEFAULT_BRANCH_FANOUT, MIN_POOL_CAPACITY};
use crate::storage::{BufferPool, PageHandle, RecordPage, NONE_OFFSET};

/// Ordered store of `R`-byte records keyed by their leading `K` bytes,
/// over `P`-byte pages. `ALLOW_DUP` selects whether equal records (and
/// separator keys) may repeat.
pub struct Store<const P: usize, const R: usize, const K: usize, const ALLOW_DUP: bool> {
    pool: BufferPool<P, R, K>,
    branches: BranchIndex<K>,
    btree_path: PathBuf,
    record_count: u64,
    closed: bool,
}

impl<const P: usize, const R: usize, const K: usize, const ALLOW_DUP: bool>
    Store<P, R, K, ALLOW_DUP>
{
    /// Opens (or creates) a store from its two files with the default
    /// branch fanout.
    pub fn open(
        pages_path: impl AsRef<Path>,
        btree_path: impl AsRef<Path>,
        pool_capacity: usize,
    ) -> Result<Self> {
        Self::open_with_fanout(pages_path, btree_path, pool_capacity, DEFAULT_BRANCH_FANOUT)
    }

    /// Opens a store, using `fanout` for a freshly created branch index.
    /// An existing `btree.bin` keeps the fanout it was saved with.
    pub fn open_with_fanout(
        pages_path: impl AsRef<Path>,
        btree_path: impl AsRef<Path>,
        pool_capacity: usize,
        fanout: usize,
    ) -> Result<Self> {
        ensure!(
            pool_capacity >= MIN_POOL_CAPACITY,
            "pool capacity {} below minimum {}",
            pool_capacity,
            MIN_POOL_CAPACITY
        );

        let pool = BufferPool::<P, R, K>::open(pages_path, pool_capacity)?;
        let btree_path = btree_path.as_ref().to_path_buf();

        let (mut branches, record_count) = if btree_path.exists() {
            BranchIndex::load(&btree_path, ALLOW_DUP)?
        } else {
            (BranchIndex::new(fanout, ALLOW_DUP)?, 0)
        };

        if branches.is_empty() {
            // Right first, then left, so the left leaf links to the tail.
            let (_right, right_offset) = pool.get_new_page(NONE_OFFSET)?;
            let (_left, left_offset) = pool.get_new_page(right_offset)?;
            branches.initialize_pages(
                [0u8; K],
                Self::page_id_of(right_offset),
                Self::page_id_of(left_offset),
            )?;
            debug!(left_offset, right_offset, "bootstrapped leaf pages");
        }

        Ok(Self {
            pool,
            branches,
            btree_path,
            record_count,
            closed: false,
        })
    }

    fn offset_of(page_id: u64) -> u64 {
        page_id * P as u64
    }

    fn page_id_of(offset: u64) -> u64 {
        offset / P as u64
    }

    fn extract_key(record: &[u8; R]) -> [u8; K] {
        let mut key = [0u8; K];
        key.copy_from_slice(&record[..K]);
        key
    }

    fn probe_key(probe: &[u8]) -> Result<[u8; K]> {
        ensure!(
            probe.len() == K || probe.len() == R,
            "probe must be a {}-byte key or a {}-byte record, got {} bytes",
            K,
            R,
            probe.len()
        );
        let mut key = [0u8; K];
        key.copy_from_slice(&probe[..K]);
        Ok(key)
    }

    /// Number of live records.
    pub fn len(&self) -> u64 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Cursor to the first record not less than `probe`; `None` when no
    /// record qualifies. The descent starts at the leaf strictly
    /// preceding the probe's key and follows the chain while pages stay
    /// below the probe, so equal-key runs straddling a separator are
    /// never skipped.
    pub fn search_lb(&self, probe: &[u8]) -> Result<Option<Cursor<'_, P, R, K>>> {
        let key = Self::probe_key(probe)?;
        let Some(entry) = self.branches.find_page_before(&key) else {
            return Ok(None);
        };
        let mut page = self.pool.get_page(Self::offset_of(entry.page_id))?;
        loop {
            let (slot, next) = {
                let p = page.borrow();
                (p.search_lb(probe), p.next_page_offset())
            };
            if slot < RecordPage::<P, R, K>::CAPACITY {
                return Ok(Some(Cursor::new(&self.pool, page, slot)));
            }
            if next == NONE_OFFSET {
                return Ok(None);
            }
            page = self.pool.get_page(next)?;
        }
    }

    /// Cursor to the first record strictly greater than `probe`,
    /// following the leaf chain past page boundaries; `None` when every
    /// record is `<= probe`.
    pub fn search_ub(&self, probe: &[u8]) -> Result<Option<Cursor<'_, P, R, K>>> {
        let key = Self::probe_key(probe)?;
        let Some(entry) = self.branches.find_page_before(&key) else {
            return Ok(None);
        };
        let mut page = self.pool.get_page(Self::offset_of(entry.page_id))?;
        loop {
            let (slot, next) = {
                let p = page.borrow();
                let slot = p.search_ub(probe);
                if slot < RecordPage::<P, R, K>::CAPACITY && p.bit(slot) {
                    (Some(slot), 0)
                } else {
                    (None, p.next_page_offset())
                }
            };
            if let Some(slot) = slot {
                return Ok(Some(Cursor::new(&self.pool, page, slot)));
            }
            if next == NONE_OFFSET {
                return Ok(None);
            }
            page = self.pool.get_page(next)?;
        }
    }

    /// Cursor to the record equal to `record`, scanning forward from the
    /// key's lower bound until something greater appears.
    pub fn search(&self, record: &[u8; R]) -> Result<Option<Cursor<'_, P, R, K>>> {
        let Some(mut cursor) = self.search_lb(&record[..K])? else {
            return Ok(None);
        };
        loop {
            match cursor.record().cmp(record) {
                Ordering::Equal => return Ok(Some(cursor)),
                Ordering::Greater => return Ok(None),
                Ordering::Less => match cursor.advance()? {
                    Some(next) => cursor = next,
                    None => return Ok(None),
                },
            }
        }
    }

    /// The leaf a record belongs to: descend to the leaf strictly before
    /// the record's key, then walk right while the next separator still
    /// carries the key and the next leaf's minimum does not pass the
    /// record. The walk resolves both duplicate chains and equal-key
    /// records straddling a promoted separator.
    fn locate_for_record(&self, record: &[u8; R]) -> Result<(Entry<K>, PageHandle<P, R, K>)> {
        let key = Self::extract_key(record);
        let Some(mut entry) = self.branches.find_page_before(&key) else {
            eyre::bail!("branch index is empty: store was not bootstrapped");
        };
        loop {
            let Some(next) = self.branches.next_entry(&entry) else {
                break;
            };
            if next.key != key {
                break;
            }
            let next_page = self.pool.get_page(Self::offset_of(next.page_id))?;
            let min = next_page.borrow().min_record();
            match min {
                Some(min) if min <= *record => entry = next,
                _ => break,
            }
        }
        let page = self.pool.get_page(Self::offset_of(entry.page_id))?;
        Ok((entry, page))
    }

    /// Inserts a record. Returns the cursor to the stored record and
    /// whether a new record was written; `(cursor_to_existing, false)`
    /// when duplicates are disallowed and the identical record exists.
    pub fn insert(&mut self, record: &[u8; R]) -> Result<(Cursor<'_, P, R, K>, bool)> {
        let (entry, mut page) = self.locate_for_record(record)?;
        if page.borrow().is_full() {
            let old_next = page.borrow().next_page_offset();
            let (right, right_offset) = self.pool.get_new_page(old_next)?;
            let promoted = page
                .borrow_mut()
                .split_with(&mut right.borrow_mut(), right_offset)?;
            self.branches
                .insert_page(Self::extract_key(&promoted), Self::page_id_of(right_offset))?;
            debug!(
                left = Self::offset_of(entry.page_id),
                right = right_offset,
                "split full leaf"
            );
            if record.as_slice() >= promoted.as_slice() {
                page = right;
            }
        }

        let (slot, inserted) = page.borrow_mut().insert(record, ALLOW_DUP);
        ensure!(
            slot < RecordPage::<P, R, K>::CAPACITY,
            "leaf page rejected insert after split"
        );
        if inserted {
            self.record_count += 1;
        }
        Ok((Cursor::new(&self.pool, page, slot), inserted))
    }

    /// Erases the record equal to `record`. Returns whether a record was
    /// removed. Outstanding cursors are invalidated when this triggers a
    /// merge or borrow.
    pub fn erase(&mut self, record: &[u8; R]) -> Result<bool> {
        let (entry, page) = self.locate_for_record(record)?;

        if page.borrow_mut().erase_record(record).is_none() {
            return Ok(false);
        }
        self.record_count -= 1;

        self.inspect_after_erase(entry.key, entry.page_id, &page)?;
        Ok(true)
    }

    /// Rebalances a leaf that dropped below half capacity, provided it
    /// has a right neighbor in the branch index. The rightmost indexed
    /// leaf is left alone.
    fn inspect_after_erase(
        &mut self,
        key: [u8; K],
        page_id: u64,
        page: &PageHandle<P, R, K>,
    ) -> Result<()> {
        if !page.borrow().is_underfull() {
            return Ok(());
        }
        let entry = Entry { key, page_id };
        let Some(right_entry) = self.branches.next_entry(&entry) else {
            return Ok(());
        };
        let right_offset = Self::offset_of(right_entry.page_id);
        let right = self.pool.get_page(right_offset)?;

        let combined = page.borrow().len() + right.borrow().len();
        if combined <= RecordPage::<P, R, K>::CAPACITY {
            page.borrow_mut().merge_with(&mut right.borrow_mut())?;
            self.branches
                .erase_page(right_entry.key, right_entry.page_id)?;
            drop(right);
            self.pool.discard_page(right_offset)?;
            debug!(
                left = Self::offset_of(page_id),
                right = right_offset,
                "merged underfull leaf"
            );
        } else {
            let new_min = page.borrow_mut().borrow_from(&mut right.borrow_mut())?;
            self.branches
                .erase_page(right_entry.key, right_entry.page_id)?;
            self.branches
                .insert_page(Self::extract_key(&new_min), right_entry.page_id)?;
            debug!(
                left = Self::offset_of(page_id),
                right = right_offset,
                "borrowed from right sibling"
            );
        }
        Ok(())
    }

    /// Forward iterator over every record in key order.
    pub fn iter(&self) -> Result<Iter<'_, P, R, K>> {
        let Some(first) = self.branches.first_entry() else {
            return Ok(Iter::new(None));
        };
        let page = self.pool.get_page(Self::offset_of(first.page_id))?;
        let cursor = Cursor::normalize(&self.pool, page, 0)?;
        Ok(Iter::new(cursor))
    }

    /// Walks the entire leaf chain: every page must be internally
    /// ordered, records must not decrease across pages, and the chain
    /// must terminate at the bootstrap tail leaf.
    pub fn verify_order(&self) -> Result<bool> {
        let Some(first) = self.branches.first_entry() else {
            return Ok(true);
        };
        let max_pages = self.pool.file_size()? / P as u64;

        let mut offset = Self::offset_of(first.page_id);
        let mut last: Option<[u8; R]> = None;
        let mut visited = 0u64;
        loop {
            visited += 1;
            if visited > max_pages {
                warn!("leaf chain does not terminate");
                return Ok(false);
            }
            let page = self.pool.get_page(offset)?;
            let p = page.borrow();
            if !p.verify_order() {
                return Ok(false);
            }
            if let Some(min) = p.min_record() {
                if last.is_some_and(|prev| prev > min) {
                    return Ok(false);
                }
                last = p.max_slot().map(|slot| p.record_array(slot));
            }
            match p.next_page_offset() {
                NONE_OFFSET => break,
                next => offset = next,
            }
        }

        match self.branches.tail_page_id() {
            Some(tail) => Ok(Self::page_id_of(offset) == tail),
            None => Ok(true),
        }
    }

    /// Serializes the branch index, then flushes the pool; the pages-file
    /// header is the last write.
    pub fn close(mut self) -> Result<()> {
        self.branches.save(&self.btree_path, self.record_count)?;
        self.pool.close()?;
        self.closed = true;
        Ok(())
    }
}

impl<const P: usize, const R: usize, const K: usize, const ALLOW_DUP: bool> Drop
    for Store<P, R, K, ALLOW_DUP>
{
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.branches.save(&self.btree_path, self.record_count) {
                warn!(%err, "branch index save failed during drop");
            }
            // The pool flushes itself on drop.
        }
    }
}
