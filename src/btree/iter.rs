//! # Leaf-Chain Cursors
//!
//! Forward iteration over the store: a cursor pairs a pinned page handle
//! with a slot index and follows `next_page_offset` when it runs off a
//! page. The pool loads the next leaf while the current handle is still
//! held, so the pin protocol keeps both pages resident across the hop.
//!
//! Cursors only move forward across pages; backward movement is an
//! intra-page affair and the store does not expose it. A cursor always
//! rests on a live record; "end" is the absence of a cursor, not a
//! sentinel position.

use eyre::{Report, Result};

use crate::storage::{BufferPool, PageHandle, RecordPage, NONE_OFFSET};

/// A position inside the store: one pinned leaf page plus an occupied
/// slot.
pub struct Cursor<'a, const P: usize, const R: usize, const K: usize> {
    pool: &'a BufferPool<P, R, K>,
    page: PageHandle<P, R, K>,
    slot: usize,
}

impl<'a, const P: usize, const R: usize, const K: usize> Cursor<'a, P, R, K> {
    pub(crate) fn new(
        pool: &'a BufferPool<P, R, K>,
        page: PageHandle<P, R, K>,
        slot: usize,
    ) -> Self {
        debug_assert!(page.borrow().bit(slot), "cursor must rest on a record");
        Self { pool, page, slot }
    }

    /// Walks forward from `(page, slot)` to the first occupied slot,
    /// hopping leaves through the pool as needed. `None` means the chain
    /// is exhausted.
    pub(crate) fn normalize(
        pool: &'a BufferPool<P, R, K>,
        mut page: PageHandle<P, R, K>,
        mut slot: usize,
    ) -> Result<Option<Self>> {
        loop {
            let (valid, next) = {
                let p = page.borrow();
                (p.advance_to_valid(slot), p.next_page_offset())
            };
            if valid < RecordPage::<P, R, K>::CAPACITY {
                return Ok(Some(Self::new(pool, page, valid)));
            }
            if next == NONE_OFFSET {
                return Ok(None);
            }
            // The old handle stays pinned until the reassignment, so the
            // page cannot be evicted out from under the hop.
            page = pool.get_page(next)?;
            slot = 0;
        }
    }

    /// Owned copy of the record under the cursor.
    pub fn record(&self) -> [u8; R] {
        self.page.borrow().record_array(self.slot)
    }

    /// Slot index within the current page.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Moves to the next record, following the leaf chain. `None` at the
    /// end of the store.
    pub fn advance(self) -> Result<Option<Self>> {
        Self::normalize(self.pool, self.page, self.slot + 1)
    }
}

/// Fused forward iterator over every record in key order. I/O failures
/// surface as a single `Err` item after the last successfully read
/// record.
pub struct Iter<'a, const P: usize, const R: usize, const K: usize> {
    cursor: Option<Cursor<'a, P, R, K>>,
    error: Option<Report>,
}

impl<'a, const P: usize, const R: usize, const K: usize> Iter<'a, P, R, K> {
    pub(crate) fn new(cursor: Option<Cursor<'a, P, R, K>>) -> Self {
        Self {
            cursor,
            error: None,
        }
    }
}

impl<const P: usize, const R: usize, const K: usize> Iterator for Iter<'_, P, R, K> {
    type Item = Result<[u8; R]>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            return Some(Err(err));
        }
        let cursor = self.cursor.take()?;
        let record = cursor.record();
        match cursor.advance() {
            Ok(next) => self.cursor = next,
            Err(err) => self.error = Some(err),
        }
        Some(Ok(record))
    }
}
