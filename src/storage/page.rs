//! # Fixed-Record Leaf Page
//!
//! This module implements the leaf page for slotdb's record store. A page
//! is a `P`-byte block holding up to `C` fixed-width records behind an
//! occupancy bitmap, plus a pointer to the next leaf in key order.
//!
//! ## Page Layout
//!
//! ```text
//! Offset            Size        Field
//! ------            ----        -----------------------------------
//! 0                 8           next_page_offset (LE u64, NONE_OFFSET
//!                               for the last leaf)
//! 8                 ⌈C/8⌉       bitmap (bit i set ⇔ slot i occupied)
//! 8 + ⌈C/8⌉         C · R       record slots
//! ...               to P        zero padding
//! ```
//!
//! `C` is the largest count for which the pointer, the bitmap, and the
//! record area fit in `P` bytes (see [`page_capacity`]). The in-memory
//! page is exactly the on-disk image, so serialization is a single write
//! and a load-store round-trip is byte-identical.
//!
//! ## Ordering Invariants
//!
//! - Occupied slots hold records in non-decreasing order left to right.
//! - `bitmap.count_ones() == len()`.
//! - Empty slots may appear anywhere; [`RecordPage::solidify`] packs all
//!   valid records into the leading slots and zeroes the rest.
//!
//! ## Search
//!
//! Records compare as raw bytes. A probe is either a full `R`-byte record
//! or a `K`-byte key; comparisons use the probe's length, so a key probe
//! compares against record prefixes. Search is a binary search whose
//! midpoint is snapped to a real record by [`RecordPage::find_first_occupied`],
//! an outward scan over the bitmap, and whose window shrinks until no
//! occupied slot separates the bounds.
//!
//! ## Insertion
//!
//! The upper-bound slot is the insertion point. If it is empty the record
//! is written in place; otherwise records shift by one slot toward the
//! last empty slot of the page (left or right of the insertion point,
//! whichever side it falls on), the bitmap shifting with them. Exactly
//! one slot becomes newly occupied per insert.
//!
//! ## Rebalancing Primitives
//!
//! - `split_with`: full page → half stays, upper half moves to an empty
//!   right sibling; relinks the leaf chain and returns the sibling's new
//!   minimum record for promotion into the branch index.
//! - `merge_with`: absorbs the right sibling when the combined size fits.
//! - `borrow_from`: pulls leading records off a larger right sibling
//!   until this page reaches half of the combined size, returning the
//!   sibling's new minimum record.
//!
//! Erase only clears a bit; slots are reclaimed lazily by later inserts
//! and `solidify`.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use tracing::trace;

use super::{is_data_page_offset, NEXT_OFFSET_SIZE, NONE_OFFSET};

/// Number of record slots in a `page_size`-byte page of `record_size`-byte
/// records: the largest `c` with `8 + ⌈c/8⌉ + c·record_size ≤ page_size`.
pub const fn page_capacity(page_size: usize, record_size: usize) -> usize {
    if page_size <= NEXT_OFFSET_SIZE || record_size == 0 {
        return 0;
    }
    let mut c = (page_size - NEXT_OFFSET_SIZE) / record_size;
    while c > 0 && NEXT_OFFSET_SIZE + c.div_ceil(8) + c * record_size > page_size {
        c -= 1;
    }
    c
}

/// A `P`-byte leaf page of `R`-byte records whose leading `K` bytes are
/// the key. The struct owns the exact disk image of its block.
#[derive(Debug)]
pub struct RecordPage<const P: usize, const R: usize, const K: usize> {
    data: Box<[u8]>,
}

impl<const P: usize, const R: usize, const K: usize> RecordPage<P, R, K> {
    /// Record slots per page.
    pub const CAPACITY: usize = page_capacity(P, R);
    const BITMAP_START: usize = NEXT_OFFSET_SIZE;
    const BITMAP_LEN: usize = Self::CAPACITY.div_ceil(8);
    const RECORDS_START: usize = Self::BITMAP_START + Self::BITMAP_LEN;

    /// Fresh zeroed page linked to `next_page_offset`.
    pub fn new(next_page_offset: u64) -> Self {
        let mut page = Self {
            data: vec![0u8; P].into_boxed_slice(),
        };
        page.set_next_page_offset(next_page_offset);
        page
    }

    /// Rebuilds a page from its on-disk image, validating the block
    /// length and the next-pointer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == P,
            "page corrupt: block is {} bytes, expected {}",
            bytes.len(),
            P
        );
        let page = Self {
            data: bytes.to_vec().into_boxed_slice(),
        };
        let next = page.next_page_offset();
        ensure!(
            next == NONE_OFFSET || is_data_page_offset(next, P),
            "page corrupt: next pointer {:#x} is not a data page offset",
            next
        );
        if Self::CAPACITY % 8 != 0 {
            let stray = page.data[Self::RECORDS_START - 1] & !((1u8 << (Self::CAPACITY % 8)) - 1);
            ensure!(
                stray == 0,
                "page corrupt: bitmap marks slots beyond capacity {}",
                Self::CAPACITY
            );
        }
        Ok(page)
    }

    /// The exact `P`-byte disk image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn next_page_offset(&self) -> u64 {
        u64::from_le_bytes(self.data[..NEXT_OFFSET_SIZE].try_into().unwrap())
    }

    pub fn set_next_page_offset(&mut self, offset: u64) {
        self.data[..NEXT_OFFSET_SIZE].copy_from_slice(&offset.to_le_bytes());
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.data[Self::BITMAP_START..Self::RECORDS_START]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == Self::CAPACITY
    }

    /// Below half capacity, the threshold at which erase rebalances.
    pub fn is_underfull(&self) -> bool {
        self.len() < Self::CAPACITY / 2
    }

    pub fn bit(&self, slot: usize) -> bool {
        debug_assert!(slot < Self::CAPACITY);
        self.data[Self::BITMAP_START + slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_bit(&mut self, slot: usize, value: bool) {
        debug_assert!(slot < Self::CAPACITY);
        let byte = &mut self.data[Self::BITMAP_START + slot / 8];
        if value {
            *byte |= 1 << (slot % 8);
        } else {
            *byte &= !(1 << (slot % 8));
        }
    }

    fn record_range(slot: usize) -> std::ops::Range<usize> {
        let start = Self::RECORDS_START + slot * R;
        start..start + R
    }

    /// Borrowed view of the record bytes at `slot`.
    pub fn record(&self, slot: usize) -> &[u8] {
        &self.data[Self::record_range(slot)]
    }

    fn record_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.data[Self::record_range(slot)]
    }

    /// Owned copy of the record at `slot`.
    pub fn record_array(&self, slot: usize) -> [u8; R] {
        let mut out = [0u8; R];
        out.copy_from_slice(self.record(slot));
        out
    }

    fn cmp_probe(&self, probe: &[u8], slot: usize) -> Ordering {
        let len = probe.len().min(R);
        probe[..len].cmp(&self.record(slot)[..len])
    }

    /// Nearest occupied slot to `target` within `[lo, hi)`, scanning
    /// outward one step at a time; [`Self::CAPACITY`] if the range holds
    /// none. The bitmap is a handful of bytes, so the scan stays in
    /// cache.
    pub fn find_first_occupied(&self, target: usize, lo: usize, hi: usize) -> usize {
        debug_assert!(lo <= target && target < hi && hi <= Self::CAPACITY);
        let lo = lo as isize;
        let hi = hi as isize;
        let mut to_left = target as isize;
        let mut to_right = target as isize;
        while to_left >= lo || to_right < hi {
            if to_left >= lo && self.bit(to_left as usize) {
                return to_left as usize;
            }
            if to_right < hi && self.bit(to_right as usize) {
                return to_right as usize;
            }
            to_left -= 1;
            to_right += 1;
        }
        Self::CAPACITY
    }

    /// First occupied slot at or after `slot`; `CAPACITY` if none.
    pub fn advance_to_valid(&self, slot: usize) -> usize {
        let mut slot = slot;
        while slot < Self::CAPACITY {
            if self.bit(slot) {
                return slot;
            }
            slot += 1;
        }
        Self::CAPACITY
    }

    /// Last occupied slot at or before `slot`; `None` if none.
    pub fn retreat_to_valid(&self, slot: usize) -> Option<usize> {
        let mut slot = slot.min(Self::CAPACITY - 1) as isize;
        while slot >= 0 {
            if self.bit(slot as usize) {
                return Some(slot as usize);
            }
            slot -= 1;
        }
        None
    }

    /// Slot of the smallest record, if any.
    pub fn min_slot(&self) -> Option<usize> {
        match self.advance_to_valid(0) {
            slot if slot < Self::CAPACITY => Some(slot),
            _ => None,
        }
    }

    /// Slot of the greatest record, if any.
    pub fn max_slot(&self) -> Option<usize> {
        self.retreat_to_valid(Self::CAPACITY - 1)
    }

    /// Owned copy of the smallest record, if any.
    pub fn min_record(&self) -> Option<[u8; R]> {
        self.min_slot().map(|slot| self.record_array(slot))
    }

    /// First occupied slot whose record is `>= probe` under prefix
    /// comparison, or `CAPACITY` when no record qualifies (including the
    /// empty page).
    pub fn search_lb(&self, probe: &[u8]) -> usize {
        let cap = Self::CAPACITY;
        if self.is_empty() {
            return cap;
        }
        let first = self.find_first_occupied(0, 0, cap);
        if self.cmp_probe(probe, first) != Ordering::Greater {
            return first;
        }
        // record[lo] < probe; hi is CAPACITY or occupied with
        // record[hi] >= probe. Page order extends both facts to every
        // occupied slot outside (lo, hi).
        let mut lo = first;
        let mut hi = cap;
        while hi - lo > 1 {
            let mid = self.find_first_occupied(lo + (hi - lo) / 2, lo + 1, hi);
            if mid == cap {
                break;
            }
            if self.cmp_probe(probe, mid) == Ordering::Greater {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        hi
    }

    /// First slot past every record `<= probe`: an occupied slot whose
    /// record is `> probe`, or the (possibly empty) slot after the last
    /// record when the probe is greatest, or slot 0 on an empty page.
    pub fn search_ub(&self, probe: &[u8]) -> usize {
        let cap = Self::CAPACITY;
        if self.is_empty() {
            return 0;
        }
        let last = self.find_first_occupied(cap - 1, 0, cap);
        if self.cmp_probe(probe, last) != Ordering::Less {
            return last + 1;
        }
        let first = self.find_first_occupied(0, 0, cap);
        if self.cmp_probe(probe, first) == Ordering::Less {
            return first;
        }
        // record[lo] <= probe < record[hi]
        let mut lo = first;
        let mut hi = last;
        while hi - lo > 1 {
            let mid = self.find_first_occupied(lo + (hi - lo) / 2, lo + 1, hi);
            if mid == cap {
                break;
            }
            if self.cmp_probe(probe, mid) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }

    /// Slot of the record exactly equal to `probe` under prefix
    /// comparison, if present.
    pub fn search(&self, probe: &[u8]) -> Option<usize> {
        let lb = self.search_lb(probe);
        if lb < Self::CAPACITY && self.cmp_probe(probe, lb) == Ordering::Equal {
            Some(lb)
        } else {
            None
        }
    }

    /// Last empty slot of the page; every slot above it is occupied.
    fn last_empty_slot(&self) -> Option<usize> {
        let mut slot = Self::CAPACITY as isize - 1;
        while slot >= 0 {
            if !self.bit(slot as usize) {
                return Some(slot as usize);
            }
            slot -= 1;
        }
        None
    }

    /// Ordered insert. Returns `(slot, inserted)`; `(CAPACITY, false)` on
    /// a full page, and `(existing_slot, false)` when `allow_dup` is off
    /// and an identical record is already present.
    pub fn insert(&mut self, record: &[u8; R], allow_dup: bool) -> (usize, bool) {
        let cap = Self::CAPACITY;
        if self.is_full() {
            return (cap, false);
        }
        if !allow_dup {
            let lb = self.search_lb(record);
            if lb < cap && self.record(lb) == record.as_slice() {
                return (lb, false);
            }
        }

        let mut ub = self.search_ub(record);
        if ub == cap {
            ub = self.solidify();
        }
        if !self.bit(ub) {
            self.record_mut(ub).copy_from_slice(record);
            self.set_bit(ub, true);
            return (ub, true);
        }

        // The insertion slot is occupied: shift one position toward the
        // last empty slot. Everything above that slot is occupied, so a
        // leftward shift crosses no other gap; a rightward shift carries
        // the bitmap along to preserve interior gaps.
        let gap = self
            .last_empty_slot()
            .expect("page is not full, an empty slot exists");
        let at = if gap < ub {
            let src = Self::record_range(gap + 1).start..Self::record_range(ub).start;
            self.data.copy_within(src, Self::record_range(gap).start);
            for slot in gap..ub - 1 {
                let next = self.bit(slot + 1);
                self.set_bit(slot, next);
            }
            ub - 1
        } else {
            let src = Self::record_range(ub).start..Self::record_range(gap).start;
            self.data.copy_within(src, Self::record_range(ub + 1).start);
            for slot in (ub + 1..=gap).rev() {
                let prev = self.bit(slot - 1);
                self.set_bit(slot, prev);
            }
            ub
        };
        self.record_mut(at).copy_from_slice(record);
        self.set_bit(at, true);
        (at, true)
    }

    /// Clears the bit at `slot`. Returns the slot if a record was
    /// present. The record bytes stay behind until an insert or
    /// `solidify` reclaims the slot.
    pub fn erase_slot(&mut self, slot: usize) -> Option<usize> {
        if slot < Self::CAPACITY && self.bit(slot) {
            self.set_bit(slot, false);
            Some(slot)
        } else {
            None
        }
    }

    /// Erases the record equal to `record`, if present.
    pub fn erase_record(&mut self, record: &[u8; R]) -> Option<usize> {
        self.search(record).and_then(|slot| self.erase_slot(slot))
    }

    /// Packs all valid records into slots `[0, len)`, zeroing vacated
    /// slots. Returns the new length, which is also the first empty slot.
    pub fn solidify(&mut self) -> usize {
        let mut dest = 0;
        for src in 0..Self::CAPACITY {
            if self.bit(src) {
                if dest != src {
                    let from = Self::record_range(src);
                    self.data.copy_within(from.clone(), Self::record_range(dest).start);
                    self.data[from].fill(0);
                }
                dest += 1;
            }
        }
        for slot in 0..dest {
            self.set_bit(slot, true);
        }
        for slot in dest..Self::CAPACITY {
            self.set_bit(slot, false);
        }
        dest
    }

    /// Splits a full page: the lower `⌊C/2⌋` records stay, the rest move
    /// to the empty `right` sibling at `right_offset`, and the leaf chain
    /// is relinked through it. Returns the sibling's new minimum record,
    /// whose key the caller promotes into the branch index.
    pub fn split_with(&mut self, right: &mut Self, right_offset: u64) -> Result<[u8; R]> {
        ensure!(self.is_full(), "split requires a full page");
        ensure!(right.is_empty(), "split target page is not empty");

        self.solidify();
        let left_len = Self::CAPACITY / 2;
        let right_len = Self::CAPACITY - left_len;

        let upper = Self::record_range(left_len).start..Self::record_range(Self::CAPACITY).start;
        right.data[Self::record_range(0).start..Self::record_range(right_len).start]
            .copy_from_slice(&self.data[upper]);
        for slot in left_len..Self::CAPACITY {
            self.set_bit(slot, false);
        }
        for slot in 0..right_len {
            right.set_bit(slot, true);
        }

        right.set_next_page_offset(self.next_page_offset());
        self.set_next_page_offset(right_offset);

        trace!(left_len, right_len, right_offset, "split leaf page");
        Ok(right.record_array(0))
    }

    /// Absorbs the right sibling: its records append after this page's
    /// and the chain link skips it. The sibling ends up empty.
    pub fn merge_with(&mut self, right: &mut Self) -> Result<()> {
        let target = self.len() + right.len();
        ensure!(
            target <= Self::CAPACITY,
            "merge overflow: {} + {} records exceed capacity {}",
            self.len(),
            right.len(),
            Self::CAPACITY
        );

        let dest = self.solidify();
        let right_len = right.solidify();

        let src = Self::record_range(0).start..Self::record_range(right_len).start;
        self.data[Self::record_range(dest).start..Self::record_range(dest + right_len).start]
            .copy_from_slice(&right.data[src]);
        for slot in dest..dest + right_len {
            self.set_bit(slot, true);
        }
        for slot in 0..right_len {
            right.set_bit(slot, false);
        }

        self.set_next_page_offset(right.next_page_offset());

        debug_assert_eq!(self.len(), target);
        debug_assert!(self.verify_order());
        trace!(merged = right_len, total = target, "merged right sibling");
        Ok(())
    }

    /// Redistributes with a larger right sibling: moves its leading
    /// records here until this page holds half of the combined count.
    /// Returns the sibling's new minimum record so the caller can re-key
    /// its separator.
    pub fn borrow_from(&mut self, right: &mut Self) -> Result<[u8; R]> {
        let left_len = self.len();
        let total = left_len + right.len();
        let target_left = total / 2;
        ensure!(
            left_len < target_left,
            "borrow requires an underfull left page: {} of {} total",
            left_len,
            total
        );

        let dest = self.solidify();
        right.solidify();
        let to_move = target_left - left_len;

        let src = Self::record_range(0).start..Self::record_range(to_move).start;
        self.data[Self::record_range(dest).start..Self::record_range(dest + to_move).start]
            .copy_from_slice(&right.data[src]);
        for slot in dest..dest + to_move {
            self.set_bit(slot, true);
        }
        for slot in 0..to_move {
            right.set_bit(slot, false);
        }

        debug_assert_eq!(self.len(), target_left);
        debug_assert!(self.verify_order());
        debug_assert!(right.verify_order());
        trace!(moved = to_move, left = target_left, "borrowed from right sibling");
        Ok(right.record_array(to_move))
    }

    /// True iff occupied slots hold non-decreasing records.
    pub fn verify_order(&self) -> bool {
        let mut prev: Option<usize> = None;
        let mut slot = self.advance_to_valid(0);
        while slot < Self::CAPACITY {
            if let Some(p) = prev {
                if self.record(p) > self.record(slot) {
                    return false;
                }
            }
            prev = Some(slot);
            slot = self.advance_to_valid(slot + 1);
        }
        true
    }
}
