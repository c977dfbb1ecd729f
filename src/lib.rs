//! # slotdb: Embedded Ordered Fixed-Record Store
//!
//! slotdb is the storage kernel of an embedded database: a
//! single-process, single-threaded ordered store of fixed-width records,
//! built as a disk-resident B+tree whose leaves are fixed-size record
//! pages and whose branch level is held in memory.
//!
//! ## Quick Start
//!
//! ```ignore
//! use slotdb::Store;
//!
//! // 4 KiB pages, 200-byte records keyed by their first 20 bytes,
//! // duplicates allowed.
//! let mut store: Store<4096, 200, 20, true> =
//!     Store::open("data/pages.bin", "data/btree.bin", 64)?;
//!
//! store.insert(&record)?;
//! if let Some(cursor) = store.search(&record)? {
//!     let bytes = cursor.record();
//! }
//! for record in store.iter()? {
//!     let record = record?;
//! }
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Store (coordinator)          │  search / insert / erase /
//! ├──────────────────┬──────────────────┤  iterate / verify
//! │   BranchIndex    │   Cursor, Iter   │
//! │ (memory B-tree,  │ (leaf-chain      │
//! │  btree.bin)      │  traversal)      │
//! ├──────────────────┴──────────────────┤
//! │        BufferPool (LRU, pins)       │  sole owner of page I/O
//! ├─────────────────────────────────────┤
//! │  RecordPage ⋯ RecordPage (chain)    │  bitmap + fixed slots
//! ├─────────────────────────────────────┤
//! │            pages.bin                │  header page + P-byte leaves
//! └─────────────────────────────────────┘
//! ```
//!
//! Every operation enters [`Store`], which locates the leaf through the
//! branch index, pins it through the pool, and operates on the page.
//! Splits, merges and borrows keep the three structures consistent; pin
//! counts on pool handles are the only locking-shaped mechanism in the
//! system.
//!
//! ## Parameters
//!
//! The store is generic over page size `P`, record size `R`, key size
//! `K` (`K ≤ R`, keys are record prefixes) and duplicate mode. Records
//! compare lexicographically over their full `R` bytes: two records with
//! equal keys but different tails are distinct.
//!
//! ## Files
//!
//! - `pages.bin`: header page plus all leaf pages.
//! - `btree.bin`: the serialized branch index, written at close.
//!
//! ## Contracts and Non-goals
//!
//! Single-threaded, synchronous, no crash durability: operations either
//! complete or leave the on-disk state undefined. Callers needing WAL
//! semantics, transactions, or concurrency must layer them above.
//!
//! ## Module Overview
//!
//! - [`storage`]: record pages, buffer pool, store header
//! - [`btree`]: branch index, coordinator, cursors
//! - [`config`]: centralized constants

pub mod btree;
pub mod config;
pub mod storage;

pub use btree::{BranchIndex, Cursor, Iter, Store};
pub use storage::{BufferPool, PageHandle, RecordPage, NONE_OFFSET};
