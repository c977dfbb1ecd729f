//! # Configuration Constants
//!
//! All numeric configuration values for slotdb, with their
//! interdependencies documented next to them.

/// Default number of pages the buffer pool caches.
///
/// Must be at least [`MIN_POOL_CAPACITY`]: startup pins both bootstrap
/// leaves at once, and a split transiently pins a leaf and its new
/// sibling while the iterator protocol pins the current and next page
/// during a chain hop.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Smallest usable pool capacity (two simultaneously pinned pages).
pub const MIN_POOL_CAPACITY: usize = 2;

/// Default minimum degree of the in-memory branch index.
///
/// A node holds at most `2 * fanout - 1` separators; 64 keeps the tree
/// shallow for millions of leaves while nodes stay a few cache lines.
pub const DEFAULT_BRANCH_FANOUT: usize = 64;

/// Smallest legal branch fanout (the classical B-tree minimum degree).
pub const MIN_BRANCH_FANOUT: usize = 2;

const _: () = assert!(DEFAULT_POOL_CAPACITY >= MIN_POOL_CAPACITY);
const _: () = assert!(DEFAULT_BRANCH_FANOUT >= MIN_BRANCH_FANOUT);
