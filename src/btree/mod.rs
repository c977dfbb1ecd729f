//! # B+Tree Index Level
//!
//! The index half of slotdb: an in-memory branch level over the
//! disk-resident leaves, and the coordinator that ties them to the buffer
//! pool.
//!
//! ## Two Trees, One Structure
//!
//! The engine is a B+tree whose levels live in different places. Leaves
//! are `P`-byte pages in `pages.bin`, cached by the buffer pool and
//! linked into a chain in key order. Branches are a plain in-memory
//! B-tree mapping each promoted separator key to the id of the leaf that
//! starts at it, serialized wholesale to `btree.bin` at shutdown.
//!
//! ```text
//!              BranchIndex (memory, btree.bin at rest)
//!              [ k₁ → id₁ | k₂ → id₂ | k₃ → id₃ ]
//!                  │           │           │
//!                  ▼           ▼           ▼
//!   pages.bin  [leaf id₁] → [leaf id₂] → [leaf id₃] → [tail] → NONE
//!                  (chained by next_page_offset, key order)
//! ```
//!
//! A leaf split promotes the right half's minimum key into the branch
//! index; a leaf merge removes the absorbed page's separator; a borrow
//! re-keys the right sibling's separator. The coordinator in
//! [`store::Store`] performs those updates so the two trees never
//! disagree for longer than one operation.
//!
//! ## Module Organization
//!
//! - `branch`: the in-memory separator B-tree (`BranchIndex`)
//! - `store`: the coordinator façade (`Store`)
//! - `iter`: leaf-chain cursors and iteration (`Cursor`, `Iter`)

pub mod branch;
mod iter;
mod store;

pub use branch::{BranchIndex, Entry, BRANCH_MAGIC, BRANCH_VERSION};
pub use iter::{Cursor, Iter};
pub use store::Store;
