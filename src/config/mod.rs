//! # Configuration Module
//!
//! Centralizes slotdb's tunable constants. Constants live in one place so
//! that interdependent values (pool capacity vs. bootstrap page count,
//! branch fanout bounds) stay visibly consistent instead of drifting
//! across modules.

pub mod constants;
pub use constants::*;
