#![forbid(unsafe_code)]

//! Branch-node engine for a disk-resident B+ tree.
//!
//! A branch (internal) node lives in one fixed-size block and maps a sorted
//! sequence of separator keys to child block ids. This crate owns the on-disk
//! byte layout of those blocks and the structural algorithms that keep the
//! tree balanced: lookup, insert, remove, split, merge, and leveling.
//!
//! The crate performs no I/O and allocates no blocks. An external layer pins
//! blocks in a buffer cache, guarantees exclusive access for the duration of
//! each call, and decides from the capacity predicates when to split, merge,
//! or level.

pub mod branch;
pub mod error;
pub mod types;

pub use error::{BoughError, Result};
pub use types::{BlockId, BlockSize};
