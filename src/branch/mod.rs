//! Branch (internal) node format and structural operations.
//!
//! The block layout is a slotted page: a small header, a sorted array of
//! 16-bit offsets, and a heap of variable-length `(child, key)` pairs growing
//! down from the end of the block. The last pair by key order carries the
//! zero-length sentinel key and addresses the rightmost child, so `n` pairs
//! name `n` children from `n - 1` real separators.

/// Separator-key model and total order.
pub mod key;
/// On-block layout codec: header, offset array, pair heap.
pub mod node;
/// Structural operations and capacity predicates.
pub mod ops;

pub use key::SepKey;
pub use node::{dump, init, init_from, validate, Header};
pub use ops::{
    change_unsafe, insert, is_full, is_mergable, is_singleton, is_underfull, level, lookup, merge,
    nodecmp, remove, sibling, split, update_key, LevelOutcome, Side,
};
