//! Crate-wide error type.

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, BoughError>;

/// Errors surfaced by the branch-node engine.
///
/// Running out of room in a block is not an error: `insert` reports it with
/// `Ok(false)` and `level` with `Ok(None)`, and the caller reacts by
/// splitting or merging.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoughError {
    /// An on-block structure failed a format check. A corrupted block cannot
    /// be repaired at this layer; the caller is expected to escalate.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller violated an operation precondition (removing an absent
    /// separator, splitting a node with too few pairs, and so on).
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}
