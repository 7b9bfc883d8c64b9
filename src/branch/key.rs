//! Separator keys and their total order.

use std::cmp::Ordering;

use crate::error::{BoughError, Result};
use crate::types::MAX_KEY_SIZE;

/// A separator key as compared inside a branch node.
///
/// On disk a key is a length-prefixed byte string; a length of zero encodes
/// `Unbounded`, the "no upper bound" sentinel that addresses the rightmost
/// child. The tagged form keeps that convention explicit in the comparison
/// logic without changing the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SepKey<'a> {
    /// A real separator key.
    Bounded(&'a [u8]),
    /// The sentinel, greater than every real key.
    Unbounded,
}

impl<'a> SepKey<'a> {
    /// Interprets raw on-block key bytes; empty means the sentinel.
    pub fn from_raw(bytes: &'a [u8]) -> Self {
        if bytes.is_empty() {
            SepKey::Unbounded
        } else {
            SepKey::Bounded(bytes)
        }
    }

    /// Wraps caller-supplied bytes as a real key, rejecting the sentinel
    /// encoding and oversized keys.
    pub fn bounded(bytes: &'a [u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(BoughError::Invalid("separator key must be non-empty"));
        }
        if bytes.len() > MAX_KEY_SIZE {
            return Err(BoughError::Invalid("separator key exceeds maximum size"));
        }
        Ok(SepKey::Bounded(bytes))
    }

    /// The raw bytes as serialized on disk (`Unbounded` is empty).
    pub fn raw(&self) -> &'a [u8] {
        match self {
            SepKey::Bounded(bytes) => bytes,
            SepKey::Unbounded => &[],
        }
    }

    /// Whether this is the sentinel.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, SepKey::Unbounded)
    }
}

impl Ord for SepKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SepKey::Unbounded, SepKey::Unbounded) => Ordering::Equal,
            (SepKey::Unbounded, SepKey::Bounded(_)) => Ordering::Greater,
            (SepKey::Bounded(_), SepKey::Unbounded) => Ordering::Less,
            // Lexicographic with shorter-is-less tie-break, which is exactly
            // what slice ordering gives us. The same order is used for the
            // offset array and for binary search.
            (SepKey::Bounded(a), SepKey::Bounded(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for SepKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
