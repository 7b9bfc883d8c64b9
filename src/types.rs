//! Core identifiers and format constants.

use crate::error::{BoughError, Result};

/// Identifier of a fixed-size block handed out by the external allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

/// Maximum length in bytes of a separator key. A zero-length key is reserved
/// for the unbounded sentinel and never counts as a real key.
pub const MAX_KEY_SIZE: usize = 250;

/// Bytes preceding the key in an on-disk pair: child id (`u64` BE) plus the
/// one-byte key length.
pub const PAIR_HEADER_LEN: usize = 9;

/// Bytes of the node header: kind byte, reserved byte, `npairs: u16` BE,
/// `frontmost: u16` BE.
pub const NODE_HEADER_LEN: usize = 6;

/// Size of one entry in the sorted offset array.
pub const OFFSET_ENTRY_LEN: usize = 2;

/// Kind byte identifying a branch node block.
pub const BRANCH_NODE_KIND: u8 = 0xB7;

/// Hysteresis margin: one maximum-plausible pair. The split threshold sits
/// this far above merge eligibility so a freshly split node is never
/// immediately mergable.
pub const EPSILON: usize = PAIR_HEADER_LEN + MAX_KEY_SIZE;

/// Smallest supported block size. Below this a handful of maximum-size pairs
/// no longer fit and the split/merge thresholds collapse into each other.
pub const MIN_BLOCK_SIZE: usize = 2048;

/// Largest supported block size; offsets within a block are 16-bit.
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize;

/// Fixed block size for one tree instance, validated once at configuration
/// time and passed into every call that needs byte budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Validates and wraps a block size in bytes.
    pub fn new(value: u32) -> Result<Self> {
        let v = value as usize;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&v) {
            return Err(BoughError::Invalid("block size out of supported range"));
        }
        Ok(Self(value))
    }

    /// The block size in bytes.
    pub fn get(self) -> usize {
        self.0 as usize
    }
}
