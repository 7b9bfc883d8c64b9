//! On-block layout codec for branch nodes.
//!
//! Layout: `[header][offset array][free space][pair heap]`. The heap grows
//! down from the end of the block and `frontmost` marks its lowest byte. A
//! pair on the heap is `[child: u64 BE][key_len: u8][key bytes]`, packed, and
//! is never moved except by delete-compaction. Offsets are kept sorted by the
//! key of the pair they address, sentinel last.

use std::fmt::Write as _;

use smallvec::SmallVec;
use tracing::error;

use crate::branch::key::SepKey;
use crate::error::{BoughError, Result};
use crate::types::{
    BlockId, BlockSize, BRANCH_NODE_KIND, MAX_KEY_SIZE, NODE_HEADER_LEN, OFFSET_ENTRY_LEN,
    PAIR_HEADER_LEN,
};

const KIND_OFFSET: usize = 0;
const NPAIRS_OFFSET: usize = 2;
const FRONTMOST_OFFSET: usize = 4;

/// Header fields decoded from a branch-node block.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    /// Number of pairs (and therefore children) in the node.
    pub npairs: u16,
    /// Offset of the lowest heap byte; the heap spans `frontmost..block end`.
    pub frontmost: u16,
}

impl Header {
    /// Decodes and bounds-checks the header of `block`.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < NODE_HEADER_LEN || block.len() > u16::MAX as usize {
            return Err(BoughError::Corruption("block size out of range"));
        }
        if block[KIND_OFFSET] != BRANCH_NODE_KIND {
            return Err(BoughError::Corruption("not a branch node block"));
        }
        let npairs = read_u16(block, NPAIRS_OFFSET);
        let frontmost = read_u16(block, FRONTMOST_OFFSET);
        let offsets_end = NODE_HEADER_LEN + npairs as usize * OFFSET_ENTRY_LEN;
        if frontmost as usize > block.len() || offsets_end > frontmost as usize {
            return Err(BoughError::Corruption("branch header bounds out of range"));
        }
        Ok(Self { npairs, frontmost })
    }

    /// Bytes available between the offset array and the pair heap.
    pub fn free_space(&self) -> usize {
        self.frontmost as usize - NODE_HEADER_LEN - self.npairs as usize * OFFSET_ENTRY_LEN
    }

    /// Bytes consumed by header, offset array, and pair heap.
    pub fn bytes_used(&self, block_size: BlockSize) -> usize {
        block_size.get() - self.free_space()
    }
}

/// Initializes `block` as an empty branch node.
pub fn init(block_size: BlockSize, block: &mut [u8]) -> Result<()> {
    if block.len() != block_size.get() {
        return Err(BoughError::Invalid("block length does not match block size"));
    }
    block.fill(0);
    block[KIND_OFFSET] = BRANCH_NODE_KIND;
    set_npairs(block, 0);
    set_frontmost(block, block_size.get() as u16);
    Ok(())
}

/// Initializes `block` from a subset of `src`'s offsets, preserving order.
/// Used by split to materialize the destination node.
pub fn init_from(
    block_size: BlockSize,
    block: &mut [u8],
    src: &[u8],
    offsets: &[u16],
) -> Result<()> {
    init(block_size, block)?;
    for (index, &src_offset) in offsets.iter().enumerate() {
        let child = pair_child(src, src_offset)?;
        let key = pair_key(src, src_offset)?;
        let offset = insert_pair(block, child, key)?;
        insert_offset(block, index, offset);
    }
    Ok(())
}

pub(crate) fn npairs(block: &[u8]) -> u16 {
    read_u16(block, NPAIRS_OFFSET)
}

pub(crate) fn frontmost(block: &[u8]) -> u16 {
    read_u16(block, FRONTMOST_OFFSET)
}

pub(crate) fn set_npairs(block: &mut [u8], value: u16) {
    write_u16(block, NPAIRS_OFFSET, value);
}

pub(crate) fn set_frontmost(block: &mut [u8], value: u16) {
    write_u16(block, FRONTMOST_OFFSET, value);
}

/// Reads the offset array entry at `index`. Callers must have parsed a valid
/// header; the array span is within `frontmost`.
pub(crate) fn offset_at(block: &[u8], index: usize) -> u16 {
    read_u16(block, NODE_HEADER_LEN + index * OFFSET_ENTRY_LEN)
}

pub(crate) fn set_offset_at(block: &mut [u8], index: usize, value: u16) {
    write_u16(block, NODE_HEADER_LEN + index * OFFSET_ENTRY_LEN, value);
}

/// On-disk size of a pair carrying a key of `key_len` bytes.
pub const fn pair_size_for_key(key_len: usize) -> usize {
    PAIR_HEADER_LEN + key_len
}

/// Raw key bytes of the pair at `offset` (empty for the sentinel).
pub fn pair_key(block: &[u8], offset: u16) -> Result<&[u8]> {
    let start = offset as usize;
    if start + PAIR_HEADER_LEN > block.len() {
        return Err(BoughError::Corruption("pair header beyond block end"));
    }
    let key_len = block[start + 8] as usize;
    let end = start + PAIR_HEADER_LEN + key_len;
    if end > block.len() {
        return Err(BoughError::Corruption("pair key beyond block end"));
    }
    Ok(&block[start + PAIR_HEADER_LEN..end])
}

/// Child block id of the pair at `offset`.
pub fn pair_child(block: &[u8], offset: u16) -> Result<BlockId> {
    let start = offset as usize;
    if start + PAIR_HEADER_LEN > block.len() {
        return Err(BoughError::Corruption("pair header beyond block end"));
    }
    let raw = u64::from_be_bytes(block[start..start + 8].try_into().unwrap());
    Ok(BlockId(raw))
}

pub(crate) fn set_pair_child(block: &mut [u8], offset: u16, child: BlockId) -> Result<()> {
    let start = offset as usize;
    if start + PAIR_HEADER_LEN > block.len() {
        return Err(BoughError::Corruption("pair header beyond block end"));
    }
    block[start..start + 8].copy_from_slice(&child.0.to_be_bytes());
    Ok(())
}

/// Returns the child and key of the pair at `index` in key order.
pub fn pair_at(block: &[u8], index: usize) -> Result<(BlockId, &[u8])> {
    let header = Header::parse(block)?;
    if index >= header.npairs as usize {
        return Err(BoughError::Invalid("pair index out of range"));
    }
    let offset = offset_at(block, index);
    Ok((pair_child(block, offset)?, pair_key(block, offset)?))
}

/// Total on-disk size of the pair at `offset`.
pub fn pair_size_at(block: &[u8], offset: u16) -> Result<usize> {
    Ok(pair_size_for_key(pair_key(block, offset)?.len()))
}

/// Writes a new pair onto the heap and returns its offset. The capacity check
/// reserves room for the offset entry the caller is about to add.
pub(crate) fn insert_pair(block: &mut [u8], child: BlockId, key: &[u8]) -> Result<u16> {
    if key.len() > MAX_KEY_SIZE {
        return Err(BoughError::Invalid("separator key exceeds maximum size"));
    }
    let size = pair_size_for_key(key.len());
    let front = frontmost(block) as usize;
    let offsets_end =
        NODE_HEADER_LEN + (npairs(block) as usize + 1) * OFFSET_ENTRY_LEN;
    if front < size || front - size < offsets_end {
        return Err(BoughError::Invalid("branch node heap overflow"));
    }
    let start = front - size;
    block[start..start + 8].copy_from_slice(&child.0.to_be_bytes());
    block[start + 8] = key.len() as u8;
    block[start + PAIR_HEADER_LEN..start + size].copy_from_slice(key);
    set_frontmost(block, start as u16);
    Ok(start as u16)
}

/// Removes the pair at `offset` from the heap, compacting the bytes below it
/// and shifting every stored offset that pointed into the moved region. The
/// pair's entry in the offset array is the caller's to remove.
pub(crate) fn delete_pair(block: &mut [u8], offset: u16) -> Result<()> {
    let size = pair_size_at(block, offset)?;
    let front = frontmost(block) as usize;
    let start = offset as usize;
    if start < front {
        return Err(BoughError::Corruption("pair offset below heap front"));
    }
    block.copy_within(front..start, front + size);
    set_frontmost(block, (front + size) as u16);
    let count = npairs(block) as usize;
    for index in 0..count {
        let entry = offset_at(block, index);
        if entry < offset {
            set_offset_at(block, index, entry + size as u16);
        }
    }
    Ok(())
}

/// Inserts `offset` into the offset array at `index`, shifting later entries.
pub(crate) fn insert_offset(block: &mut [u8], index: usize, offset: u16) {
    let count = npairs(block) as usize;
    debug_assert!(index <= count);
    let start = NODE_HEADER_LEN + index * OFFSET_ENTRY_LEN;
    let end = NODE_HEADER_LEN + count * OFFSET_ENTRY_LEN;
    debug_assert!(end + OFFSET_ENTRY_LEN <= frontmost(block) as usize);
    block.copy_within(start..end, start + OFFSET_ENTRY_LEN);
    write_u16(block, start, offset);
    set_npairs(block, (count + 1) as u16);
}

/// Removes the offset array entry at `index`, shifting later entries down.
pub(crate) fn delete_offset(block: &mut [u8], index: usize) {
    let count = npairs(block) as usize;
    debug_assert!(index < count);
    let start = NODE_HEADER_LEN + index * OFFSET_ENTRY_LEN;
    let end = NODE_HEADER_LEN + count * OFFSET_ENTRY_LEN;
    block.copy_within(start + OFFSET_ENTRY_LEN..end, start);
    set_npairs(block, (count - 1) as u16);
}

/// Rewrites the last pair to carry the sentinel key, preserving its child.
/// Invoked whenever an operation removes or relocates the sentinel pair and
/// the rightmost child must be re-addressed.
pub(crate) fn make_last_pair_special(block: &mut [u8]) -> Result<()> {
    let count = npairs(block) as usize;
    if count == 0 {
        return Ok(());
    }
    let index = count - 1;
    let offset = offset_at(block, index);
    if pair_key(block, offset)?.is_empty() {
        return Ok(());
    }
    let child = pair_child(block, offset)?;
    delete_pair(block, offset)?;
    delete_offset(block, index);
    let offset = insert_pair(block, child, &[])?;
    insert_offset(block, index, offset);
    Ok(())
}

/// Walks the full node and checks every format invariant: header bounds,
/// in-bounds non-overlapping pair regions exactly tiling the heap, strictly
/// ascending keys, and the sentinel only and always last. O(npairs).
pub fn validate(block_size: BlockSize, block: &[u8]) -> Result<()> {
    if block.len() != block_size.get() {
        return Err(fail("block length does not match configured block size"));
    }
    let header = Header::parse(block)?;
    let count = header.npairs as usize;
    let mut extents: SmallVec<[(u16, u16); 64]> = SmallVec::with_capacity(count);
    let mut prev_key: Option<&[u8]> = None;
    for index in 0..count {
        let offset = offset_at(block, index);
        if (offset as usize) < header.frontmost as usize {
            return Err(fail("pair offset below heap front"));
        }
        let key = pair_key(block, offset)?;
        let size = pair_size_for_key(key.len());
        extents.push((offset, offset + size as u16));
        if key.is_empty() && index != count - 1 {
            return Err(fail("sentinel pair not in last position"));
        }
        if let Some(prev) = prev_key {
            if SepKey::from_raw(prev) >= SepKey::from_raw(key) {
                return Err(fail("separator keys not strictly ascending"));
            }
        }
        prev_key = Some(key);
    }
    extents.sort_unstable();
    let mut cursor = header.frontmost;
    for &(start, end) in extents.iter() {
        if start != cursor {
            return Err(fail("pair regions do not tile the heap"));
        }
        cursor = end;
    }
    if cursor as usize != block.len() {
        return Err(fail("pair heap does not reach block end"));
    }
    Ok(())
}

/// Renders the node for debugging: header fields plus one line per pair with
/// the key in hex.
pub fn dump(block: &[u8]) -> Result<String> {
    let header = Header::parse(block)?;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "branch node: npairs={} frontmost={} free={}",
        header.npairs,
        header.frontmost,
        header.free_space()
    );
    for index in 0..header.npairs as usize {
        let offset = offset_at(block, index);
        let key = pair_key(block, offset)?;
        let child = pair_child(block, offset)?;
        let rendered = if key.is_empty() {
            "<inf>".to_string()
        } else {
            hex::encode(key)
        };
        let _ = writeln!(out, "  [{index}] @{offset} child={} key={rendered}", child.0);
    }
    Ok(out)
}

fn fail(msg: &'static str) -> BoughError {
    error!(target: "bough::branch", msg, "branch node validation failed");
    BoughError::Corruption(msg)
}

fn read_u16(block: &[u8], at: usize) -> u16 {
    u16::from_be_bytes(block[at..at + OFFSET_ENTRY_LEN].try_into().unwrap())
}

fn write_u16(block: &mut [u8], at: usize, value: u16) {
    block[at..at + OFFSET_ENTRY_LEN].copy_from_slice(&value.to_be_bytes());
}
