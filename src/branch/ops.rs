//! Structural operations over branch nodes.
//!
//! Every operation is a synchronous, in-memory transformation of one or two
//! already-pinned blocks. Capacity exhaustion is reported through return
//! values, precondition violations through [`BoughError::Invalid`], and
//! format damage through [`BoughError::Corruption`].

use std::cmp::Ordering;

use smallvec::SmallVec;
use tracing::trace;

use crate::branch::key::SepKey;
use crate::branch::node::{self, Header};
use crate::error::{BoughError, Result};
use crate::types::{BlockId, BlockSize, EPSILON, MAX_KEY_SIZE, OFFSET_ENTRY_LEN, PAIR_HEADER_LEN};

/// Which neighbor [`sibling`] selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// The sibling immediately left of the addressed child.
    Left,
    /// The sibling immediately right of the addressed child.
    Right,
}

/// Parent separator rewrite requested by a successful [`level`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelOutcome {
    /// The parent separator that no longer reflects the boundary.
    pub key_to_replace: Vec<u8>,
    /// The key now dividing the two leveled nodes.
    pub replacement_key: Vec<u8>,
}

/// Returns the child responsible for `query`: the child of the first
/// separator strictly greater than the query key. A query equal to a
/// separator routes to the child at or right of it. O(log npairs).
pub fn lookup(block: &[u8], query: &[u8]) -> Result<BlockId> {
    let key = SepKey::bounded(query)?;
    let header = Header::parse(block)?;
    if header.npairs == 0 {
        return Err(BoughError::Invalid("lookup on empty branch node"));
    }
    let index = upper_bound(block, &header, key)?;
    if index >= header.npairs as usize {
        return Err(BoughError::Corruption("branch node missing sentinel pair"));
    }
    node::pair_child(block, node::offset_at(block, index))
}

/// Records the outcome of a child split: `key` becomes a new separator whose
/// left child is `lnode` while the successor pair is re-pointed at `rnode`.
/// Returns `Ok(false)` without mutating when the pair plus its offset entry
/// do not fit; the caller must split this node and retry.
pub fn insert(
    block_size: BlockSize,
    block: &mut [u8],
    key: &[u8],
    lnode: BlockId,
    rnode: BlockId,
) -> Result<bool> {
    let sep = SepKey::bounded(key)?;
    let header = Header::parse(block)?;
    let mut needed = node::pair_size_for_key(key.len()) + OFFSET_ENTRY_LEN;
    if header.npairs == 0 {
        // A fresh node also needs its sentinel pair for the rightmost child.
        needed += node::pair_size_for_key(0) + OFFSET_ENTRY_LEN;
    }
    if header.free_space() < needed {
        return Ok(false);
    }
    if header.npairs == 0 {
        let offset = node::insert_pair(block, rnode, &[])?;
        node::insert_offset(block, 0, offset);
    }
    let header = Header::parse(block)?;
    let index = upper_bound(block, &header, sep)?;
    if index > 0 {
        let prev = node::pair_key(block, node::offset_at(block, index - 1))?;
        if prev == key {
            return Err(BoughError::Invalid("separator key already present"));
        }
    }
    let offset = node::insert_pair(block, lnode, key)?;
    node::insert_offset(block, index, offset);
    node::set_pair_child(block, node::offset_at(block, index + 1), rnode)?;
    debug_validate(block_size, block)?;
    Ok(true)
}

/// Deletes the pair carrying `key` (used after the corresponding child was
/// merged away). Removing the sentinel itself promotes the new last pair to
/// sentinel so the rightmost child stays addressed. Absent keys are a caller
/// bug, not a runtime condition.
pub fn remove(block_size: BlockSize, block: &mut [u8], key: &[u8]) -> Result<()> {
    let header = Header::parse(block)?;
    let target = SepKey::from_raw(key);
    let index = match find_exact(block, &header, target)? {
        Some(index) => index,
        None => return Err(BoughError::Invalid("separator key not present")),
    };
    let offset = node::offset_at(block, index);
    node::delete_pair(block, offset)?;
    node::delete_offset(block, index);
    if index == node::npairs(block) as usize {
        // The sentinel was removed; re-crown the new last pair.
        node::make_last_pair_special(block)?;
    }
    debug_validate(block_size, block)?;
    Ok(())
}

/// Splits a full node, moving the byte-wise upper half of its pairs into the
/// freshly initialized `dest`. The key surrendered by the low half's new
/// sentinel is returned as the median; the caller inserts it into the parent
/// between the two blocks. Must only be called when [`is_full`] holds.
pub fn split(block_size: BlockSize, block: &mut [u8], dest: &mut [u8]) -> Result<Vec<u8>> {
    debug_assert!(is_full(block)?);
    let header = Header::parse(block)?;
    let count = header.npairs as usize;
    if count < 2 {
        return Err(BoughError::Invalid("split requires at least two pairs"));
    }
    let heap_total = block_size.get() - header.frontmost as usize;
    let target = heap_total / 2;
    let mut acc = 0usize;
    let mut keep = 0usize;
    while acc < target && keep < count - 1 {
        acc += node::pair_size_at(block, node::offset_at(block, keep))?;
        keep += 1;
    }
    // The pair at keep - 1 stays as the low half's sentinel; its key is the
    // promoted median.
    let median = node::pair_key(block, node::offset_at(block, keep - 1))?.to_vec();
    if median.is_empty() {
        return Err(BoughError::Corruption("split median is the sentinel"));
    }

    let mut moved: SmallVec<[u16; 64]> = SmallVec::with_capacity(count - keep);
    for index in keep..count {
        moved.push(node::offset_at(block, index));
    }
    node::init_from(block_size, dest, block, &moved)?;

    for index in (keep..count).rev() {
        let offset = node::offset_at(block, index);
        node::delete_pair(block, offset)?;
        node::delete_offset(block, index);
    }
    node::make_last_pair_special(block)?;

    trace!(
        target: "bough::branch",
        kept = keep,
        moved = count - keep,
        median_len = median.len(),
        "split branch node"
    );
    debug_validate(block_size, block)?;
    debug_validate(block_size, dest)?;
    debug_assert!(!is_full(block)?);
    debug_assert!(!is_full(dest)?);
    Ok(median)
}

/// Merges two adjacent siblings: `right` absorbs all of `left`'s pairs at
/// the front, with `left`'s sentinel pair rekeyed by the parent separator
/// that divided them. That separator is returned; the caller removes it from
/// `parent` and frees `left`'s block. Must only be called when
/// [`is_mergable`] holds.
pub fn merge(
    block_size: BlockSize,
    left: &[u8],
    right: &mut [u8],
    parent: &[u8],
) -> Result<Vec<u8>> {
    debug_assert!(is_mergable(block_size, left, right, parent)?);
    let left_header = Header::parse(left)?;
    let (_, key_to_remove) = parent_separator(parent, left, right)?;
    let count = left_header.npairs as usize;
    for index in 0..count {
        let offset = node::offset_at(left, index);
        let child = node::pair_child(left, offset)?;
        let key = node::pair_key(left, offset)?;
        let rekeyed: &[u8] = if key.is_empty() { &key_to_remove } else { key };
        let new_offset = node::insert_pair(right, child, rekeyed)?;
        node::insert_offset(right, index, new_offset);
    }
    trace!(
        target: "bough::branch",
        absorbed = count,
        separator_len = key_to_remove.len(),
        "merged branch nodes"
    );
    debug_validate(block_size, right)?;
    Ok(key_to_remove)
}

/// Redistributes pairs between the underfull `block` and its fuller
/// `sibling` until they are byte-balanced, without touching the parent. On
/// success the returned [`LevelOutcome`] names the parent separator rewrite
/// the caller must apply via [`update_key`]. Returns `Ok(None)`, mutating
/// nothing, when redistribution would not relieve the underfull condition.
pub fn level(
    block_size: BlockSize,
    block: &mut [u8],
    sibling: &mut [u8],
    parent: &[u8],
) -> Result<Option<LevelOutcome>> {
    if is_singleton(block)? || is_singleton(sibling)? {
        return Err(BoughError::Invalid("level on singleton node"));
    }
    match nodecmp(block, sibling)? {
        Ordering::Less => level_from_right(block_size, block, sibling, parent),
        Ordering::Greater => level_from_left(block_size, block, sibling, parent),
        Ordering::Equal => Err(BoughError::Invalid("level requires distinct siblings")),
    }
}

/// Picks the adjacent sibling of the child addressed by `key`: the right
/// neighbor, or the left one when the key routes to the rightmost child.
/// Deterministic, so independent callers agree on the choice.
pub fn sibling(block: &[u8], key: &[u8]) -> Result<(Side, BlockId)> {
    let sep = SepKey::bounded(key)?;
    let header = Header::parse(block)?;
    if header.npairs < 2 {
        return Err(BoughError::Invalid("node has no siblings to offer"));
    }
    let index = upper_bound(block, &header, sep)?;
    if index + 1 < header.npairs as usize {
        let child = node::pair_child(block, node::offset_at(block, index + 1))?;
        Ok((Side::Right, child))
    } else {
        let child = node::pair_child(block, node::offset_at(block, index - 1))?;
        Ok((Side::Left, child))
    }
}

/// Replaces the separator `key_to_replace` with `replacement`, keeping the
/// pair's child. Equal-length replacements are rewritten in place; any other
/// size goes through delete-and-reinsert because a heap pair cannot change
/// size where it lies. The replacement must preserve the node's ordering.
pub fn update_key(
    block_size: BlockSize,
    block: &mut [u8],
    key_to_replace: &[u8],
    replacement: &[u8],
) -> Result<()> {
    SepKey::bounded(key_to_replace)?;
    SepKey::bounded(replacement)?;
    let header = Header::parse(block)?;
    let index = match find_exact(block, &header, SepKey::Bounded(key_to_replace))? {
        Some(index) => index,
        None => return Err(BoughError::Invalid("separator key not present")),
    };
    let offset = node::offset_at(block, index);
    if replacement.len() == key_to_replace.len() {
        let start = offset as usize + PAIR_HEADER_LEN;
        block[start..start + replacement.len()].copy_from_slice(replacement);
    } else {
        let child = node::pair_child(block, offset)?;
        node::delete_pair(block, offset)?;
        node::delete_offset(block, index);
        let offset = node::insert_pair(block, child, replacement)?;
        node::insert_offset(block, index, offset);
    }
    debug_validate(block_size, block)?;
    Ok(())
}

/// Canonical order between two whole nodes: their first keys under the
/// sentinel-aware comparator. Used to pick a deterministic merge direction
/// and lock order between adjacent siblings.
pub fn nodecmp(a: &[u8], b: &[u8]) -> Result<Ordering> {
    Ok(first_key(a)?.cmp(&first_key(b)?))
}

/// True when one more maximum-plausible pair (plus its offset entry) would
/// no longer fit. Computed from bytes, not pair count, because key sizes
/// vary.
pub fn is_full(block: &[u8]) -> Result<bool> {
    let header = Header::parse(block)?;
    Ok(header.free_space() < EPSILON + OFFSET_ENTRY_LEN)
}

/// True when usage has dropped far enough below half a block that merging or
/// leveling is worth considering. The epsilon margin keeps this threshold
/// strictly below the split threshold to prevent split/merge thrashing.
pub fn is_underfull(block_size: BlockSize, block: &[u8]) -> Result<bool> {
    let header = Header::parse(block)?;
    Ok(underfull_bytes(block_size, header.bytes_used(block_size)))
}

/// True when a growing key update could overflow the node, so a caller in
/// the middle of a multi-step rebalance must not assume the node stays
/// stable.
pub fn change_unsafe(block: &[u8]) -> Result<bool> {
    let header = Header::parse(block)?;
    Ok(header.free_space() < MAX_KEY_SIZE)
}

/// True when the two siblings' pairs, plus the parent separator that
/// `left`'s sentinel would re-absorb, fit in a single block with the
/// hysteresis margin to spare.
pub fn is_mergable(
    block_size: BlockSize,
    left: &[u8],
    right: &[u8],
    parent: &[u8],
) -> Result<bool> {
    let left_header = Header::parse(left)?;
    let right_header = Header::parse(right)?;
    let (_, separator) = parent_separator(parent, left, right)?;
    let merged = left_header.bytes_used(block_size) + right_header.bytes_used(block_size)
        - crate::types::NODE_HEADER_LEN
        + separator.len();
    Ok(merged + EPSILON + OFFSET_ENTRY_LEN < block_size.get())
}

/// True when the node holds only the sentinel pair: one child and no real
/// separators. An intermediate state; the caller should collapse a tree
/// level.
pub fn is_singleton(block: &[u8]) -> Result<bool> {
    let header = Header::parse(block)?;
    if header.npairs != 1 {
        return Ok(false);
    }
    let key = node::pair_key(block, node::offset_at(block, 0))?;
    if !key.is_empty() {
        return Err(BoughError::Corruption("single pair is not the sentinel"));
    }
    Ok(true)
}

fn underfull_bytes(block_size: BlockSize, bytes_used: usize) -> bool {
    bytes_used + EPSILON < block_size.get() / 2
}

/// First index whose pair key is strictly greater than `key`.
fn upper_bound(block: &[u8], header: &Header, key: SepKey<'_>) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = header.npairs as usize;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let probe = node::pair_key(block, node::offset_at(block, mid))?;
        if SepKey::from_raw(probe) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Index of the pair whose key equals `key` exactly, if any.
fn find_exact(block: &[u8], header: &Header, key: SepKey<'_>) -> Result<Option<usize>> {
    if key.is_unbounded() {
        let count = header.npairs as usize;
        if count == 0 {
            return Ok(None);
        }
        let last = node::pair_key(block, node::offset_at(block, count - 1))?;
        return Ok(if last.is_empty() { Some(count - 1) } else { None });
    }
    let index = upper_bound(block, header, key)?;
    if index == 0 {
        return Ok(None);
    }
    let candidate = node::pair_key(block, node::offset_at(block, index - 1))?;
    Ok(if candidate == key.raw() {
        Some(index - 1)
    } else {
        None
    })
}

fn first_key(block: &[u8]) -> Result<SepKey<'_>> {
    let header = Header::parse(block)?;
    if header.npairs == 0 {
        return Ok(SepKey::Unbounded);
    }
    Ok(SepKey::from_raw(node::pair_key(
        block,
        node::offset_at(block, 0),
    )?))
}

/// First real (non-sentinel) key of a node, absent for empty and singleton
/// nodes.
fn first_real_key(block: &[u8]) -> Result<Option<&[u8]>> {
    let header = Header::parse(block)?;
    if header.npairs < 2 {
        return Ok(None);
    }
    Ok(Some(node::pair_key(block, node::offset_at(block, 0))?))
}

/// Locates the parent separator dividing two adjacent siblings: the first
/// parent key greater than any key of the left node. Works as long as at
/// least one sibling carries a real key.
fn parent_separator(parent: &[u8], left: &[u8], right: &[u8]) -> Result<(usize, Vec<u8>)> {
    let parent_header = Header::parse(parent)?;
    let index = if let Some(key) = first_real_key(left)? {
        upper_bound(parent, &parent_header, SepKey::Bounded(key))?
    } else if let Some(key) = first_real_key(right)? {
        let bound = upper_bound(parent, &parent_header, SepKey::Bounded(key))?;
        if bound == 0 {
            return Err(BoughError::Corruption("sibling key precedes all parent keys"));
        }
        bound - 1
    } else {
        return Err(BoughError::Invalid(
            "cannot locate parent separator for singleton siblings",
        ));
    };
    if index >= parent_header.npairs as usize {
        return Err(BoughError::Corruption("parent separator index out of range"));
    }
    let key = node::pair_key(parent, node::offset_at(parent, index))?;
    if key.is_empty() {
        return Err(BoughError::Corruption("parent separator is the sentinel"));
    }
    Ok((index, key.to_vec()))
}

/// Levels an underfull left node by pulling pairs from the front of its
/// right sibling. The left node's sentinel is first rekeyed with the parent
/// separator, arriving pairs are appended, and the last arrival surrenders
/// its key to become the new sentinel and the new parent separator.
fn level_from_right(
    block_size: BlockSize,
    block: &mut [u8],
    sibling: &mut [u8],
    parent: &[u8],
) -> Result<Option<LevelOutcome>> {
    let (_, key_to_replace) = parent_separator(parent, block, sibling)?;
    let header = Header::parse(block)?;
    let sibling_header = Header::parse(sibling)?;
    let sibling_count = sibling_header.npairs as usize;

    let mut node_used = header.bytes_used(block_size) + key_to_replace.len();
    let mut sibling_used = sibling_header.bytes_used(block_size);
    let mut moved = 0usize;
    let mut last_key_len = 0usize;
    while moved + 1 < sibling_count {
        let size = node::pair_size_at(sibling, node::offset_at(sibling, moved))?;
        let cost = size + OFFSET_ENTRY_LEN;
        // Relief is judged net of the key the last arrival surrenders to the
        // sentinel. Balance ends the loop only once relief is secured; a
        // donor about to go underfull ends it regardless.
        let relieved = moved > 0 && !underfull_bytes(block_size, node_used - last_key_len);
        if relieved && node_used + cost >= sibling_used - cost {
            break;
        }
        if underfull_bytes(block_size, sibling_used - cost) {
            break;
        }
        node_used += cost;
        sibling_used -= cost;
        last_key_len = size - PAIR_HEADER_LEN;
        moved += 1;
    }
    if moved == 0 || underfull_bytes(block_size, node_used - last_key_len) {
        return Ok(None);
    }

    // Rekey our sentinel with the old parent separator.
    let count = header.npairs as usize;
    let offset = node::offset_at(block, count - 1);
    let child = node::pair_child(block, offset)?;
    node::delete_pair(block, offset)?;
    node::delete_offset(block, count - 1);
    let offset = node::insert_pair(block, child, &key_to_replace)?;
    node::insert_offset(block, count - 1, offset);

    let mut replacement_key = Vec::new();
    for _ in 0..moved {
        let src_offset = node::offset_at(sibling, 0);
        let child = node::pair_child(sibling, src_offset)?;
        let key = node::pair_key(sibling, src_offset)?.to_vec();
        node::delete_pair(sibling, src_offset)?;
        node::delete_offset(sibling, 0);
        let index = node::npairs(block) as usize;
        let offset = node::insert_pair(block, child, &key)?;
        node::insert_offset(block, index, offset);
        replacement_key = key;
    }
    node::make_last_pair_special(block)?;

    trace!(
        target: "bough::branch",
        moved,
        direction = "from_right",
        "leveled branch nodes"
    );
    debug_validate(block_size, block)?;
    debug_validate(block_size, sibling)?;
    Ok(Some(LevelOutcome {
        key_to_replace,
        replacement_key,
    }))
}

/// Levels an underfull right node by pulling pairs from the tail of its left
/// sibling. The sibling's sentinel arrives rekeyed with the parent
/// separator; the sibling's new last pair surrenders its key to become its
/// sentinel and the new parent separator.
fn level_from_left(
    block_size: BlockSize,
    block: &mut [u8],
    sibling: &mut [u8],
    parent: &[u8],
) -> Result<Option<LevelOutcome>> {
    let (_, key_to_replace) = parent_separator(parent, sibling, block)?;
    let header = Header::parse(block)?;
    let sibling_header = Header::parse(sibling)?;
    let sibling_count = sibling_header.npairs as usize;

    // The first move converts the sibling's sentinel into a real front pair.
    let mut node_used = header.bytes_used(block_size)
        + node::pair_size_for_key(key_to_replace.len())
        + OFFSET_ENTRY_LEN;
    let mut sibling_used =
        sibling_header.bytes_used(block_size) - node::pair_size_for_key(0) - OFFSET_ENTRY_LEN;
    let mut moved = 1usize;
    while moved + 1 < sibling_count {
        let index = sibling_count - 1 - moved;
        let size = node::pair_size_at(sibling, node::offset_at(sibling, index))?;
        let cost = size + OFFSET_ENTRY_LEN;
        // Balance ends the loop only once the receiver is relieved; a donor
        // about to go underfull ends it regardless.
        let relieved = !underfull_bytes(block_size, node_used);
        if relieved && node_used + cost >= sibling_used - cost {
            break;
        }
        if underfull_bytes(block_size, sibling_used - cost) {
            break;
        }
        node_used += cost;
        sibling_used -= cost;
        moved += 1;
    }
    // The sibling pair that stays behind as the new sentinel gives its key
    // to the parent.
    let boundary_index = sibling_count - 1 - moved;
    let replacement_key =
        node::pair_key(sibling, node::offset_at(sibling, boundary_index))?.to_vec();
    if replacement_key.is_empty() {
        return Err(BoughError::Corruption("leveling boundary hit the sentinel"));
    }
    if underfull_bytes(block_size, node_used)
        || underfull_bytes(block_size, sibling_used - replacement_key.len())
    {
        return Ok(None);
    }

    // Collect the arriving pairs in ascending order before mutating.
    let mut arrivals: Vec<(BlockId, Vec<u8>)> = Vec::with_capacity(moved);
    for index in boundary_index + 1..sibling_count {
        let offset = node::offset_at(sibling, index);
        let child = node::pair_child(sibling, offset)?;
        let key = node::pair_key(sibling, offset)?;
        let key = if key.is_empty() {
            key_to_replace.clone()
        } else {
            key.to_vec()
        };
        arrivals.push((child, key));
    }
    for index in (boundary_index + 1..sibling_count).rev() {
        let offset = node::offset_at(sibling, index);
        node::delete_pair(sibling, offset)?;
        node::delete_offset(sibling, index);
    }
    node::make_last_pair_special(sibling)?;
    for (position, (child, key)) in arrivals.iter().enumerate() {
        let offset = node::insert_pair(block, *child, key)?;
        node::insert_offset(block, position, offset);
    }

    trace!(
        target: "bough::branch",
        moved,
        direction = "from_left",
        "leveled branch nodes"
    );
    debug_validate(block_size, block)?;
    debug_validate(block_size, sibling)?;
    Ok(Some(LevelOutcome {
        key_to_replace,
        replacement_key,
    }))
}

/// Runs the full invariant walk after mutations in debug builds only; the
/// O(npairs) cost is not paid in release builds.
fn debug_validate(block_size: BlockSize, block: &[u8]) -> Result<()> {
    if cfg!(debug_assertions) {
        node::validate(block_size, block)?;
    }
    Ok(())
}
