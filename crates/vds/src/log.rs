//! Append-only log insertion
//!
//! Appending leaf `n` writes its data, its leaf node and index, every complete
//! subtree it closes, and the root hash for size `n + 1`. Only the hashes of the
//! complete subtrees to its left are read back.

use tracing::debug;

use crate::crypto::node_hash;
use crate::map::set_map_value;
use crate::merkle::{calc_k, create_needed_stack};
use crate::records::{self, EntryIndex, LeafNode, LogTreeHash, TreeNode};
use crate::storage::{KeyReader, KeyWriter};
use crate::types::{Hash32, LeafData, LogRef, LogTreeHead, LogType, MapMutation, MapTreeHead, Mutation};
use crate::{Result, VdsError};

/// Hashes of the given `[start, end)` ranges, leaf nodes for width-1 ranges.
///
/// With `fail_on_missing` unset, a range with no stored hash comes back as
/// `None` so callers can recompute it.
pub fn fetch_sub_tree_hashes<R: KeyReader + ?Sized>(
    kr: &R,
    lt: LogType,
    ranges: &[(u64, u64)],
    fail_on_missing: bool,
) -> Result<Vec<Option<Hash32>>> {
    let mut rv = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges {
        let found = if end - start == 1 {
            records::lookup_leaf_node_by_index(kr, lt, start).map(|n| n.mth)
        } else {
            records::lookup_tree_node_by_range(kr, lt, start, end).map(|n| n.mth)
        };
        match found {
            Ok(h) => rv.push(Some(h)),
            Err(VdsError::NoSuchKey) if !fail_on_missing => rv.push(None),
            Err(e) => return Err(e),
        }
    }
    Ok(rv)
}

/// Like [`fetch_sub_tree_hashes`] with every range required to exist
pub fn fetch_required_sub_tree_hashes<R: KeyReader + ?Sized>(
    kr: &R,
    lt: LogType,
    ranges: &[(u64, u64)],
) -> Result<Vec<Hash32>> {
    fetch_sub_tree_hashes(kr, lt, ranges, true)?
        .into_iter()
        .map(|h| h.ok_or(VdsError::NoSuchKey))
        .collect()
}

/// Hash of an arbitrary range, folded from the stored complete subtrees covering it
pub fn calc_sub_tree_hash<R: KeyReader + ?Sized>(kr: &R, lt: LogType, start: u64, end: u64) -> Result<Hash32> {
    let mut ranges = Vec::new();
    let mut s = start;
    while s != end {
        let k = calc_k(end - s + 1);
        ranges.push((s, s + k));
        s += k;
    }

    let hashes = fetch_required_sub_tree_hashes(kr, lt, &ranges)?;
    let (last, rest) = hashes.split_last().ok_or(VdsError::InvalidTreeRange)?;
    Ok(rest.iter().rev().fold(*last, |acc, h| node_hash(h, &acc)))
}

/// Push leaf `index` onto `stack`, persist each subtree it completes and
/// return the root hash of the log of size `index + 1`.
pub fn write_out_log_tree_nodes<W: KeyWriter + ?Sized>(
    kw: &mut W,
    lt: LogType,
    index: u64,
    mtl: Hash32,
    mut stack: Vec<Hash32>,
) -> Result<Hash32> {
    stack.push(mtl);
    let (mut zz, mut width) = (index, 2u64);
    while zz & 1 == 1 {
        let right = stack.pop().ok_or(VdsError::InvalidTreeRange)?;
        let left = stack.pop().ok_or(VdsError::InvalidTreeRange)?;
        let parent = node_hash(&left, &right);
        records::write_tree_node_by_range(kw, lt, index + 1 - width, index + 1, &TreeNode { mth: parent })?;
        stack.push(parent);
        zz >>= 1;
        width <<= 1;
    }

    let (last, rest) = stack.split_last().ok_or(VdsError::InvalidTreeRange)?;
    Ok(rest.iter().rev().fold(*last, |acc, h| node_hash(h, &acc)))
}

/// Append `data` at index `size_before`.
///
/// Returns `None` when the leaf is already present below `size_before`, so
/// replaying the same append is harmless.
pub fn add_entry_to_log<W: KeyWriter + ?Sized>(
    kw: &mut W,
    size_before: u64,
    lt: LogType,
    data: &LeafData,
) -> Result<Option<LogTreeHead>> {
    let mtl = data.leaf_hash();

    match records::lookup_index_by_leaf_hash(&*kw, lt, &mtl) {
        Ok(ei) if ei.index < size_before => return Ok(None),
        Ok(_) | Err(VdsError::NoSuchKey) => {}
        Err(e) => return Err(e),
    }

    records::write_data_by_leaf_hash(kw, lt, &mtl, data)?;
    records::write_leaf_node_by_index(kw, lt, size_before, &LeafNode { mth: mtl })?;
    records::write_index_by_leaf_hash(kw, lt, &mtl, &EntryIndex { index: size_before })?;

    let stack = fetch_required_sub_tree_hashes(&*kw, lt, &create_needed_stack(size_before))?;
    let root_hash = write_out_log_tree_nodes(kw, lt, size_before, mtl, stack)?;
    records::write_log_root_hash_by_size(kw, lt, size_before + 1, &LogTreeHash { mth: root_hash })?;

    debug!(log_type = ?lt, index = size_before, leaf = %hex::encode(mtl), "appended log entry");
    Ok(Some(LogTreeHead {
        tree_size: size_before + 1,
        root_hash,
    }))
}

/// Append to `log`. Returns the namespace size afterwards.
///
/// An entry on a map's mutation log is also applied to the map, and the
/// resulting map tree head appended to the map's tree-head log.
pub fn apply_log_add_entry<W: KeyWriter + ?Sized>(
    kw: &mut W,
    size_before: u64,
    log: &LogRef,
    value: &LeafData,
) -> Result<u64> {
    let Some(mutation_log_head) = add_entry_to_log(kw, size_before, log.log_type, value)? else {
        debug!(log = %log.name, "entry already present");
        return Ok(size_before);
    };

    match log.log_type {
        LogType::User => {}
        LogType::Mutation => {
            let mutation = MapMutation::from_leaf_data(value)?;
            let root_hash = set_map_value(kw, size_before, &mutation)?;
            let head = MapTreeHead {
                root_hash,
                mutation_log: mutation_log_head,
            };
            add_entry_to_log(kw, size_before, LogType::TreeHead, &head.to_leaf_data()?)?;
        }
        LogType::TreeHead => {
            return Err(VdsError::InvalidRequest("tree head logs are not directly writable".into()));
        }
    }
    Ok(size_before + 1)
}

/// Apply one queued mutation to its namespace
pub fn apply_mutation<W: KeyWriter + ?Sized>(kw: &mut W, size_before: u64, mutation: &Mutation) -> Result<u64> {
    match mutation {
        Mutation::LogAddEntry { log, value } => apply_log_add_entry(kw, size_before, log, value),
    }
}
