//! Stored records and their bucket/key layout
//!
//! Every record is bincode-encoded. Buckets are per log type
//! (`{user|mutation|treehead}_{data|leaf|node|tree|index}`) plus `map_node`
//! and `metadata`; integer keys are big-endian so lexical order is numeric order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bpath::BPath;
use crate::storage::{KeyReader, KeyWriter};
use crate::types::{Hash32, LeafData, LogTreeHead, LogType};
use crate::{Result, VdsError};

/// Merkle leaf hash stored at a log index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    pub mth: Hash32,
}

/// Hash of a complete power-of-two subtree `[start, end)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub mth: Hash32,
}

/// Root hash of a log at a given size
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTreeHash {
    pub mth: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryIndex {
    pub index: u64,
}

/// Number of mutations applied to a namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSize {
    pub size: u64,
}

/// Node of the versioned sparse map trie.
///
/// A leaf carries `leaf_hash` and the full key `path`. An internal node carries
/// up to two children, each a `(version, cached hash)` pair; version 0 marks an
/// absent child whose hash is the default for that depth.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapNode {
    pub left_number: u64,
    pub left_hash: Option<Hash32>,
    pub right_number: u64,
    pub right_hash: Option<Hash32>,
    pub leaf_hash: Option<Hash32>,
    pub path: BPath,
}

impl MapNode {
    pub fn leaf(leaf_hash: Hash32, path: BPath) -> Self {
        Self {
            leaf_hash: Some(leaf_hash),
            path,
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf_hash.is_some()
    }
}

const MAP_NODE_BUCKET: &[u8] = b"map_node";
const METADATA_BUCKET: &[u8] = b"metadata";
const OBJECT_SIZE_KEY: &[u8] = b"size";

#[derive(Clone, Copy)]
enum BucketKind {
    DataByLeafHash,
    LeafNodeByIndex,
    TreeNodeByRange,
    RootHashBySize,
    IndexByLeafHash,
}

fn bucket(lt: LogType, kind: BucketKind) -> Vec<u8> {
    let suffix = match kind {
        BucketKind::DataByLeafHash => "data",
        BucketKind::LeafNodeByIndex => "leaf",
        BucketKind::TreeNodeByRange => "node",
        BucketKind::RootHashBySize => "tree",
        BucketKind::IndexByLeafHash => "index",
    };
    format!("{}_{}", lt.prefix(), suffix).into_bytes()
}

fn int_key(i: u64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn range_key(start: u64, end: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&start.to_be_bytes());
    key.extend_from_slice(&end.to_be_bytes());
    key
}

fn map_node_key(number: u64, path: &BPath) -> Vec<u8> {
    let mut key = int_key(number);
    key.extend_from_slice(path.as_bytes());
    key
}

fn get<R, T>(kr: &R, bucket: &[u8], key: &[u8]) -> Result<T>
where
    R: KeyReader + ?Sized,
    T: DeserializeOwned,
{
    let bytes = kr.get(bucket, key)?.ok_or(VdsError::NoSuchKey)?;
    bincode::deserialize(&bytes).map_err(|e| VdsError::Serialization(e.to_string()))
}

fn put<W, T>(kw: &mut W, bucket: &[u8], key: &[u8], value: &T) -> Result<()>
where
    W: KeyWriter + ?Sized,
    T: Serialize,
{
    let bytes = bincode::serialize(value).map_err(|e| VdsError::Serialization(e.to_string()))?;
    kw.set(bucket, key, Some(bytes))
}

pub fn write_data_by_leaf_hash<W: KeyWriter + ?Sized>(kw: &mut W, lt: LogType, lh: &Hash32, data: &LeafData) -> Result<()> {
    put(kw, &bucket(lt, BucketKind::DataByLeafHash), lh, data)
}

pub fn lookup_data_by_leaf_hash<R: KeyReader + ?Sized>(kr: &R, lt: LogType, lh: &Hash32) -> Result<LeafData> {
    get(kr, &bucket(lt, BucketKind::DataByLeafHash), lh)
}

pub fn write_leaf_node_by_index<W: KeyWriter + ?Sized>(kw: &mut W, lt: LogType, idx: u64, node: &LeafNode) -> Result<()> {
    put(kw, &bucket(lt, BucketKind::LeafNodeByIndex), &int_key(idx), node)
}

pub fn lookup_leaf_node_by_index<R: KeyReader + ?Sized>(kr: &R, lt: LogType, idx: u64) -> Result<LeafNode> {
    get(kr, &bucket(lt, BucketKind::LeafNodeByIndex), &int_key(idx))
}

pub fn write_tree_node_by_range<W: KeyWriter + ?Sized>(kw: &mut W, lt: LogType, start: u64, end: u64, node: &TreeNode) -> Result<()> {
    put(kw, &bucket(lt, BucketKind::TreeNodeByRange), &range_key(start, end), node)
}

pub fn lookup_tree_node_by_range<R: KeyReader + ?Sized>(kr: &R, lt: LogType, start: u64, end: u64) -> Result<TreeNode> {
    get(kr, &bucket(lt, BucketKind::TreeNodeByRange), &range_key(start, end))
}

pub fn write_log_root_hash_by_size<W: KeyWriter + ?Sized>(kw: &mut W, lt: LogType, size: u64, th: &LogTreeHash) -> Result<()> {
    put(kw, &bucket(lt, BucketKind::RootHashBySize), &int_key(size), th)
}

/// `size` must be greater than zero
pub fn lookup_log_root_hash_by_size<R: KeyReader + ?Sized>(kr: &R, lt: LogType, size: u64) -> Result<LogTreeHash> {
    get(kr, &bucket(lt, BucketKind::RootHashBySize), &int_key(size))
}

pub fn write_index_by_leaf_hash<W: KeyWriter + ?Sized>(kw: &mut W, lt: LogType, lh: &Hash32, ei: &EntryIndex) -> Result<()> {
    put(kw, &bucket(lt, BucketKind::IndexByLeafHash), lh, ei)
}

pub fn lookup_index_by_leaf_hash<R: KeyReader + ?Sized>(kr: &R, lt: LogType, lh: &Hash32) -> Result<EntryIndex> {
    get(kr, &bucket(lt, BucketKind::IndexByLeafHash), lh)
}

pub fn write_object_size<W: KeyWriter + ?Sized>(kw: &mut W, size: u64) -> Result<()> {
    put(kw, METADATA_BUCKET, OBJECT_SIZE_KEY, &ObjectSize { size })
}

/// Current size of the namespace; a namespace never written to has size 0.
pub fn read_object_size<R: KeyReader + ?Sized>(kr: &R) -> Result<u64> {
    match get::<R, ObjectSize>(kr, METADATA_BUCKET, OBJECT_SIZE_KEY) {
        Ok(os) => Ok(os.size),
        Err(VdsError::NoSuchKey) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Head of a log at the namespace's current size
pub fn lookup_log_tree_head<R: KeyReader + ?Sized>(kr: &R, lt: LogType) -> Result<LogTreeHead> {
    let size = read_object_size(kr)?;
    if size == 0 {
        return Ok(LogTreeHead::default());
    }
    let th = lookup_log_root_hash_by_size(kr, lt, size)?;
    Ok(LogTreeHead {
        tree_size: size,
        root_hash: th.mth,
    })
}

pub fn write_map_node<W: KeyWriter + ?Sized>(kw: &mut W, number: u64, path: &BPath, node: &MapNode) -> Result<()> {
    put(kw, MAP_NODE_BUCKET, &map_node_key(number, path), node)
}

/// The root of version 0 is the implicit empty node.
pub fn lookup_map_node<R: KeyReader + ?Sized>(kr: &R, number: u64, path: &BPath) -> Result<MapNode> {
    if number == 0 && path.is_empty() {
        return Ok(MapNode::default());
    }
    get(kr, MAP_NODE_BUCKET, &map_node_key(number, path))
}

/// Leaf hashes at indices `[first, last)`
pub fn lookup_log_entry_hashes<R: KeyReader + ?Sized>(kr: &R, lt: LogType, first: u64, last: u64) -> Result<Vec<Hash32>> {
    (first..last)
        .map(|i| lookup_leaf_node_by_index(kr, lt, i).map(|n| n.mth))
        .collect()
}
