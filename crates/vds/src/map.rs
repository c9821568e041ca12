//! Versioned sparse Merkle map
//!
//! Mutation `n` reads the trie of version `n` and writes the changed path as
//! version `n + 1`. Nodes are stored at `(version, path prefix)`; untouched
//! subtrees keep pointing at the versions that wrote them.

use tracing::debug;

use crate::bpath::BPath;
use crate::crypto::{leaf_hash, null_leaf_hash, MAP_DEPTH};
use crate::merkle::calc_node_hash;
use crate::records::{self, MapNode};
use crate::storage::{KeyReader, KeyWriter};
use crate::types::{Hash32, LogType, MapMutation, MutationAction};
use crate::{Result, VdsError};

/// Leaf hash the key should hold after `mutation`, given what it holds now.
pub fn mutation_leaf_hash(mutation: &MapMutation, prev: &Hash32) -> Result<Hash32> {
    match mutation.action {
        MutationAction::Set => Ok(leaf_hash(mutation.value_input())),
        MutationAction::Delete => Ok(null_leaf_hash()),
        MutationAction::Update => {
            if mutation.previous_leaf_hash.as_ref() == Some(prev) {
                Ok(leaf_hash(mutation.value_input()))
            } else {
                Ok(*prev)
            }
        }
        MutationAction::Unknown => Err(VdsError::NotImplemented),
    }
}

/// Follow `path` from `root` while the next child exists.
///
/// Returns the node where the descent stopped and the nodes above it, root first.
pub fn descend_to_fork<R: KeyReader + ?Sized>(kr: &R, path: &BPath, root: MapNode) -> Result<(MapNode, Vec<MapNode>)> {
    let mut ancestors = Vec::new();
    let mut head = root;
    loop {
        let depth = ancestors.len();
        let number = if path.at(depth) { head.right_number } else { head.left_number };
        if number == 0 {
            return Ok((head, ancestors));
        }
        let child = records::lookup_map_node(kr, number, &path.slice(0, depth + 1))?;
        ancestors.push(std::mem::replace(&mut head, child));
    }
}

/// Rewrite the chain of `ancestors` above `last` as version `index + 1` and
/// return the new root hash.
pub fn write_ancestors<W: KeyWriter + ?Sized>(
    kw: &mut W,
    last: &MapNode,
    ancestors: &[MapNode],
    key_path: &BPath,
    index: u64,
) -> Result<Hash32> {
    let mut cur = calc_node_hash(last, ancestors.len());
    for (i, anc) in ancestors.iter().enumerate().rev() {
        let node = if key_path.at(i) {
            MapNode {
                left_number: anc.left_number,
                left_hash: anc.left_hash,
                right_number: index + 1,
                right_hash: Some(cur),
                ..MapNode::default()
            }
        } else {
            MapNode {
                left_number: index + 1,
                left_hash: Some(cur),
                right_number: anc.right_number,
                right_hash: anc.right_hash,
                ..MapNode::default()
            }
        };
        records::write_map_node(kw, index + 1, &key_path.slice(0, i), &node)?;
        cur = calc_node_hash(&node, i);
    }
    Ok(cur)
}

/// A node with no children whose leaf, if any, is the null leaf
pub fn is_empty_node(node: &MapNode) -> bool {
    node.leaf_hash.map_or(true, |h| h == null_leaf_hash()) && node.left_number == 0 && node.right_number == 0
}

/// Apply `mutation` to map version `index`, writing version `index + 1`.
/// Returns the root hash of the new version.
///
/// Deleting writes the null leaf in place; subtrees are never collapsed since
/// the null leaf hashes the same as an empty subtree.
pub fn set_map_value<W: KeyWriter + ?Sized>(kw: &mut W, index: u64, mutation: &MapMutation) -> Result<Hash32> {
    let key_path = BPath::from_key(&mutation.key);

    let root = records::lookup_map_node(&*kw, index, &BPath::empty())?;
    let (head, mut ancestors) = descend_to_fork(&*kw, &key_path, root.clone())?;

    let is_match = head.path == key_path;
    let prev = match head.leaf_hash {
        Some(h) if is_match => h,
        _ => null_leaf_hash(),
    };
    let next = mutation_leaf_hash(mutation, &prev)?;

    if prev == next {
        debug!(version = index + 1, "map mutation is a no-op");
        records::write_map_node(kw, index + 1, &BPath::empty(), &root)?;
        return Ok(calc_node_hash(&root, 0));
    }

    if next != null_leaf_hash() {
        let value = mutation.value.clone().unwrap_or_default();
        records::write_data_by_leaf_hash(kw, LogType::Mutation, &next, &value)?;
    }

    if !is_match && !is_empty_node(&head) {
        if !head.is_leaf() {
            ancestors.push(head);
        } else {
            // Another key's leaf sits here: push stubs down to the first
            // differing bit, then a parent holding both leaves.
            while key_path.at(ancestors.len()) == head.path.at(ancestors.len()) {
                if ancestors.len() + 1 >= MAP_DEPTH {
                    return Err(VdsError::InvalidRequest("key path collision".into()));
                }
                ancestors.push(MapNode::default());
            }

            let depth = ancestors.len();
            let their_hash = calc_node_hash(&head, depth + 1);
            let mut parent = MapNode::default();
            let their_side = if key_path.at(depth) {
                parent.left_number = index + 1;
                parent.left_hash = Some(their_hash);
                BPath::bit(false)
            } else {
                parent.right_number = index + 1;
                parent.right_hash = Some(their_hash);
                BPath::bit(true)
            };
            records::write_map_node(kw, index + 1, &BPath::join(&key_path.slice(0, depth), &their_side), &head)?;
            ancestors.push(parent);
        }
    }

    let last = MapNode::leaf(next, key_path.clone());
    records::write_map_node(kw, index + 1, &key_path.slice(0, ancestors.len()), &last)?;
    let root_hash = write_ancestors(kw, &last, &ancestors, &key_path, index)?;

    debug!(version = index + 1, depth = ancestors.len(), root = %hex::encode(root_hash), "map mutation applied");
    Ok(root_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::default_leaf_values;
    use crate::storage::{InMemoryStorage, StorageWriter};
    use crate::types::LeafData;

    fn apply(storage: &InMemoryStorage, index: u64, mutation: MapMutation) -> Hash32 {
        storage
            .execute_update(b"map", |kw| set_map_value(kw, index, &mutation))
            .unwrap()
    }

    #[test]
    fn leaf_hash_per_action() {
        let v = LeafData::raw("v");
        let prev = leaf_hash(b"old");
        assert_eq!(mutation_leaf_hash(&MapMutation::set("k", v.clone()), &prev), Ok(leaf_hash(b"v")));
        assert_eq!(mutation_leaf_hash(&MapMutation::delete("k"), &prev), Ok(null_leaf_hash()));
        assert_eq!(
            mutation_leaf_hash(&MapMutation::update("k", v.clone(), prev), &prev),
            Ok(leaf_hash(b"v"))
        );
        assert_eq!(
            mutation_leaf_hash(&MapMutation::update("k", v.clone(), leaf_hash(b"stale")), &prev),
            Ok(prev)
        );

        let mut unknown = MapMutation::set("k", v);
        unknown.action = MutationAction::Unknown;
        assert_eq!(mutation_leaf_hash(&unknown, &prev), Err(VdsError::NotImplemented));
    }

    #[test]
    fn empty_nodes() {
        assert!(is_empty_node(&MapNode::default()));
        assert!(is_empty_node(&MapNode::leaf(null_leaf_hash(), BPath::from_key(b"k"))));
        assert!(!is_empty_node(&MapNode::leaf(leaf_hash(b"x"), BPath::from_key(b"k"))));
        assert!(!is_empty_node(&MapNode {
            left_number: 1,
            ..MapNode::default()
        }));
    }

    #[test]
    fn deleting_everything_returns_to_empty_root() {
        let storage = InMemoryStorage::new();
        apply(&storage, 0, MapMutation::set("a", LeafData::raw("1")));
        apply(&storage, 1, MapMutation::set("b", LeafData::raw("2")));
        apply(&storage, 2, MapMutation::delete("a"));
        let root = apply(&storage, 3, MapMutation::delete("b"));
        assert_eq!(root, default_leaf_values()[0]);
    }

    #[test]
    fn single_key_root_is_leaf_folded_to_top() {
        let storage = InMemoryStorage::new();
        let root = apply(&storage, 0, MapMutation::set("foo", LeafData::raw("bar")));
        let expected = calc_node_hash(&MapNode::leaf(leaf_hash(b"bar"), BPath::from_key(b"foo")), 0);
        assert_eq!(root, expected);
    }

    #[test]
    fn no_op_still_writes_next_version_root() {
        let storage = InMemoryStorage::new();
        let r1 = apply(&storage, 0, MapMutation::set("foo", LeafData::raw("bar")));
        let r2 = apply(&storage, 1, MapMutation::delete("missing"));
        assert_eq!(r1, r2);
        let r3 = apply(&storage, 2, MapMutation::set("x", LeafData::raw("y")));
        assert_ne!(r3, r2);
    }
}
