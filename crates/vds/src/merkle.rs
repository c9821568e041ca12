//! Index arithmetic over RFC6962 trees and hashing of map nodes

use crate::crypto::{default_leaf_values, node_hash, MAP_DEPTH};
use crate::records::MapNode;
use crate::types::Hash32;

/// Largest power of two strictly less than `n` (1 for `n <= 2`).
pub fn calc_k(n: u64) -> u64 {
    let mut k = 1u64;
    while (k << 1) < n {
        k <<= 1;
    }
    k
}

pub fn is_pow2(n: u64) -> bool {
    calc_k(n + 1) == n
}

/// Subtree ranges whose hashes form the audit path of leaf `m` within
/// `[start, end)`, ordered leaf-up.
pub fn path(m: u64, start: u64, end: u64) -> Vec<(u64, u64)> {
    let n = end - start;
    if n == 1 {
        return Vec::new();
    }
    let k = calc_k(n);
    if m < k {
        let mut rv = path(m, start, start + k);
        rv.push((start + k, end));
        rv
    } else {
        let mut rv = path(m - k, start + k, end);
        rv.push((start, start + k));
        rv
    }
}

/// Subtree ranges proving the first `m` leaves of `[start, end)` are a prefix
/// of it. `b` is true while the left edge is still the old tree itself.
pub fn sub_proof(m: u64, start: u64, end: u64, b: bool) -> Vec<(u64, u64)> {
    let n = end - start;
    if m == n {
        return if b { Vec::new() } else { vec![(start, end)] };
    }
    let k = calc_k(n);
    if m <= k {
        let mut rv = sub_proof(m, start, start + k, b);
        rv.push((start + k, end));
        rv
    } else {
        let mut rv = sub_proof(m - k, start + k, end, false);
        rv.push((start, start + k));
        rv
    }
}

/// Complete subtrees, left to right, that the next leaf at index `start`
/// combines with when it is appended.
pub fn create_needed_stack(start: u64) -> Vec<(u64, u64)> {
    let mut rv = path(start, 0, start + 1);
    rv.reverse();
    rv
}

/// Hash of the subtree rooted at `node`, which sits `depth` levels below the map root.
///
/// A leaf stored above the bottom stands for a chain of single-child nodes,
/// so its hash is folded up against default siblings along its path.
pub fn calc_node_hash(node: &MapNode, depth: usize) -> Hash32 {
    let defaults = default_leaf_values();
    if let Some(leaf) = node.leaf_hash {
        let mut rv = leaf;
        for i in (depth..MAP_DEPTH).rev() {
            rv = if node.path.at(i) {
                node_hash(&defaults[i + 1], &rv)
            } else {
                node_hash(&rv, &defaults[i + 1])
            };
        }
        return rv;
    }

    let child = |number: u64, hash: &Option<Hash32>| match (number, hash) {
        (0, _) | (_, None) => defaults[depth + 1],
        (_, Some(h)) => *h,
    };
    node_hash(
        &child(node.left_number, &node.left_hash),
        &child(node.right_number, &node.right_hash),
    )
}
