//! Proof verification
//!
//! Pure functions of a proof, the claimed leaf and the trusted tree heads.
//! Nothing here touches storage.

use crate::bpath::BPath;
use crate::crypto::{default_leaf_values, leaf_hash, node_hash, MAP_DEPTH};
use crate::merkle::is_pow2;
use crate::types::{Hash32, LogConsistencyProof, LogInclusionProof, LogTreeHead, MapGetValueResponse, MapTreeHead};
use crate::{Result, VdsError};

fn check(cond: bool) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(VdsError::VerificationFailed)
    }
}

/// Check that `leaf_hash` sits at `proof.leaf_index` of the log committed to by `head`.
pub fn verify_log_inclusion_proof(proof: &LogInclusionProof, leaf_hash: &Hash32, head: &LogTreeHead) -> Result<()> {
    check(proof.tree_size == head.tree_size)?;
    check(proof.leaf_index < proof.tree_size)?;

    let (mut fn_, mut sn) = (proof.leaf_index, proof.tree_size - 1);
    let mut r = *leaf_hash;
    for p in &proof.audit_path {
        if fn_ == sn || fn_ & 1 == 1 {
            r = node_hash(p, &r);
            while !(fn_ == 0 || fn_ & 1 == 1) {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            r = node_hash(&r, p);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    check(sn == 0)?;
    check(r == head.root_hash)
}

/// Check that the log committed to by `first` is a prefix of the one committed to by `second`.
pub fn verify_log_consistency_proof(proof: &LogConsistencyProof, first: &LogTreeHead, second: &LogTreeHead) -> Result<()> {
    check(first.tree_size == proof.from_size)?;
    check(second.tree_size == proof.tree_size)?;
    check(proof.from_size >= 1)?;
    check(proof.from_size < second.tree_size)?;

    let mut path = Vec::with_capacity(proof.audit_path.len() + 1);
    if is_pow2(proof.from_size) {
        path.push(first.root_hash);
    }
    path.extend_from_slice(&proof.audit_path);

    let (mut fn_, mut sn) = (proof.from_size - 1, second.tree_size - 1);
    while fn_ & 1 == 1 {
        fn_ >>= 1;
        sn >>= 1;
    }

    let (first_hash, rest) = path.split_first().ok_or(VdsError::VerificationFailed)?;
    let (mut fr, mut sr) = (*first_hash, *first_hash);
    for c in rest {
        check(sn != 0)?;
        if fn_ & 1 == 1 || fn_ == sn {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            while !(fn_ == 0 || fn_ & 1 == 1) {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    check(sn == 0)?;
    check(fr == first.root_hash)?;
    check(sr == second.root_hash)
}

/// Check that `response.value` is the value of `key` in the map version committed to by `head`.
/// An empty value proves the key absent.
pub fn verify_map_inclusion_proof(response: &MapGetValueResponse, key: &[u8], head: &MapTreeHead) -> Result<()> {
    let proof = &response.proof;
    check(proof.tree_size == head.tree_size())?;
    check(proof.audit_path.len() == MAP_DEPTH)?;

    let defaults = default_leaf_values();
    let key_path = BPath::from_key(key);
    let mut t = leaf_hash(&response.value.leaf_input);
    for i in (0..MAP_DEPTH).rev() {
        let p = proof.audit_path[i].unwrap_or(defaults[i + 1]);
        t = if key_path.at(i) {
            node_hash(&p, &t)
        } else {
            node_hash(&t, &p)
        };
    }
    check(t == head.root_hash)
}

/// Recomputes a log's root hash from its leaf hashes in order, one at a time,
/// holding only the roots of the complete subtrees seen so far.
#[derive(Clone, Debug, Default)]
pub struct LogStackVerifier {
    stack: Vec<Hash32>,
    size: u64,
}

impl LogStackVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a log of `size` leaves given its complete subtree
    /// roots, left to right.
    pub fn resume(size: u64, stack: Vec<Hash32>) -> Self {
        Self { stack, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn push(&mut self, leaf_hash: Hash32) {
        self.stack.push(leaf_hash);
        let mut z = self.size;
        while z & 1 == 1 {
            if let (Some(right), Some(left)) = (self.stack.pop(), self.stack.pop()) {
                self.stack.push(node_hash(&left, &right));
            }
            z >>= 1;
        }
        self.size += 1;
    }

    /// Root of the leaves pushed so far; `None` while empty
    pub fn root(&self) -> Option<Hash32> {
        let (last, rest) = self.stack.split_last()?;
        Some(rest.iter().rev().fold(*last, |acc, h| node_hash(h, &acc)))
    }

    /// The head for the leaves pushed so far, comparable with a served head
    pub fn head(&self) -> LogTreeHead {
        LogTreeHead {
            tree_size: self.size,
            root_hash: self.root().unwrap_or_default(),
        }
    }
}
