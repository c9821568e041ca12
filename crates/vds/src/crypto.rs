//! Domain-separated Merkle tree hashing (RFC6962 prefixes)

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

use crate::Hash32;

const DOMAIN_LEAF: u8 = 0x00;
const DOMAIN_INTERNAL: u8 = 0x01;

/// Number of levels in the sparse map tree.
pub const MAP_DEPTH: usize = 256;

/// Plain SHA-256, used for key paths and JSON leaf inputs
pub fn digest(data: &[u8]) -> Hash32 {
    Sha256::digest(data).into()
}

/// leaf = H(0x00 || data)
pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update([DOMAIN_LEAF]);
    h.update(data);
    h.finalize().into()
}

/// node = H(0x01 || left || right)
pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut h = Sha256::new();
    h.update([DOMAIN_INTERNAL]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Canonical hash of an absent (or deleted) map value
pub fn null_leaf_hash() -> Hash32 {
    default_leaf_values()[MAP_DEPTH]
}

/// Hashes of empty subtrees, indexed by depth: entry 256 is an empty leaf,
/// entry 0 an entirely empty map.
pub fn default_leaf_values() -> &'static [Hash32; MAP_DEPTH + 1] {
    static DEFAULTS: OnceLock<[Hash32; MAP_DEPTH + 1]> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        let mut defaults = [[0u8; 32]; MAP_DEPTH + 1];
        defaults[MAP_DEPTH] = leaf_hash(&[]);
        for depth in (0..MAP_DEPTH).rev() {
            defaults[depth] = node_hash(&defaults[depth + 1], &defaults[depth + 1]);
        }
        defaults
    })
}
