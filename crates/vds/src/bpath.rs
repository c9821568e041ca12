//! Length-prefixed bit strings addressing nodes of the sparse map tree

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, MAP_DEPTH};

/// A path of 0..=256 bits, most significant bit first.
///
/// Encoded as a length byte followed by the packed bits. An empty buffer is the
/// zero-length path; a length byte of `0` on a non-empty buffer means 256.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BPath(Vec<u8>);

impl BPath {
    /// The zero-length path
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A single-bit path
    pub fn bit(value: bool) -> Self {
        Self(vec![1, if value { 0x80 } else { 0 }])
    }

    /// Path of a map key: the 256 bits of SHA-256(key)
    pub fn from_key(key: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(33);
        buf.push(0);
        buf.extend_from_slice(&crypto::digest(key));
        Self(buf)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        match self.0.first() {
            None => 0,
            Some(0) => MAP_DEPTH,
            Some(&l) => l as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bit at `idx`; positions past the end read as `false`.
    pub fn at(&self, idx: usize) -> bool {
        if idx >= self.len() {
            return false;
        }
        (self.0[1 + idx / 8] >> (7 - idx % 8)) & 1 == 1
    }

    /// Bits `[start, end)` as a new path
    pub fn slice(&self, start: usize, end: usize) -> Self {
        if end <= start {
            return Self::empty();
        }
        let mut out = Self::with_len(end - start);
        for (j, i) in (start..end).enumerate() {
            if self.at(i) {
                out.set(j);
            }
        }
        out
    }

    /// Concatenation of two paths
    pub fn join(a: &BPath, b: &BPath) -> Self {
        let (la, lb) = (a.len(), b.len());
        if la + lb == 0 {
            return Self::empty();
        }
        let mut out = Self::with_len(la + lb);
        for i in 0..la {
            if a.at(i) {
                out.set(i);
            }
        }
        for i in 0..lb {
            if b.at(i) {
                out.set(la + i);
            }
        }
        out
    }

    fn with_len(len: usize) -> Self {
        let mut buf = vec![0u8; 1 + 1 + (len - 1) / 8];
        buf[0] = if len == MAP_DEPTH { 0 } else { len as u8 };
        Self(buf)
    }

    fn set(&mut self, idx: usize) {
        self.0[1 + idx / 8] |= 1 << (7 - idx % 8);
    }
}

impl fmt::Display for BPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len() {
            f.write_str(if self.at(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BPath({self})")
    }
}
