//! Core types for verifiable logs and maps

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::{Result, VdsError};

/// 32-byte hash
pub type Hash32 = [u8; 32];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    #[default]
    Raw,
    Json,
}

/// Content of a log entry or map value.
///
/// Only `leaf_input` is committed to by the Merkle tree; `extra_data` carries
/// the document a JSON leaf input was derived from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafData {
    pub leaf_input: Vec<u8>,
    #[serde(default)]
    pub extra_data: Vec<u8>,
    #[serde(default)]
    pub format: DataFormat,
}

impl LeafData {
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self {
            leaf_input: data.into(),
            extra_data: Vec::new(),
            format: DataFormat::Raw,
        }
    }

    /// JSON document committed by its SHA-256 digest
    pub fn json(document: impl Into<Vec<u8>>) -> Self {
        let extra_data = document.into();
        Self {
            leaf_input: crypto::digest(&extra_data).to_vec(),
            extra_data,
            format: DataFormat::Json,
        }
    }

    /// Serialize `value` to JSON and wrap it with [`LeafData::json`]
    pub fn json_from<T: Serialize>(value: &T) -> Result<Self> {
        let doc = serde_json::to_vec(value).map_err(|e| VdsError::Serialization(e.to_string()))?;
        Ok(Self::json(doc))
    }

    /// Check that `leaf_input` really is the digest of `extra_data`
    pub fn validate_json(&self) -> Result<()> {
        if self.leaf_input != crypto::digest(&self.extra_data) {
            return Err(VdsError::VerificationFailed);
        }
        Ok(())
    }

    pub fn leaf_hash(&self) -> Hash32 {
        crypto::leaf_hash(&self.leaf_input)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    /// A log written by clients
    User,
    /// The mutation log backing a map
    Mutation,
    /// The log of a map's successive tree heads
    TreeHead,
}

impl LogType {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            LogType::User => "user",
            LogType::Mutation => "mutation",
            LogType::TreeHead => "treehead",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogRef {
    pub name: String,
    pub log_type: LogType,
}

impl LogRef {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log_type: LogType::User,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapRef {
    pub name: String,
}

impl MapRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn mutation_log(&self) -> LogRef {
        LogRef {
            name: self.name.clone(),
            log_type: LogType::Mutation,
        }
    }

    pub fn tree_head_log(&self) -> LogRef {
        LogRef {
            name: self.name.clone(),
            log_type: LogType::TreeHead,
        }
    }
}

/// A `(size, root hash)` commitment to a log. Size 0 carries an all-zero hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTreeHead {
    pub tree_size: u64,
    #[serde(with = "hex")]
    pub root_hash: Hash32,
}

/// Root hash of a map version, bound to the mutation log head it was derived from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTreeHead {
    #[serde(with = "hex")]
    pub root_hash: Hash32,
    pub mutation_log: LogTreeHead,
}

impl MapTreeHead {
    pub fn tree_size(&self) -> u64 {
        self.mutation_log.tree_size
    }

    /// The entry this head occupies in the tree-head log
    pub fn to_leaf_data(&self) -> Result<LeafData> {
        LeafData::json_from(self)
    }

    pub fn from_leaf_data(data: &LeafData) -> Result<Self> {
        serde_json::from_slice(&data.extra_data).map_err(|e| VdsError::Serialization(e.to_string()))
    }
}

/// A map tree head together with a tree-head log head proven to contain it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapTreeState {
    pub map_tree_head: MapTreeHead,
    pub tree_head_log_tree_head: LogTreeHead,
}

impl MapTreeState {
    pub fn tree_size(&self) -> u64 {
        self.map_tree_head.tree_size()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Set,
    Delete,
    /// Set only if the current leaf hash equals `previous_leaf_hash`
    Update,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapMutation {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub action: MutationAction,
    pub key: Vec<u8>,
    #[serde(default)]
    pub value: Option<LeafData>,
    #[serde(default)]
    pub previous_leaf_hash: Option<Hash32>,
}

impl MapMutation {
    pub fn set(key: impl Into<Vec<u8>>, value: LeafData) -> Self {
        Self {
            timestamp: None,
            action: MutationAction::Set,
            key: key.into(),
            value: Some(value),
            previous_leaf_hash: None,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: None,
            action: MutationAction::Delete,
            key: key.into(),
            value: None,
            previous_leaf_hash: None,
        }
    }

    pub fn update(key: impl Into<Vec<u8>>, value: LeafData, previous_leaf_hash: Hash32) -> Self {
        Self {
            timestamp: None,
            action: MutationAction::Update,
            key: key.into(),
            value: Some(value),
            previous_leaf_hash: Some(previous_leaf_hash),
        }
    }

    /// Leaf input of the value, empty when there is none
    pub fn value_input(&self) -> &[u8] {
        self.value.as_ref().map(|v| v.leaf_input.as_slice()).unwrap_or_default()
    }

    /// The entry this mutation occupies in the mutation log
    pub fn to_leaf_data(&self) -> Result<LeafData> {
        LeafData::json_from(self)
    }

    pub fn from_leaf_data(data: &LeafData) -> Result<Self> {
        serde_json::from_slice(&data.extra_data).map_err(|e| VdsError::Serialization(e.to_string()))
    }
}

/// A unit of work applied by a [`crate::Mutator`] to one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    LogAddEntry { log: LogRef, value: LeafData },
}

/// How an inclusion proof request names its leaf
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafLocator {
    Index(u64),
    LeafHash(Hash32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInclusionProof {
    pub leaf_index: u64,
    pub tree_size: u64,
    pub audit_path: Vec<Hash32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConsistencyProof {
    pub from_size: u64,
    pub tree_size: u64,
    pub audit_path: Vec<Hash32>,
}

/// Sibling hashes from the root (index 0) down to the leaf (index 255).
/// `None` stands for the default hash of an empty subtree at that depth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInclusionProof {
    pub tree_size: u64,
    pub audit_path: Vec<Option<Hash32>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGetValueResponse {
    /// Empty leaf data when the key is absent
    pub value: LeafData,
    pub proof: MapInclusionProof,
}
