//! Verifiable Data Structures
//!
//! Append-only Merkle logs and versioned sparse Merkle maps over a pluggable
//! transactional key-value store, with proofs that clients check independently.

mod audit;
mod bpath;
mod client;
mod crypto;
mod log;
mod map;
mod merkle;
mod mutator;
mod records;
mod service;
mod storage;
mod types;
mod verify;

pub use bpath::BPath;
pub use client::{VerifiableLog, VerifiableMap};
pub use crypto::{default_leaf_values, leaf_hash, node_hash, null_leaf_hash, MAP_DEPTH};
pub use log::{add_entry_to_log, apply_mutation};
pub use map::set_map_value;
pub use merkle::{calc_k, calc_node_hash, create_needed_stack, is_pow2, path, sub_proof};
pub use mutator::{BatchMutator, BatchMutatorConfig, InstantMutator, Mutator};
pub use records::{MapNode, ObjectSize};
pub use service::{LocalService, Namespace};
pub use storage::{InMemoryStorage, KeyReader, KeyWriter, StagedWriter, StorageReader, StorageWriter};
pub use types::{
    DataFormat, Hash32, LeafData, LeafLocator, LogConsistencyProof, LogInclusionProof, LogRef,
    LogTreeHead, LogType, MapGetValueResponse, MapInclusionProof, MapMutation, MapRef,
    MapTreeHead, MapTreeState, Mutation, MutationAction,
};
pub use verify::{
    verify_log_consistency_proof, verify_log_inclusion_proof, verify_map_inclusion_proof,
    LogStackVerifier,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VdsError {
    /// A storage lookup missed. Engines propagate it; the service reports `NotFound`.
    #[error("No such key")]
    NoSuchKey,

    #[error("Can't find log/map/entry")]
    NotFound,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid tree range")]
    InvalidTreeRange,

    #[error("Failed to verify")]
    VerificationFailed,

    #[error("Unauthorized request")]
    NotAuthorized,

    #[error("Not implemented")]
    NotImplemented,

    #[error("Not all entries were returned")]
    NotAllEntriesReturned,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, VdsError>;
