//! Service over storage and a mutator
//!
//! Writes are queued on the mutator and acknowledged with the leaf hash of the
//! queued entry. Reads run in a read-only transaction of the object's namespace.
//! A requested size of `0` always means the current head.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bpath::BPath;
use crate::crypto::{self, default_leaf_values, null_leaf_hash};
use crate::log::{calc_sub_tree_hash, fetch_sub_tree_hashes};
use crate::map::descend_to_fork;
use crate::merkle::{calc_node_hash, is_pow2, path, sub_proof};
use crate::mutator::Mutator;
use crate::records;
use crate::storage::{KeyReader, StorageReader};
use crate::types::{
    Hash32, LeafData, LeafLocator, LogConsistencyProof, LogInclusionProof, LogRef, LogTreeHead,
    LogType, MapGetValueResponse, MapInclusionProof, MapMutation, MapRef, MapTreeHead, Mutation,
    MutationAction,
};
use crate::{Result, VdsError};

/// Entries fetched per read transaction when streaming a log
const ENTRIES_BATCH: u64 = 500;

/// Storage namespace of a log or map: SHA-256 over its kind and name.
///
/// A map's mutation and tree-head logs share the map's namespace so a single
/// transaction updates all three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Namespace(Hash32);

impl Namespace {
    pub fn for_log(log: &LogRef) -> Self {
        match log.log_type {
            LogType::User => Self(crypto::digest(format!("log/{}", log.name).as_bytes())),
            LogType::Mutation | LogType::TreeHead => Self::for_map(&MapRef::new(log.name.clone())),
        }
    }

    pub fn for_map(map: &MapRef) -> Self {
        Self(crypto::digest(format!("map/{}", map.name).as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Maps a storage miss to a client-facing not-found
fn not_found(e: VdsError) -> VdsError {
    match e {
        VdsError::NoSuchKey => VdsError::NotFound,
        other => other,
    }
}

/// Hashes for `ranges`, recomputing any range that is not a complete subtree
fn proof_hashes<R: KeyReader + ?Sized>(kr: &R, lt: LogType, ranges: &[(u64, u64)]) -> Result<Vec<Hash32>> {
    let fetched = fetch_sub_tree_hashes(kr, lt, ranges, false)?;
    ranges
        .iter()
        .zip(fetched)
        .map(|(&(start, end), h)| match h {
            Some(h) => Ok(h),
            None if is_pow2(end - start) => Err(VdsError::NotFound),
            None => calc_sub_tree_hash(kr, lt, start, end),
        })
        .collect()
}

pub struct LocalService<S> {
    storage: Arc<S>,
    mutator: Arc<dyn Mutator>,
}

impl<S> Clone for LocalService<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            mutator: self.mutator.clone(),
        }
    }
}

impl<S: StorageReader + 'static> LocalService<S> {
    pub fn new(storage: Arc<S>, mutator: Arc<dyn Mutator>) -> Self {
        Self { storage, mutator }
    }

    pub fn mutator(&self) -> &Arc<dyn Mutator> {
        &self.mutator
    }

    /// Queue `value` for appending to a user log. Returns its leaf hash.
    pub async fn log_add_entry(&self, log: &LogRef, value: LeafData) -> Result<Hash32> {
        if log.log_type != LogType::User {
            return Err(VdsError::InvalidRequest("only user logs accept entries".into()));
        }
        let leaf_hash = value.leaf_hash();
        self.mutator
            .queue_mutation(
                Namespace::for_log(log).as_bytes(),
                Mutation::LogAddEntry {
                    log: log.clone(),
                    value,
                },
            )
            .await?;
        debug!(log = %log.name, leaf = %hex::encode(leaf_hash), "queued log entry");
        Ok(leaf_hash)
    }

    /// Queue a map mutation. Returns the leaf hash of its mutation log entry.
    ///
    /// The mutation is stamped with the current time so repeated identical
    /// requests are recorded as distinct entries.
    pub async fn map_set_value(&self, map: &MapRef, mut mutation: MapMutation) -> Result<Hash32> {
        if mutation.action == MutationAction::Unknown {
            return Err(VdsError::NotImplemented);
        }
        mutation.timestamp = Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
        let entry = mutation.to_leaf_data()?;
        let leaf_hash = entry.leaf_hash();
        self.mutator
            .queue_mutation(
                Namespace::for_map(map).as_bytes(),
                Mutation::LogAddEntry {
                    log: map.mutation_log(),
                    value: entry,
                },
            )
            .await?;
        debug!(map = %map.name, leaf = %hex::encode(leaf_hash), "queued map mutation");
        Ok(leaf_hash)
    }

    pub fn log_tree_hash(&self, log: &LogRef, tree_size: u64) -> Result<LogTreeHead> {
        self.storage
            .execute_read_only(Namespace::for_log(log).as_bytes(), |kr| {
                let head = records::lookup_log_tree_head(kr, log.log_type)?;
                if tree_size == 0 || tree_size == head.tree_size {
                    return Ok(head);
                }
                if tree_size > head.tree_size {
                    return Err(VdsError::InvalidTreeRange);
                }
                let th = records::lookup_log_root_hash_by_size(kr, log.log_type, tree_size)?;
                Ok(LogTreeHead {
                    tree_size,
                    root_hash: th.mth,
                })
            })
            .map_err(not_found)
    }

    pub fn log_inclusion_proof(&self, log: &LogRef, tree_size: u64, leaf: LeafLocator) -> Result<LogInclusionProof> {
        self.storage
            .execute_read_only(Namespace::for_log(log).as_bytes(), |kr| {
                let head = records::lookup_log_tree_head(kr, log.log_type)?;
                let tree_size = if tree_size == 0 { head.tree_size } else { tree_size };
                if tree_size > head.tree_size {
                    return Err(VdsError::InvalidTreeRange);
                }

                let leaf_index = match leaf {
                    LeafLocator::Index(i) => i,
                    LeafLocator::LeafHash(h) => records::lookup_index_by_leaf_hash(kr, log.log_type, &h)?.index,
                };
                if leaf_index >= head.tree_size {
                    return Err(VdsError::NotFound);
                }
                if leaf_index >= tree_size {
                    return Err(VdsError::InvalidTreeRange);
                }

                let audit_path = proof_hashes(kr, log.log_type, &path(leaf_index, 0, tree_size))?;
                Ok(LogInclusionProof {
                    leaf_index,
                    tree_size,
                    audit_path,
                })
            })
            .map_err(not_found)
    }

    pub fn log_consistency_proof(&self, log: &LogRef, from_size: u64, tree_size: u64) -> Result<LogConsistencyProof> {
        if from_size == 0 {
            return Err(VdsError::InvalidTreeRange);
        }
        self.storage
            .execute_read_only(Namespace::for_log(log).as_bytes(), |kr| {
                let head = records::lookup_log_tree_head(kr, log.log_type)?;
                let second = if tree_size == 0 { head.tree_size } else { tree_size };
                if second == 0 || second > head.tree_size || from_size >= second {
                    return Err(VdsError::InvalidTreeRange);
                }

                let audit_path = proof_hashes(kr, log.log_type, &sub_proof(from_size, 0, second, true))?;
                Ok(LogConsistencyProof {
                    from_size,
                    tree_size: second,
                    audit_path,
                })
            })
            .map_err(not_found)
    }

    /// Entries `[first, last)`; `last == 0` means up to the head
    pub fn log_fetch_entries(&self, log: &LogRef, first: u64, last: u64) -> Result<Vec<LeafData>> {
        self.storage
            .execute_read_only(Namespace::for_log(log).as_bytes(), |kr| {
                let head = records::lookup_log_tree_head(kr, log.log_type)?;
                let last = if last == 0 { head.tree_size } else { last };
                if last > head.tree_size || first >= last {
                    return Err(VdsError::InvalidTreeRange);
                }
                records::lookup_log_entry_hashes(kr, log.log_type, first, last)?
                    .iter()
                    .map(|h| records::lookup_data_by_leaf_hash(kr, log.log_type, h))
                    .collect::<Result<Vec<_>>>()
            })
            .map_err(not_found)
    }

    /// Stream entries `[start, end)` in batches until done, cancelled or the
    /// receiver is dropped. A fetch error is sent down the channel and ends
    /// the stream.
    pub fn log_entries(
        &self,
        log: &LogRef,
        start: u64,
        end: u64,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<LeafData>> {
        let (tx, rx) = mpsc::channel(ENTRIES_BATCH as usize);
        let svc = self.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let mut next = start;
            while next < end {
                let last = end.min(next.saturating_add(ENTRIES_BATCH));
                let fetch = {
                    let svc = svc.clone();
                    let log = log.clone();
                    tokio::task::spawn_blocking(move || svc.log_fetch_entries(&log, next, last))
                };
                let batch = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    res = fetch => res.unwrap_or_else(|e| Err(VdsError::Storage(e.to_string()))),
                };
                let entries = match batch {
                    Ok(entries) => entries,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for entry in entries {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = tx.send(Ok(entry)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                next = last;
            }
        });
        rx
    }

    pub fn map_tree_hash(&self, map: &MapRef, tree_size: u64) -> Result<MapTreeHead> {
        self.storage
            .execute_read_only(Namespace::for_map(map).as_bytes(), |kr| {
                let head = records::lookup_log_tree_head(kr, LogType::TreeHead)?;
                let tree_size = if tree_size == 0 { head.tree_size } else { tree_size };
                if tree_size > head.tree_size {
                    return Err(VdsError::InvalidTreeRange);
                }
                if tree_size == 0 {
                    return Ok(MapTreeHead {
                        root_hash: default_leaf_values()[0],
                        mutation_log: LogTreeHead::default(),
                    });
                }

                let mutation_root = records::lookup_log_root_hash_by_size(kr, LogType::Mutation, tree_size)?;
                let root = records::lookup_map_node(kr, tree_size, &BPath::empty())?;
                Ok(MapTreeHead {
                    root_hash: calc_node_hash(&root, 0),
                    mutation_log: LogTreeHead {
                        tree_size,
                        root_hash: mutation_root.mth,
                    },
                })
            })
            .map_err(not_found)
    }

    /// Value of `key` at map version `tree_size`, with a proof of inclusion
    /// (or of absence, when the value comes back empty).
    pub fn map_get_value(&self, map: &MapRef, key: &[u8], tree_size: u64) -> Result<MapGetValueResponse> {
        self.storage
            .execute_read_only(Namespace::for_map(map).as_bytes(), |kr| {
                let key_path = BPath::from_key(key);
                let head = records::lookup_log_tree_head(kr, LogType::TreeHead)?;
                let tree_size = if tree_size == 0 { head.tree_size } else { tree_size };
                if tree_size > head.tree_size {
                    return Err(VdsError::InvalidTreeRange);
                }

                let root = records::lookup_map_node(kr, tree_size, &BPath::empty())?;
                let (cur, ancestors) = descend_to_fork(kr, &key_path, root)?;

                let mut audit_path: Vec<Option<Hash32>> = vec![None; key_path.len()];
                for (i, anc) in ancestors.iter().enumerate() {
                    audit_path[i] = if key_path.at(i) { anc.left_hash } else { anc.right_hash };
                }
                let mut ptr = ancestors.len();

                let value = match cur.leaf_hash {
                    None => {
                        audit_path[ptr] = if key_path.at(ptr) { cur.left_hash } else { cur.right_hash };
                        LeafData::default()
                    }
                    Some(lh) if cur.path == key_path => {
                        if lh == null_leaf_hash() {
                            LeafData::default()
                        } else {
                            records::lookup_data_by_leaf_hash(kr, LogType::Mutation, &lh)?
                        }
                    }
                    Some(_) => {
                        while key_path.at(ptr) == cur.path.at(ptr) {
                            ptr += 1;
                        }
                        audit_path[ptr] = Some(calc_node_hash(&cur, ptr + 1));
                        LeafData::default()
                    }
                };

                Ok(MapGetValueResponse {
                    value,
                    proof: MapInclusionProof { tree_size, audit_path },
                })
            })
            .map_err(not_found)
    }
}
