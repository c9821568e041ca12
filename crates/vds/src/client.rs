//! Verifying clients for logs and maps
//!
//! These never trust a served head on its own: every head handed back has been
//! proven consistent with the previous one the caller supplied.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit::MapReplay;
use crate::crypto::node_hash;
use crate::service::LocalService;
use crate::storage::StorageReader;
use crate::types::{
    Hash32, LeafData, LeafLocator, LogConsistencyProof, LogInclusionProof, LogRef, LogTreeHead,
    MapGetValueResponse, MapMutation, MapRef, MapTreeHead, MapTreeState,
};
use crate::verify::{verify_log_consistency_proof, verify_log_inclusion_proof, verify_map_inclusion_proof, LogStackVerifier};
use crate::{Result, VdsError};

const POLL_START: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_secs(2);

pub struct VerifiableLog<S> {
    service: LocalService<S>,
    log: LogRef,
}

impl<S> Clone for VerifiableLog<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            log: self.log.clone(),
        }
    }
}

impl<S: StorageReader + 'static> VerifiableLog<S> {
    pub fn new(service: LocalService<S>, log: LogRef) -> Self {
        Self { service, log }
    }

    pub fn log_ref(&self) -> &LogRef {
        &self.log
    }

    pub async fn add(&self, value: LeafData) -> Result<Hash32> {
        self.service.log_add_entry(&self.log, value).await
    }

    /// Head at `tree_size`, unverified. `0` is the latest.
    pub fn tree_head(&self, tree_size: u64) -> Result<LogTreeHead> {
        self.service.log_tree_hash(&self.log, tree_size)
    }

    pub fn inclusion_proof(&self, tree_size: u64, leaf_hash: &Hash32) -> Result<LogInclusionProof> {
        self.service
            .log_inclusion_proof(&self.log, tree_size, LeafLocator::LeafHash(*leaf_hash))
    }

    pub fn inclusion_proof_by_index(&self, tree_size: u64, leaf_index: u64) -> Result<LogInclusionProof> {
        self.service
            .log_inclusion_proof(&self.log, tree_size, LeafLocator::Index(leaf_index))
    }

    pub fn consistency_proof(&self, first: u64, second: u64) -> Result<LogConsistencyProof> {
        self.service.log_consistency_proof(&self.log, first, second)
    }

    pub fn entry(&self, index: u64) -> Result<LeafData> {
        self.service
            .log_fetch_entries(&self.log, index, index + 1)?
            .pop()
            .ok_or(VdsError::NotFound)
    }

    /// Fetch and check a proof that `leaf_hash` is in the log committed to by `head`.
    pub fn verify_inclusion(&self, head: &LogTreeHead, leaf_hash: &Hash32) -> Result<()> {
        let proof = self.inclusion_proof(head.tree_size, leaf_hash)?;
        verify_log_inclusion_proof(&proof, leaf_hash, head)
    }

    /// Check two heads describe the same log. They may come in either order.
    pub fn verify_consistency(&self, a: &LogTreeHead, b: &LogTreeHead) -> Result<()> {
        if a.tree_size == 0 || b.tree_size == 0 {
            return Err(VdsError::VerificationFailed);
        }
        if a.tree_size == b.tree_size {
            return if a.root_hash == b.root_hash {
                Ok(())
            } else {
                Err(VdsError::VerificationFailed)
            };
        }

        let (a, b) = if a.tree_size > b.tree_size { (b, a) } else { (a, b) };
        let proof = self.consistency_proof(a.tree_size, b.tree_size)?;
        verify_log_consistency_proof(&proof, a, b)
    }

    /// Head at `tree_size`, proven consistent with `prev` when one is given.
    pub fn verified_tree_head(&self, prev: Option<&LogTreeHead>, tree_size: u64) -> Result<LogTreeHead> {
        if let Some(p) = prev {
            if tree_size != 0 && p.tree_size == tree_size {
                return Ok(p.clone());
            }
        }

        let head = self.tree_head(tree_size)?;
        if let Some(p) = prev {
            if p.tree_size != 0 && head.tree_size != 0 {
                self.verify_consistency(p, &head)?;
            } else if head.tree_size < p.tree_size {
                return Err(VdsError::VerificationFailed);
            }
        }
        Ok(head)
    }

    /// Latest head, consistent with `prev`. Never goes backwards: an older
    /// (but consistent) head yields `prev` back.
    pub fn verified_latest_tree_head(&self, prev: Option<&LogTreeHead>) -> Result<LogTreeHead> {
        let head = self.verified_tree_head(prev, 0)?;
        match prev {
            Some(p) if head.tree_size <= p.tree_size => Ok(p.clone()),
            _ => Ok(head),
        }
    }

    /// Verify a proof obtained elsewhere, fetching the head it was made
    /// against and proving that head consistent with `prev`.
    pub fn verify_supplied_inclusion_proof(
        &self,
        prev: Option<&LogTreeHead>,
        proof: &LogInclusionProof,
        leaf_hash: &Hash32,
    ) -> Result<LogTreeHead> {
        let head = self.verified_tree_head(prev, proof.tree_size)?;
        verify_log_inclusion_proof(proof, leaf_hash, &head)?;
        Ok(head)
    }

    /// Wait until `leaf_hash` is included in a served head, then return that head.
    pub async fn block_until_present(&self, leaf_hash: &Hash32) -> Result<LogTreeHead> {
        let mut last_size = None;
        let mut delay = POLL_START;
        loop {
            self.service.mutator().flush().await?;
            let head = self.tree_head(0)?;
            if last_size != Some(head.tree_size) {
                last_size = Some(head.tree_size);
                match self.verify_inclusion(&head, leaf_hash) {
                    Ok(()) => return Ok(head),
                    Err(VdsError::NotFound) => {}
                    Err(e) => return Err(e),
                }
                delay = POLL_START;
            } else {
                delay = (delay * 2).min(POLL_MAX);
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch every entry between `prev` and `head`, pass each to `audit` and
    /// check that together with `prev` they hash to `head`.
    pub async fn verify_entries<F>(&self, prev: Option<&LogTreeHead>, head: &LogTreeHead, mut audit: F) -> Result<()>
    where
        F: FnMut(u64, &LeafData) -> Result<()>,
    {
        if head.tree_size == 0 {
            return Ok(());
        }
        if let Some(p) = prev {
            if head.tree_size <= p.tree_size {
                return Ok(());
            }
        }

        let mut verifier = LogStackVerifier::new();
        if let Some(p) = prev.filter(|p| p.tree_size > 0) {
            // The audit path of the next leaf holds exactly the complete
            // subtrees of the previous head.
            let proof = self.inclusion_proof_by_index(p.tree_size + 1, p.tree_size)?;
            let (first, rest) = proof.audit_path.split_first().ok_or(VdsError::VerificationFailed)?;
            let root = rest.iter().fold(*first, |acc, h| node_hash(h, &acc));
            if root != p.root_hash {
                return Err(VdsError::VerificationFailed);
            }
            verifier = LogStackVerifier::resume(p.tree_size, proof.audit_path.iter().rev().copied().collect());
        }

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let mut entries = self
            .service
            .log_entries(&self.log, verifier.size(), head.tree_size, cancel);
        while let Some(entry) = entries.recv().await {
            let entry = entry?;
            audit(verifier.size(), &entry)?;
            verifier.push(entry.leaf_hash());
        }

        if verifier.size() != head.tree_size {
            return Err(VdsError::NotAllEntriesReturned);
        }
        if verifier.root() != Some(head.root_hash) {
            return Err(VdsError::VerificationFailed);
        }
        debug!(log = %self.log.name, size = head.tree_size, "verified log entries");
        Ok(())
    }
}

pub struct VerifiableMap<S> {
    service: LocalService<S>,
    map: MapRef,
}

impl<S> Clone for VerifiableMap<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            map: self.map.clone(),
        }
    }
}

impl<S: StorageReader + 'static> VerifiableMap<S> {
    pub fn new(service: LocalService<S>, map: MapRef) -> Self {
        Self { service, map }
    }

    /// The log of every mutation applied to this map
    pub fn mutation_log(&self) -> VerifiableLog<S> {
        VerifiableLog::new(self.service.clone(), self.map.mutation_log())
    }

    /// The log of this map's successive tree heads
    pub fn tree_head_log(&self) -> VerifiableLog<S> {
        VerifiableLog::new(self.service.clone(), self.map.tree_head_log())
    }

    pub async fn set(&self, key: impl Into<Vec<u8>>, value: LeafData) -> Result<Hash32> {
        self.service.map_set_value(&self.map, MapMutation::set(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<Hash32> {
        self.service.map_set_value(&self.map, MapMutation::delete(key)).await
    }

    /// Set `key` only if its current leaf hash is `previous_leaf_hash`
    pub async fn update(&self, key: impl Into<Vec<u8>>, value: LeafData, previous_leaf_hash: Hash32) -> Result<Hash32> {
        self.service
            .map_set_value(&self.map, MapMutation::update(key, value, previous_leaf_hash))
            .await
    }

    pub fn tree_head(&self, tree_size: u64) -> Result<MapTreeHead> {
        self.service.map_tree_hash(&self.map, tree_size)
    }

    pub fn get(&self, key: &[u8], tree_size: u64) -> Result<MapGetValueResponse> {
        self.service.map_get_value(&self.map, key, tree_size)
    }

    /// Value of `key` in the map version of `state`, checked against its root
    pub fn verified_get(&self, key: &[u8], state: &MapTreeState) -> Result<LeafData> {
        let response = self.get(key, state.tree_size())?;
        verify_map_inclusion_proof(&response, key, &state.map_tree_head)?;
        Ok(response.value)
    }

    /// Map head at `tree_size` together with a tree-head log head proven to
    /// contain it, both consistent with `prev`. `None` while the map is empty
    /// and there is no previous state.
    pub fn verified_map_state(&self, prev: Option<&MapTreeState>, tree_size: u64) -> Result<Option<MapTreeState>> {
        if let Some(p) = prev {
            if tree_size != 0 && p.tree_size() == tree_size {
                return Ok(Some(p.clone()));
            }
        }

        let map_head = self.tree_head(tree_size)?;
        if prev.is_none() && map_head.tree_size() == 0 {
            return Ok(None);
        }

        let mutation_log = self.mutation_log();
        if let Some(p) = prev {
            mutation_log.verify_consistency(&p.map_tree_head.mutation_log, &map_head.mutation_log)?;
        }

        let tree_head_log = self.tree_head_log();
        let leaf_hash = map_head.to_leaf_data()?.leaf_hash();
        let prev_thl = prev.map(|p| &p.tree_head_log_tree_head);

        if let Some(thl) = prev_thl.filter(|h| h.tree_size >= map_head.tree_size()) {
            if tree_head_log.verify_inclusion(thl, &leaf_hash).is_ok() {
                return Ok(Some(MapTreeState {
                    map_tree_head: map_head,
                    tree_head_log_tree_head: thl.clone(),
                }));
            }
        }

        let thl = tree_head_log.verified_latest_tree_head(prev_thl)?;
        tree_head_log.verify_inclusion(&thl, &leaf_hash)?;
        Ok(Some(MapTreeState {
            map_tree_head: map_head,
            tree_head_log_tree_head: thl,
        }))
    }

    /// Latest map state, consistent with and never older than `prev`
    pub fn verified_latest_map_state(&self, prev: Option<&MapTreeState>) -> Result<Option<MapTreeState>> {
        let state = self.verified_map_state(prev, 0)?;
        match (prev, state) {
            (Some(p), Some(s)) if s.tree_size() <= p.tree_size() => Ok(Some(p.clone())),
            (_, state) => Ok(state),
        }
    }

    /// Rebuild the map from its whole mutation log and check every tree head
    /// logged between `prev` and `head` against the rebuilt versions.
    ///
    /// `audit` is called with the mutation log index of each mutation that
    /// changed the map root.
    pub async fn verify_map<F>(&self, prev: Option<&MapTreeState>, head: &MapTreeState, mut audit: F) -> Result<()>
    where
        F: FnMut(u64, &MapMutation) -> Result<()>,
    {
        let mut claimed = vec![head.map_tree_head.clone()];
        self.tree_head_log()
            .verify_entries(
                prev.map(|p| &p.tree_head_log_tree_head),
                &head.tree_head_log_tree_head,
                |_, entry| {
                    entry.validate_json()?;
                    claimed.push(MapTreeHead::from_leaf_data(entry)?);
                    Ok(())
                },
            )
            .await?;

        let size = claimed.iter().map(MapTreeHead::tree_size).max().unwrap_or_default();
        let mut replay = MapReplay::new();
        if size > 0 {
            let mutation_log = self.mutation_log();
            let mutation_head = mutation_log.verified_latest_tree_head(Some(&head.map_tree_head.mutation_log))?;
            mutation_log
                .verify_entries(None, &mutation_head, |idx, entry| replay.apply(idx, entry, &mut audit))
                .await?;
        }

        for h in &claimed {
            replay.check(h)?;
        }
        debug!(map = %self.map.name, size, tree_heads = claimed.len(), "verified map");
        Ok(())
    }

    /// Wait until the map has applied at least `tree_size` mutations
    pub async fn block_until_size(&self, tree_size: u64) -> Result<MapTreeHead> {
        let mut delay = POLL_START;
        loop {
            self.service.mutator().flush().await?;
            let head = self.tree_head(0)?;
            if head.tree_size() >= tree_size {
                return Ok(head);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }
}
