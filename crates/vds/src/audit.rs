//! In-memory replay of a map's mutation log
//!
//! The map is rebuilt from an empty tree one logged mutation at a time, so
//! every head the map has published can be recomputed and compared.

use crate::bpath::BPath;
use crate::crypto::{default_leaf_values, node_hash, null_leaf_hash, MAP_DEPTH};
use crate::map::mutation_leaf_hash;
use crate::types::{Hash32, LeafData, LogTreeHead, MapMutation, MapTreeHead};
use crate::verify::LogStackVerifier;
use crate::{Result, VdsError};

enum NodeKind {
    /// Stands for the chain of single-child nodes down to the key's leaf
    Leaf { path: BPath, leaf_hash: Hash32 },
    Branch {
        left: Option<Box<AuditNode>>,
        right: Option<Box<AuditNode>>,
    },
}

struct AuditNode {
    cached: Option<Hash32>,
    kind: NodeKind,
}

impl AuditNode {
    fn empty() -> Self {
        Self {
            cached: None,
            kind: NodeKind::Branch { left: None, right: None },
        }
    }

    fn leaf(path: BPath) -> Self {
        Self {
            cached: None,
            kind: NodeKind::Leaf {
                path,
                leaf_hash: null_leaf_hash(),
            },
        }
    }

    fn apply(&mut self, depth: usize, path: &BPath, mutation: &MapMutation) -> Result<()> {
        self.cached = None;

        if let NodeKind::Leaf { path: existing, leaf_hash } = &mut self.kind {
            if *existing == *path {
                *leaf_hash = mutation_leaf_hash(mutation, leaf_hash)?;
                return Ok(());
            }
            if depth >= MAP_DEPTH {
                return Err(VdsError::VerificationFailed);
            }
            self.split(depth);
        }

        let NodeKind::Branch { left, right } = &mut self.kind else {
            return Err(VdsError::VerificationFailed);
        };
        let child = if path.at(depth) { right } else { left };
        child
            .get_or_insert_with(|| Box::new(AuditNode::leaf(path.clone())))
            .apply(depth + 1, path, mutation)
    }

    /// Turn a leaf into a branch holding that leaf one level down.
    fn split(&mut self, depth: usize) {
        let old = std::mem::replace(&mut self.kind, NodeKind::Branch { left: None, right: None });
        let goes_right = matches!(&old, NodeKind::Leaf { path, .. } if path.at(depth));
        let child = Some(Box::new(AuditNode { cached: None, kind: old }));
        self.kind = if goes_right {
            NodeKind::Branch { left: None, right: child }
        } else {
            NodeKind::Branch { left: child, right: None }
        };
    }

    fn hash(&mut self, depth: usize) -> Hash32 {
        if let Some(h) = self.cached {
            return h;
        }
        let defaults = default_leaf_values();
        let h = match &mut self.kind {
            NodeKind::Leaf { path, leaf_hash } => (depth..MAP_DEPTH).rev().fold(*leaf_hash, |acc, i| {
                if path.at(i) {
                    node_hash(&defaults[i + 1], &acc)
                } else {
                    node_hash(&acc, &defaults[i + 1])
                }
            }),
            NodeKind::Branch { left, right } => {
                let side = |child: &mut Option<Box<AuditNode>>| {
                    child.as_mut().map_or(defaults[depth + 1], |n| n.hash(depth + 1))
                };
                node_hash(&side(left), &side(right))
            }
        };
        self.cached = Some(h);
        h
    }
}

/// Every map head implied by the mutation log entries replayed so far.
pub(crate) struct MapReplay {
    root: AuditNode,
    mutation_log: LogStackVerifier,
    heads: Vec<MapTreeHead>,
}

impl MapReplay {
    pub(crate) fn new() -> Self {
        Self {
            root: AuditNode::empty(),
            mutation_log: LogStackVerifier::new(),
            heads: Vec::new(),
        }
    }

    /// Apply mutation log entry `index`. `audit` is called when the entry
    /// changed the map root.
    pub(crate) fn apply<F>(&mut self, index: u64, entry: &LeafData, audit: &mut F) -> Result<()>
    where
        F: FnMut(u64, &MapMutation) -> Result<()>,
    {
        if index != self.mutation_log.size() {
            return Err(VdsError::VerificationFailed);
        }
        entry.validate_json()?;
        let mutation = MapMutation::from_leaf_data(entry)?;

        let before = self.root.hash(0);
        self.root
            .apply(0, &BPath::from_key(&mutation.key), &mutation)
            .map_err(|e| match e {
                // the service never logs a mutation it cannot apply
                VdsError::NotImplemented => VdsError::VerificationFailed,
                e => e,
            })?;
        let after = self.root.hash(0);

        self.mutation_log.push(entry.leaf_hash());
        self.heads.push(MapTreeHead {
            root_hash: after,
            mutation_log: self.mutation_log.head(),
        });

        if after != before {
            audit(index, &mutation)?;
        }
        Ok(())
    }

    /// Compare a published head with the replayed head of the same size.
    pub(crate) fn check(&self, head: &MapTreeHead) -> Result<()> {
        let expected = match head.tree_size() {
            0 => MapTreeHead {
                root_hash: default_leaf_values()[0],
                mutation_log: LogTreeHead::default(),
            },
            n => usize::try_from(n - 1)
                .ok()
                .and_then(|i| self.heads.get(i))
                .cloned()
                .ok_or(VdsError::VerificationFailed)?,
        };
        if *head != expected {
            return Err(VdsError::VerificationFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::log::add_entry_to_log;
    use crate::map::set_map_value;
    use crate::mutator::InstantMutator;
    use crate::records;
    use crate::service::{LocalService, Namespace};
    use crate::storage::{InMemoryStorage, StorageWriter};
    use crate::types::{LogType, MapRef};
    use crate::VerifiableMap;

    fn replay_all(mutations: &[MapMutation]) -> MapReplay {
        let mut replay = MapReplay::new();
        for (i, m) in mutations.iter().enumerate() {
            replay
                .apply(i as u64, &m.to_leaf_data().unwrap(), &mut |_, _| Ok(()))
                .unwrap();
        }
        replay
    }

    #[test]
    fn test_replayed_roots_match_stored_map() {
        let mutations = vec![
            MapMutation::set("foo", LeafData::raw("bar")),
            MapMutation::set("sp", LeafData::raw("baz")),
            MapMutation::delete("foo"),
            MapMutation::delete("nothing"),
            MapMutation::set("a", LeafData::raw("1")),
        ];
        let storage = InMemoryStorage::new();
        let replay = replay_all(&mutations);
        for (i, m) in mutations.iter().enumerate() {
            let root = storage
                .execute_update(b"map", |kw| set_map_value(kw, i as u64, m))
                .unwrap();
            assert_eq!(replay.heads[i].root_hash, root, "mutation {i}");
        }
        assert_eq!(
            hex::encode(replay.heads[1].root_hash),
            "e884d36273ce84a0aaba09c3289da0cae478b8d784eebe34fdf6829970bab4a8"
        );
    }

    #[test]
    fn test_audit_sees_only_root_changes() {
        let mutations = [
            MapMutation::set("k", LeafData::raw("v")),
            MapMutation::delete("absent"),
            MapMutation::update("k", LeafData::raw("w"), crate::leaf_hash(b"stale")),
            MapMutation::set("k", LeafData::raw("v")),
            MapMutation::delete("k"),
        ];
        let mut replay = MapReplay::new();
        let mut seen = Vec::new();
        for (i, m) in mutations.iter().enumerate() {
            replay
                .apply(i as u64, &m.to_leaf_data().unwrap(), &mut |idx, _| {
                    seen.push(idx);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(seen, vec![0, 4]);
        assert_eq!(replay.heads[4].root_hash, default_leaf_values()[0]);
    }

    #[test]
    fn test_check_rejects_unknown_sizes() {
        let replay = replay_all(&[MapMutation::set("k", LeafData::raw("v"))]);
        replay.check(&replay.heads[0]).unwrap();
        replay
            .check(&MapTreeHead {
                root_hash: default_leaf_values()[0],
                mutation_log: LogTreeHead::default(),
            })
            .unwrap();

        let mut later = replay.heads[0].clone();
        later.mutation_log.tree_size = 2;
        assert_eq!(replay.check(&later), Err(VdsError::VerificationFailed));

        let mut wrong_root = replay.heads[0].clone();
        wrong_root.root_hash = [1u8; 32];
        assert_eq!(replay.check(&wrong_root), Err(VdsError::VerificationFailed));
    }

    #[test]
    fn test_rejects_out_of_order_entries() {
        let mut replay = MapReplay::new();
        let entry = MapMutation::set("k", LeafData::raw("v")).to_leaf_data().unwrap();
        assert_eq!(
            replay.apply(1, &entry, &mut |_, _| Ok(())),
            Err(VdsError::VerificationFailed)
        );
        let mut tampered = entry.clone();
        tampered.extra_data.push(b' ');
        assert_eq!(
            replay.apply(0, &tampered, &mut |_, _| Ok(())),
            Err(VdsError::VerificationFailed)
        );
    }

    #[tokio::test]
    async fn test_forged_tree_head_is_caught() {
        let storage = Arc::new(InMemoryStorage::new());
        let mutator = Arc::new(InstantMutator::new(storage.clone()));
        let svc = LocalService::new(storage.clone(), mutator);
        let map = MapRef::new("forged");
        let vmap = VerifiableMap::new(svc.clone(), map.clone());
        vmap.set("a", LeafData::raw("1")).await.unwrap();

        // log b=2 but store b=3
        storage
            .execute_update(Namespace::for_map(&map).as_bytes(), |kw| {
                let size = records::read_object_size(&*kw)?;
                let logged = MapMutation::set("b", LeafData::raw("2")).to_leaf_data()?;
                let mutation_log = add_entry_to_log(kw, size, LogType::Mutation, &logged)?
                    .ok_or(VdsError::VerificationFailed)?;
                let root_hash = set_map_value(kw, size, &MapMutation::set("b", LeafData::raw("3")))?;
                let head = MapTreeHead { root_hash, mutation_log };
                add_entry_to_log(kw, size, LogType::TreeHead, &head.to_leaf_data()?)?;
                records::write_object_size(kw, size + 1)
            })
            .unwrap();

        let state = vmap.verified_latest_map_state(None).unwrap().unwrap();
        assert_eq!(state.tree_size(), 2);
        assert_eq!(vmap.verified_get(b"b", &state).unwrap().leaf_input, b"3");

        assert_eq!(
            vmap.verify_map(None, &state, |_, _| Ok(())).await,
            Err(VdsError::VerificationFailed)
        );
    }
}
