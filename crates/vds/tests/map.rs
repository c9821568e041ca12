use std::sync::Arc;

use vds::{
    default_leaf_values, leaf_hash, set_map_value, verify_map_inclusion_proof, InMemoryStorage,
    InstantMutator, LeafData, LocalService, MapMutation, MapRef, MutationAction, StorageWriter,
    VdsError,
};

enum Step {
    Set(&'static str, &'static str),
    Delete(&'static str),
    Update(&'static str, &'static str, &'static str),
    /// An update carrying no previous leaf hash never applies.
    UpdateWithoutPrevious(&'static str, Option<&'static str>),
}

impl Step {
    fn mutation(&self) -> MapMutation {
        match self {
            Step::Set(k, v) => MapMutation::set(*k, LeafData::raw(*v)),
            Step::Delete(k) => MapMutation::delete(*k),
            Step::Update(k, v, prev) => MapMutation::update(*k, LeafData::raw(*v), leaf_hash(prev.as_bytes())),
            Step::UpdateWithoutPrevious(k, v) => MapMutation {
                timestamp: None,
                action: MutationAction::Update,
                key: k.as_bytes().to_vec(),
                value: v.map(|v| LeafData::raw(v)),
                previous_leaf_hash: None,
            },
        }
    }
}

/// Apply `steps` to an empty map and check the root after each one.
fn check_roots(steps: &[(Step, &str)]) {
    let storage = InMemoryStorage::new();
    for (i, (step, expected)) in steps.iter().enumerate() {
        let mutation = step.mutation();
        let root = storage
            .execute_update(b"map", |kw| set_map_value(kw, i as u64, &mutation))
            .unwrap();
        assert_eq!(hex::encode(root), *expected, "step {i}");
    }
}

#[test]
fn test_two_keys() {
    check_roots(&[
        (Step::Set("foo", "bar"), "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (Step::Set("sp", "baz"), "e884d36273ce84a0aaba09c3289da0cae478b8d784eebe34fdf6829970bab4a8"),
    ]);
}

#[test]
fn test_roots_with_deletes() {
    check_roots(&[
        (Step::Set("foo", "bar"), "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (Step::Set("foo", "baz"), "1b37f603ea8fc886cb863bbf4d0865dba9269ca393315c31d8be75b0b2af496b"),
        (Step::Delete("blah"), "1b37f603ea8fc886cb863bbf4d0865dba9269ca393315c31d8be75b0b2af496b"),
        (Step::Delete("foo"), "c6689f10812a0980976d9533d83875282166159567ec35155716c1413af53d6a"),
        (Step::Set("biz", "baz"), "a755a817a7f2f6760b326f60d32156d51c69fe9b55551da37160d3f30236bf14"),
        (Step::Set("foo", "bar"), "c7f6b9e91ac0ced9ff4cf5de3068b14c518605d5919aea4ff06d6083dec8806b"),
        (Step::Delete("biz"), "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (Step::Set("a", "1"), "b0c869ea0d72ce0bd0ae806b1d014e872f10d67cd9e39857d66a7ebdbb755fd4"),
        (Step::Set("b", "2"), "fb437aab7a191432e156ed8ce243491e954a49331d2d583692e2ac06783a00ed"),
        (Step::Set("c", "3"), "8b0480688e848cfcdb91da1582d6473a5e6c24dc57efd5196e17f3e520c675fc"),
        (Step::Set("d", "4"), "56617f1391674aba81e80bd7106f05e9cd365c123278bfc8a10bd14cf78090d2"),
        (Step::Delete("foo"), "708afb19e850d57f507b3970259068872f736e934b24555fe44fa11a68e9a3eb"),
        (Step::Delete("a"), "05d937408eb2e1499aadcbd1a17236217406adea6bb569f0962c6e00ddb9ce98"),
        (Step::Delete("d"), "af9f94f940fecf7df07ae2f7ba825d5ccea5d366f3803c0ad2d025b9383b0c39"),
    ]);
}

#[test]
fn test_roots_growing_map() {
    check_roots(&[
        (Step::Set("foo", "bar"), "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (Step::Update("foo", "baz", ""), "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (Step::Update("foo", "baz", "bar"), "1b37f603ea8fc886cb863bbf4d0865dba9269ca393315c31d8be75b0b2af496b"),
        (Step::Set("foo", "baz"), "1b37f603ea8fc886cb863bbf4d0865dba9269ca393315c31d8be75b0b2af496b"),
        (Step::Set("FOO", "bar"), "eaa09fb853eeac3965c337658c2ad473f43e601c89dbdb69b1a4fbc383e21125"),
        (Step::Set("biz", "baz"), "59254cf56e5f5ee5b16c135fec0eb2a6cfa0781f848a58757660fb73b456be42"),
        (Step::Set("biz", "boz"), "a86cfc0fc9c88e14ee1a0baabc85714e3c521b1fe349bd885aa5b4b9bd9c69a7"),
        (Step::Set("yankee", "doodle"), "5605df66e682f4e2fa1108ea845a64aae2bd58032a9f7bd9640e526a4514fb92"),
        (Step::Set("continusec", "ftw"), "be19deff1574971a745c0b88bee49029b7a738603f922d5f96ab6f2458f4ad9f"),
        (Step::Set("awesome", "muffins"), "06a291aefeb02fc3517a5ee93f088eb5d1ece708206ceab6390489512c53b876"),
        (Step::Set("oldmacdonald", "hadafarm"), "9ceb94b167f4aac6b8973101da65f702912c2dfb5b09ff98d4ab01db049a5395"),
        (Step::Set("eie", "io"), "6238de9f7555b43cfc6b94535238e8bf0e51c98284084e410938cf9f87845b81"),
        (Step::Set("shouldi", "testmore"), "c64645086923d1f9edaa67eb5d25b04b11453c1ee73152b20dc447f720482095"),
        (Step::UpdateWithoutPrevious("shouldi", Some("dontdoit")), "c64645086923d1f9edaa67eb5d25b04b11453c1ee73152b20dc447f720482095"),
        (Step::Update("shouldi", "dodoit", "testmore"), "72694c69945e8bb1ab1081c11aed31b89fbc22de0dfc9b715672780d3404d1ee"),
    ]);
}

/// Lines of `set <key> <value> <root>`, `delete <key> <root>` or `update <key> <root>`.
const SET_DELETE_ROOTS: &str = include_str!("data/map_set_delete_roots.txt");

#[test]
fn test_long_set_delete_sequence() {
    let steps: Vec<(Step, &str)> = SET_DELETE_ROOTS
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let fields: Vec<&'static str> = line.split(' ').collect();
            match fields.as_slice() {
                ["set", k, v, root] => (Step::Set(*k, *v), *root),
                ["delete", k, root] => (Step::Delete(*k), *root),
                ["update", k, root] => (Step::UpdateWithoutPrevious(*k, None), *root),
                _ => panic!("bad fixture line: {line}"),
            }
        })
        .collect();
    assert_eq!(steps.len(), 605);
    check_roots(&steps);
}

#[test]
fn test_update_with_empty_previous_hash() {
    // a missing or empty previous hash decodes to none and matches nothing
    let storage = InMemoryStorage::new();
    let decoded: MapMutation = serde_json::from_str(r#"{"action":"update","key":[98]}"#).unwrap();
    assert_eq!(decoded.previous_leaf_hash, None);
    let root = storage.execute_update(b"map", |kw| set_map_value(kw, 0, &decoded)).unwrap();
    assert_eq!(root, default_leaf_values()[0]);
}

fn service() -> LocalService<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    let mutator = Arc::new(InstantMutator::new(storage.clone()));
    LocalService::new(storage, mutator)
}

#[tokio::test]
async fn test_get_value_proofs_round_trip() {
    let svc = service();
    let map = MapRef::new("proofs");
    let keys: Vec<String> = (0..24).map(|i| format!("key-{i}")).collect();

    for (i, k) in keys.iter().enumerate() {
        svc.map_set_value(&map, MapMutation::set(k.as_str(), LeafData::raw(format!("value-{i}"))))
            .await
            .unwrap();

        let head = svc.map_tree_hash(&map, 0).unwrap();
        assert_eq!(head.tree_size(), i as u64 + 1);

        for (j, k2) in keys.iter().enumerate() {
            let resp = svc.map_get_value(&map, k2.as_bytes(), head.tree_size()).unwrap();
            verify_map_inclusion_proof(&resp, k2.as_bytes(), &head).unwrap();
            if j <= i {
                assert_eq!(resp.value.leaf_input, format!("value-{j}").into_bytes());
            } else {
                assert!(resp.value.leaf_input.is_empty());
            }
        }
    }
}

#[tokio::test]
async fn test_value_readable_at_each_size() {
    let svc = service();
    let map = MapRef::new("strange");
    svc.map_set_value(&map, MapMutation::set("foo", LeafData::raw("bar"))).await.unwrap();
    svc.map_set_value(&map, MapMutation::set("sp", LeafData::raw("baz"))).await.unwrap();

    for (size, root) in [
        (1u64, "1e0a32bb2b69b490b820a22faa0d19e3121bffcf1509d6bb3267c2c67370e0e9"),
        (2, "e884d36273ce84a0aaba09c3289da0cae478b8d784eebe34fdf6829970bab4a8"),
    ] {
        let head = svc.map_tree_hash(&map, size).unwrap();
        assert_eq!(hex::encode(head.root_hash), root);
        let resp = svc.map_get_value(&map, b"foo", size).unwrap();
        assert_eq!(resp.value.leaf_input, b"bar");
        verify_map_inclusion_proof(&resp, b"foo", &head).unwrap();
    }
}

#[tokio::test]
async fn test_absent_key_and_tamper() {
    let svc = service();
    let map = MapRef::new("absent");
    svc.map_set_value(&map, MapMutation::set("present", LeafData::raw("here")))
        .await
        .unwrap();
    let head = svc.map_tree_hash(&map, 0).unwrap();

    let resp = svc.map_get_value(&map, b"missing", 0).unwrap();
    assert!(resp.value.leaf_input.is_empty());
    verify_map_inclusion_proof(&resp, b"missing", &head).unwrap();

    let mut forged = svc.map_get_value(&map, b"present", 0).unwrap();
    forged.value = LeafData::raw("elsewhere");
    assert_eq!(
        verify_map_inclusion_proof(&forged, b"present", &head),
        Err(VdsError::VerificationFailed)
    );

    let genuine = svc.map_get_value(&map, b"present", 0).unwrap();
    for i in 0..genuine.proof.audit_path.len() {
        let mut flipped = genuine.clone();
        flipped.proof.audit_path[i] = match flipped.proof.audit_path[i] {
            Some(mut h) => {
                h[0] ^= 1;
                Some(h)
            }
            None => Some([7u8; 32]),
        };
        assert_eq!(
            verify_map_inclusion_proof(&flipped, b"present", &head),
            Err(VdsError::VerificationFailed),
            "audit path entry {i}"
        );
    }

    let mut wrong_size = svc.map_get_value(&map, b"present", 0).unwrap();
    wrong_size.proof.tree_size += 1;
    assert_eq!(
        verify_map_inclusion_proof(&wrong_size, b"present", &head),
        Err(VdsError::VerificationFailed)
    );
}

#[tokio::test]
async fn test_old_versions_stay_readable() {
    let svc = service();
    let map = MapRef::new("versions");
    svc.map_set_value(&map, MapMutation::set("k", LeafData::raw("v1"))).await.unwrap();
    svc.map_set_value(&map, MapMutation::set("k", LeafData::raw("v2"))).await.unwrap();
    svc.map_set_value(&map, MapMutation::delete("k")).await.unwrap();

    for (size, expected) in [(1u64, "v1"), (2, "v2"), (3, "")] {
        let head = svc.map_tree_hash(&map, size).unwrap();
        let resp = svc.map_get_value(&map, b"k", size).unwrap();
        assert_eq!(resp.value.leaf_input, expected.as_bytes());
        verify_map_inclusion_proof(&resp, b"k", &head).unwrap();
    }
    assert_eq!(svc.map_tree_hash(&map, 3).unwrap().root_hash, default_leaf_values()[0]);
}

#[tokio::test]
async fn test_update_compare_and_set() {
    let svc = service();
    let map = MapRef::new("cas");
    svc.map_set_value(&map, MapMutation::set("k", LeafData::raw("first"))).await.unwrap();
    let before = svc.map_tree_hash(&map, 0).unwrap();

    svc.map_set_value(&map, MapMutation::update("k", LeafData::raw("second"), leaf_hash(b"stale")))
        .await
        .unwrap();
    let after_stale = svc.map_tree_hash(&map, 0).unwrap();
    assert_eq!(after_stale.tree_size(), 2);
    assert_eq!(after_stale.root_hash, before.root_hash);
    assert_eq!(svc.map_get_value(&map, b"k", 0).unwrap().value.leaf_input, b"first");

    svc.map_set_value(&map, MapMutation::update("k", LeafData::raw("second"), leaf_hash(b"first")))
        .await
        .unwrap();
    let after_current = svc.map_tree_hash(&map, 0).unwrap();
    assert_ne!(after_current.root_hash, before.root_hash);
    assert_eq!(svc.map_get_value(&map, b"k", 0).unwrap().value.leaf_input, b"second");
}

#[tokio::test]
async fn test_map_size_errors() {
    let svc = service();
    let map = MapRef::new("errors");

    let empty = svc.map_tree_hash(&map, 0).unwrap();
    assert_eq!(empty.tree_size(), 0);
    assert_eq!(empty.root_hash, default_leaf_values()[0]);

    svc.map_set_value(&map, MapMutation::set("k", LeafData::raw("v"))).await.unwrap();
    assert_eq!(svc.map_tree_hash(&map, 5), Err(VdsError::InvalidTreeRange));
    assert_eq!(svc.map_get_value(&map, b"k", 5), Err(VdsError::InvalidTreeRange));

    let mut unknown = MapMutation::set("k", LeafData::raw("v"));
    unknown.action = vds::MutationAction::Unknown;
    assert_eq!(svc.map_set_value(&map, unknown).await, Err(VdsError::NotImplemented));
}

#[tokio::test]
async fn test_json_values_round_trip() {
    let svc = service();
    let map = MapRef::new("json");
    let doc = LeafData::json_from(&serde_json::json!({"name": "alice", "n": 3})).unwrap();
    svc.map_set_value(&map, MapMutation::set("alice", doc.clone())).await.unwrap();

    let resp = svc.map_get_value(&map, b"alice", 0).unwrap();
    assert_eq!(resp.value, doc);
    resp.value.validate_json().unwrap();
}
