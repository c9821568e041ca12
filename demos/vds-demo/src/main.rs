//! Walkthrough of a verifiable log and a verifiable map
//!
//! Shows:
//! 1. A lab appends results to a log and a client audits them
//! 2. The log grows and stays consistent with what the client saw
//! 3. A record map serves a value with proof
//! 4. A tampered value is caught
//! 5. Absence of a key is proven too

use std::sync::Arc;

use anyhow::{bail, Result};
use vds::{
    verify_map_inclusion_proof, InMemoryStorage, InstantMutator, LeafData, LocalService, LogRef,
    MapRef, VerifiableLog, VerifiableMap,
};

#[tokio::main]
async fn main() -> Result<()> {
    println!("╔════════════════════════════════════════════════╗");
    println!("║  Verifiable Data Structures - Demo             ║");
    println!("║  Merkle logs and maps with client-side proofs  ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let storage = Arc::new(InMemoryStorage::new());
    let mutator = Arc::new(InstantMutator::new(storage.clone()));
    let service = LocalService::new(storage, mutator);

    // 1. Lab appends to a log
    println!("📝 Step 1: Lab appends results to a log");
    println!("   ─────────────────────────────────────");

    let log = VerifiableLog::new(service.clone(), LogRef::user("lab-results"));
    let mut hashes = Vec::new();
    for result in ["glucose: 95 mg/dL", "cholesterol: 180 mg/dL", "hba1c: 5.4%"] {
        let lh = log.add(LeafData::raw(result)).await?;
        println!("   + {result:<24} leaf {}", short(&lh));
        hashes.push(lh);
    }
    let first = log.verified_latest_tree_head(None)?;
    println!("   Tree size: {}", first.tree_size);
    println!("   Root:      {}", hex::encode(first.root_hash));

    let proof = log.inclusion_proof(first.tree_size, &hashes[1])?;
    log.verify_inclusion(&first, &hashes[1])?;
    println!("   ✓ Entry 1 included ({} audit hashes)\n", proof.audit_path.len());

    // 2. Log grows, client checks consistency
    println!("🔗 Step 2: Log grows, client checks it only grew");
    println!("   ─────────────────────────────────────────────");

    for i in 0..5 {
        log.add(LeafData::raw(format!("follow-up #{i}"))).await?;
    }
    let latest = log.verified_latest_tree_head(Some(&first))?;
    println!("   {} → {} entries", first.tree_size, latest.tree_size);
    println!("   ✓ New head is consistent with the one seen before");

    let mut audited = 0;
    log.verify_entries(Some(&first), &latest, |_, _| {
        audited += 1;
        Ok(())
    })
    .await?;
    println!("   ✓ Audited {audited} new entries against the root\n");

    // 3. Map with proofs
    println!("🔍 Step 3: Record map serves values with proof");
    println!("   ────────────────────────────────────────────");

    let map = VerifiableMap::new(service, MapRef::new("patients"));
    map.set("patient:alice", LeafData::raw("blood type: O+")).await?;
    map.set("patient:carol", LeafData::raw("blood type: AB-")).await?;

    let state = match map.verified_latest_map_state(None)? {
        Some(state) => state,
        None => bail!("map should not be empty"),
    };
    let value = map.verified_get(b"patient:alice", &state)?;
    println!("   Map size: {}", state.tree_size());
    println!("   Root:     {}", hex::encode(state.map_tree_head.root_hash));
    println!("   patient:alice → {}", String::from_utf8_lossy(&value.leaf_input));
    println!("   ✓ Value verified against a tree head in the tree-head log\n");

    // 4. Tampering
    println!("😈 Step 4: Server swaps the value");
    println!("   ───────────────────────────────");

    let mut forged = map.get(b"patient:alice", state.tree_size())?;
    forged.value = LeafData::raw("blood type: B+");
    match verify_map_inclusion_proof(&forged, b"patient:alice", &state.map_tree_head) {
        Ok(()) => println!("   ✓ Data is valid"),
        Err(e) => {
            println!("   ✗ TAMPERING DETECTED!");
            println!("   ✗ {e}");
        }
    }
    println!();

    // 5. Absence
    println!("🔐 Step 5: Proof of non-existence");
    println!("   ───────────────────────────────");

    let absent = map.verified_get(b"patient:bob", &state)?;
    println!("   patient:bob → {:?}", absent.leaf_input);
    println!("   ✓ Proven absent from this map version\n");

    println!("╔════════════════════════════════════════════════╗");
    println!("║  Summary                                       ║");
    println!("╠════════════════════════════════════════════════╣");
    println!("║  ✓ Logs prove inclusion and append-only growth ║");
    println!("║  ✓ Maps prove presence and absence             ║");
    println!("║  ✓ Clients verify without trusting the server  ║");
    println!("╚════════════════════════════════════════════════╝");

    Ok(())
}

fn short(h: &vds::Hash32) -> String {
    hex::encode(&h[..6])
}
