//! Hashing and verification of the per-execution evidence chain.
//!
//! Each event hashes, in order: the execution id, the sequence number as
//! 8 little-endian bytes, the previous event's hash (64 hex chars) and the
//! compact JSON of the evidence record.

use sha2::{Digest, Sha256};

use opsgate_contracts::evidence::Evidence;

use crate::event::EvidenceEvent;

/// Lowercase hex SHA-256 of one chain position.
///
/// # Panics
///
/// Panics if `evidence` fails to serialize, which the derived `Serialize`
/// impl of `Evidence` never does.
pub fn hash_event(execution_id: &str, sequence: u64, evidence: &Evidence, prev_hash: &str) -> String {
    let body = serde_json::to_vec(evidence).expect("Evidence serializes to JSON");
    let digest = Sha256::new()
        .chain_update(execution_id.as_bytes())
        .chain_update(sequence.to_le_bytes())
        .chain_update(prev_hash.as_bytes())
        .chain_update(&body)
        .finalize();
    hex::encode(digest)
}

/// True when every event sits at its own index, links to its predecessor
/// (genesis for the first) and carries the hash of its own contents.
pub fn verify_chain(events: &[EvidenceEvent]) -> bool {
    let mut prev = EvidenceEvent::GENESIS_HASH;
    events.iter().enumerate().all(|(idx, event)| {
        let intact = event.sequence == idx as u64
            && event.prev_hash == prev
            && event.this_hash
                == hash_event(&event.execution_id, event.sequence, &event.evidence, &event.prev_hash);
        prev = event.this_hash.as_str();
        intact
    })
}
