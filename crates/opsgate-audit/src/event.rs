//! Evidence event and log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opsgate_contracts::evidence::Evidence;

/// One entry in an execution's evidence chain.
///
/// Modifying any field, including those of the embedded evidence,
/// invalidates `this_hash` and every later `prev_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvent {
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub execution_id: String,
    pub evidence: Evidence,
    /// `this_hash` of the previous event, or `GENESIS_HASH`.
    pub prev_hash: String,
    pub this_hash: String,
}

impl EvidenceEvent {
    /// The `prev_hash` of the first event in every chain.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A snapshot of one execution's evidence chain.
///
/// `terminal_hash` is the last event's `this_hash` and commits to the
/// whole log; it is empty when no evidence was recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceLog {
    pub execution_id: String,
    pub events: Vec<EvidenceEvent>,
    pub exported_at: DateTime<Utc>,
    pub terminal_hash: String,
}
