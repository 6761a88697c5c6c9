//! Evidence records derived from successful tool calls.
//!
//! The JSON field names of `Evidence` are read by downstream audit tooling
//! and must not change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of observation an evidence record proves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Promql,
    Traceql,
    Argocd,
    K8s,
    Cloudtrail,
    Grafana,
    Scm,
}

impl EvidenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::Promql => "promql",
            EvidenceType::Traceql => "traceql",
            EvidenceType::Argocd => "argocd",
            EvidenceType::K8s => "k8s",
            EvidenceType::Cloudtrail => "cloudtrail",
            EvidenceType::Grafana => "grafana",
            EvidenceType::Scm => "scm",
        }
    }
}

/// One append-only evidence record; at most one per qualifying tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub execution_id: String,
    pub tool_call_id: String,
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    /// What was asked: a PromQL expression, an app name, a resource, ...
    pub query: String,
    /// Blob reference of the stored (redacted) output, empty without a blob store.
    pub result_ref: String,
    /// Presigned link to the stored output, empty without a blob store.
    pub link: String,
    pub collected_at: DateTime<Utc>,
    /// Identifiers found in the output (event id, revision, PR URL, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ids: Option<BTreeMap<String, String>>,
}
