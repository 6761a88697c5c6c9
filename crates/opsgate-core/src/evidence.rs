//! Evidence derivation: which tool calls produce evidence, and what it says.
//!
//! Only successful calls are considered. Tools without a mapping produce no
//! evidence, which is not an error.

use std::collections::BTreeMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use opsgate_contracts::evidence::{Evidence, EvidenceType};

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("static regex"));

static HEX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-f]{7,40}\b").expect("static regex"));

/// Map a tool name to the evidence kind it produces.
pub fn evidence_type_for(tool: &str) -> Option<EvidenceType> {
    match tool {
        "prometheus" | "thanos" => Some(EvidenceType::Promql),
        "tempo" => Some(EvidenceType::Traceql),
        "argocd" => Some(EvidenceType::Argocd),
        "k8s" => Some(EvidenceType::K8s),
        "aws" => Some(EvidenceType::Cloudtrail),
        "grafana" => Some(EvidenceType::Grafana),
        "gh" | "glab" => Some(EvidenceType::Scm),
        _ => None,
    }
}

/// Input fields that describe what was asked, per evidence kind.
fn query_keys(kind: EvidenceType) -> &'static [&'static str] {
    match kind {
        EvidenceType::Promql => &["query"],
        EvidenceType::Traceql => &["query", "trace_id"],
        EvidenceType::Argocd => &["app"],
        EvidenceType::K8s => &["resource", "name"],
        EvidenceType::Cloudtrail => &["resource_name", "event_name", "service"],
        EvidenceType::Grafana => &["uid", "dashboard_uid"],
        EvidenceType::Scm => &["repo", "number", "id"],
    }
}

/// Output fields holding external identifiers: (json key, evidence key).
fn id_fields(kind: EvidenceType) -> &'static [(&'static str, &'static str)] {
    match kind {
        EvidenceType::Promql => &[],
        EvidenceType::Traceql => &[
            ("traceID", "trace_id"),
            ("traceId", "trace_id"),
            ("trace_id", "trace_id"),
        ],
        EvidenceType::Argocd => &[("syncId", "sync_id"), ("revision", "revision")],
        EvidenceType::K8s => &[("resourceVersion", "resource_version"), ("uid", "uid")],
        EvidenceType::Cloudtrail => &[("EventId", "event_id"), ("eventID", "event_id")],
        EvidenceType::Grafana => &[("id", "annotation_id"), ("url", "url"), ("uid", "dashboard_uid")],
        EvidenceType::Scm => &[
            ("url", "pr_url"),
            ("html_url", "pr_url"),
            ("web_url", "pr_url"),
            ("headRefOid", "commit_sha"),
            ("merge_commit_sha", "commit_sha"),
            ("sha", "commit_sha"),
        ],
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Describe the question a call answered, from its input.
pub fn query_for(kind: EvidenceType, input: &Value) -> String {
    let parts: Vec<String> = query_keys(kind)
        .iter()
        .filter_map(|key| input.get(*key).and_then(scalar_text))
        .collect();
    if parts.is_empty() {
        serde_json::to_string(input).unwrap_or_default()
    } else {
        parts.join(" ")
    }
}

/// Breadth-first search for the first scalar under `key`.
fn find_field(root: &Value, key: &str) -> Option<String> {
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        match node {
            Value::Object(map) => {
                if let Some(found) = map.get(key).and_then(scalar_text) {
                    return Some(found);
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

/// Pull identifiers out of raw tool output.
///
/// Parseable JSON is searched by known field names. Plain-text output is
/// scanned for a URL and a 7 to 40 character hex token, for SCM tools only.
pub fn extract_external_ids(kind: EvidenceType, output: &[u8]) -> Option<BTreeMap<String, String>> {
    let mut ids = BTreeMap::new();

    match serde_json::from_slice::<Value>(output) {
        Ok(json) if json.is_object() || json.is_array() => {
            for (field, name) in id_fields(kind) {
                if ids.contains_key(*name) {
                    continue;
                }
                if let Some(value) = find_field(&json, field) {
                    ids.insert(name.to_string(), value);
                }
            }
        }
        _ if kind == EvidenceType::Scm => {
            let text = String::from_utf8_lossy(output);
            if let Some(url) = URL_PATTERN.find(&text) {
                ids.insert("pr_url".to_string(), url.as_str().to_string());
            }
            let without_urls = URL_PATTERN.replace_all(&text, " ");
            if let Some(sha) = HEX_PATTERN.find(&without_urls) {
                ids.insert("commit_sha".to_string(), sha.as_str().to_string());
            }
        }
        _ => {}
    }

    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

/// Build the evidence record for a successful call, if the tool maps to one.
///
/// `result_ref` and `link` are filled by the caller once the output has been
/// stored.
pub fn build_evidence(
    execution_id: &str,
    tool_call_id: &str,
    tool: &str,
    input: &Value,
    raw_output: &[u8],
) -> Option<Evidence> {
    let kind = evidence_type_for(tool)?;
    Some(Evidence {
        execution_id: execution_id.to_string(),
        tool_call_id: tool_call_id.to_string(),
        evidence_type: kind,
        query: query_for(kind, input),
        result_ref: String::new(),
        link: String::new(),
        collected_at: Utc::now(),
        external_ids: extract_external_ids(kind, raw_output),
    })
}
