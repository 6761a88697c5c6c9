//! Tool descriptors and the dispatch request/response payloads.
//!
//! `ExecuteRequest` and `ExecuteResponse` are the JSON wire shapes used at
//! every network boundary and for internal calls from the plan executor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Static description of one external tool.
///
/// The registry built from these descriptors is the sole authority for
/// "known tool". Read/write classification and the risk tier are derived
/// from the same entry that names the CLI binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Registry key, e.g. "kubectl", "prometheus".
    pub name: String,
    /// Binary looked up on the search path. `None` for API-only tools.
    pub cli_binary: Option<String>,
    /// Whether the router may fall back to the tool's HTTP API when the
    /// binary is not resolvable.
    pub supports_api_fallback: bool,
    /// Actions that mutate external state. Everything else is a read.
    #[serde(default)]
    pub write_actions: Vec<String>,
    /// Write actions that carry the highest blast radius.
    #[serde(default)]
    pub high_risk_actions: Vec<String>,
}

impl ToolDescriptor {
    /// Classify `action` as a read or a write.
    pub fn classify(&self, action: &str) -> ActionClass {
        if self.write_actions.iter().any(|a| a == action) {
            ActionClass::Write
        } else {
            ActionClass::Read
        }
    }

    /// Risk tier consumed by the policy collaborator.
    pub fn risk_tier(&self, action: &str) -> RiskTier {
        if self.high_risk_actions.iter().any(|a| a == action) {
            RiskTier::High
        } else if self.classify(action) == ActionClass::Write {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}

/// Whether an action only observes or also mutates external state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Read,
    Write,
}

/// Blast-radius tier of a tool action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// Scoping carried with every request: produced upstream, consumed read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Free-form labels (service, team, ...) passed through to policy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// One tool invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub tool: String,
    pub action: String,
    /// Opaque structured input. Builders read it as an ordered key/value
    /// document and tolerate unknown fields.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Generated by the router when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub context: ContextRef,
}

impl ExecuteRequest {
    /// Build a request with no ids and an empty context.
    pub fn new(tool: impl Into<String>, action: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            action: action.into(),
            input,
            tool_call_id: None,
            execution_id: None,
            context: ContextRef::default(),
        }
    }
}

/// Which route the router took to run the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsedPath {
    Cli,
    Api,
}

/// Result of a successful tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub tool_call_id: String,
    /// Raw tool output, already capped to the sandbox output limit.
    #[serde(with = "bytes_as_text")]
    pub output: Vec<u8>,
    pub used_path: UsedPath,
}

impl ExecuteResponse {
    /// The output decoded as UTF-8, replacing invalid sequences.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Encodes byte payloads as (lossy) UTF-8 strings on the wire: tool output
/// is text in practice and a JSON array of numbers helps no one.
mod bytes_as_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}
