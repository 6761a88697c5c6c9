//! The static tool registry.
//!
//! One `ToolDescriptor` per tool names the CLI binary, whether an HTTP API
//! fallback exists, and which actions write or carry high risk. Adding a
//! tool is a single entry here plus its builder/API mapping.

use std::collections::BTreeMap;

use opsgate_contracts::{
    error::{OpsError, OpsResult},
    tool::{ActionClass, RiskTier, ToolDescriptor},
};

fn descriptor(
    name: &str,
    cli_binary: Option<&str>,
    supports_api_fallback: bool,
    write_actions: &[&str],
    high_risk_actions: &[&str],
) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        cli_binary: cli_binary.map(str::to_string),
        supports_api_fallback,
        write_actions: write_actions.iter().map(|s| s.to_string()).collect(),
        high_risk_actions: high_risk_actions.iter().map(|s| s.to_string()).collect(),
    }
}

/// Immutable lookup of known tools. Constructed once and passed by
/// reference; there is no global instance.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        Self {
            tools: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        }
    }

    /// The built-in tool set.
    pub fn builtin() -> Self {
        let kubectl_writes = [
            "scale",
            "rollout-restart",
            "rollout-undo",
            "delete-pod",
            "cordon",
            "uncordon",
        ];
        Self::new([
            descriptor(
                "kubectl",
                Some("kubectl"),
                false,
                &kubectl_writes,
                &["delete-pod", "rollout-undo", "cordon"],
            ),
            descriptor("k8s", Some("kubectl"), false, &[], &[]),
            descriptor("helm", Some("helm"), false, &["upgrade", "rollback"], &["rollback"]),
            descriptor(
                "argocd",
                Some("argocd"),
                true,
                &["sync", "rollback"],
                &["rollback"],
            ),
            descriptor(
                "aws",
                Some("aws"),
                false,
                &["ecs-update-service", "s3-cp"],
                &["ecs-update-service"],
            ),
            descriptor(
                "vault",
                Some("vault"),
                true,
                &["rotate", "lease-revoke"],
                &["rotate", "lease-revoke"],
            ),
            descriptor("gh", Some("gh"), true, &["pr-create", "pr-merge"], &["pr-merge"]),
            descriptor("glab", Some("glab"), false, &["mr-create"], &[]),
            descriptor("git", Some("git"), false, &[], &[]),
            descriptor("prometheus", None, true, &[], &[]),
            descriptor("thanos", None, true, &[], &[]),
            descriptor("tempo", None, true, &[], &[]),
            descriptor("grafana", None, true, &["annotate"], &[]),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Look up a tool, failing with `UnknownTool`.
    pub fn lookup(&self, name: &str) -> OpsResult<&ToolDescriptor> {
        self.get(name).ok_or_else(|| OpsError::UnknownTool {
            tool: name.to_string(),
        })
    }

    pub fn classify(&self, tool: &str, action: &str) -> OpsResult<ActionClass> {
        Ok(self.lookup(tool)?.classify(action))
    }

    pub fn risk_tier(&self, tool: &str, action: &str) -> OpsResult<RiskTier> {
        Ok(self.lookup(tool)?.risk_tier(action))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}
