//! Plan steps, executions and tool-call records.
//!
//! `PlanStep` is what the executor drives through the router. `ToolCallRecord`
//! is what gets persisted for every attempted invocation, rollbacks included.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::tool::UsedPath;

/// Which half of a plan a step belongs to.
///
/// Decoding is lenient: `verify` in any case selects `Verify`, and every
/// other value, including `""` and `null`, is `Act`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Mutating steps. A failure here rolls back only the failing step.
    #[default]
    Act,
    /// Post-condition checks. A failure here rolls back the whole act stage.
    Verify,
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::trim) {
            Some(stage) if stage.eq_ignore_ascii_case("verify") => Stage::Verify,
            _ => Stage::Act,
        })
    }
}

/// The inverse operation a step declares for rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackSpec {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl RollbackSpec {
    /// A rollback is only usable when both tool and action are named.
    pub fn is_declared(&self) -> bool {
        !self.tool.trim().is_empty() && !self.action.trim().is_empty()
    }
}

/// One step of a plan. Immutable once loaded for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    #[serde(default)]
    pub stage: Stage,
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSpec>,
}

/// Identifies one run of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionRef {
    pub execution_id: String,
    pub plan_id: String,
}

/// Execution lifecycle. Transitions are owned by the plan executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    /// `succeeded`, `failed` and `rolled_back` are the only end states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }
}

/// Tool-call lifecycle: `running` until the step or rollback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Succeeded,
    Failed,
}

/// One persisted tool invocation.
///
/// Carries references to stored input/output blobs, never the payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub tool: String,
    pub action: String,
    pub status: ToolCallStatus,
    /// True when this call is a compensating rollback.
    #[serde(default)]
    pub rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_path: Option<UsedPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Approval state of an execution as seen by the durable workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    NotRequired,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    /// Whether the execution may proceed to its act stage.
    pub fn may_proceed(self) -> bool {
        matches!(self, ApprovalStatus::NotRequired | ApprovalStatus::Approved)
    }
}
