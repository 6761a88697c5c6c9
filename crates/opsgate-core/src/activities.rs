//! Durable-workflow adapter.
//!
//! A workflow engine that persists its own progress calls these activities
//! one at a time instead of letting the poller drive the whole execution.
//! Each activity is a thin wrapper over the same `PlanExecutor` code path,
//! so tool-call recording, evidence and rollback behave identically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use opsgate_contracts::{
    cancel::CancelToken,
    error::{OpsError, OpsResult},
    plan::{ApprovalStatus, ExecutionRef, ExecutionStatus, PlanStep},
    tool::{ContextRef, UsedPath},
};

use crate::executor::PlanExecutor;

/// Activity input for executing or rolling back one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepActivityInput {
    pub execution_id: String,
    pub plan_id: String,
    /// Context as carried by the workflow. `null` means "load it from the
    /// store".
    #[serde(default)]
    pub context: serde_json::Value,
    pub step: PlanStep,
}

/// Activity result for a step or rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepActivityResult {
    pub tool_call_id: String,
    pub used_path: UsedPath,
    pub evidence_recorded: bool,
}

/// Activity surface exposed to a durable workflow engine.
pub struct Activities {
    executor: Arc<PlanExecutor>,
    cancel: CancelToken,
}

impl Activities {
    pub fn new(executor: Arc<PlanExecutor>, cancel: CancelToken) -> Self {
        Self { executor, cancel }
    }

    fn resolve(&self, input: &StepActivityInput) -> OpsResult<(ExecutionRef, ContextRef)> {
        let execution = ExecutionRef {
            execution_id: input.execution_id.clone(),
            plan_id: input.plan_id.clone(),
        };
        let context = if input.context.is_null() {
            self.executor.store().load_context(&input.execution_id)?
        } else {
            serde_json::from_value(input.context.clone()).map_err(|e| OpsError::InvalidInput {
                reason: format!("context: {e}"),
            })?
        };
        Ok((execution, context))
    }

    /// Run one step's forward operation.
    pub fn execute_step(&self, input: &StepActivityInput) -> OpsResult<StepActivityResult> {
        let (execution, context) = self.resolve(input)?;
        let outcome = self
            .executor
            .execute_step(&execution, &context, &input.step, &self.cancel)?;
        Ok(StepActivityResult {
            tool_call_id: outcome.tool_call_id,
            used_path: outcome.used_path,
            evidence_recorded: outcome.evidence.is_some(),
        })
    }

    /// Run one step's declared rollback.
    pub fn rollback_step(&self, input: &StepActivityInput) -> OpsResult<StepActivityResult> {
        let (execution, context) = self.resolve(input)?;
        let outcome = self.executor.rollback_step(&execution, &context, &input.step)?;
        Ok(StepActivityResult {
            tool_call_id: outcome.tool_call_id,
            used_path: outcome.used_path,
            evidence_recorded: outcome.evidence.is_some(),
        })
    }

    /// Register a new pending execution.
    pub fn create_execution(&self, plan_id: &str, context: &ContextRef) -> OpsResult<ExecutionRef> {
        let execution = self.executor.store().create_execution(plan_id, context)?;
        info!(execution_id = %execution.execution_id, plan_id = %plan_id, "execution created");
        Ok(execution)
    }

    /// Move an execution to a non-terminal status.
    pub fn update_execution_status(&self, execution_id: &str, status: ExecutionStatus) -> OpsResult<()> {
        if status.is_terminal() {
            return Err(OpsError::InvalidInput {
                reason: format!(
                    "status '{}' is terminal; use complete_execution",
                    status.as_str()
                ),
            });
        }
        self.executor
            .store()
            .update_execution_status(execution_id, status)
    }

    /// Record a terminal status.
    ///
    /// Safe to retry: repeating the call with the status already recorded is
    /// a no-op. Overwriting a different terminal status is rejected.
    pub fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> OpsResult<()> {
        if !status.is_terminal() {
            return Err(OpsError::InvalidInput {
                reason: format!("status '{}' is not terminal", status.as_str()),
            });
        }

        let store = self.executor.store();
        let current = store.execution_status(execution_id)?;
        if current == status {
            return Ok(());
        }
        if current.is_terminal() {
            warn!(
                execution_id = %execution_id,
                current = current.as_str(),
                requested = status.as_str(),
                "refusing to overwrite terminal status"
            );
            return Err(OpsError::InvalidInput {
                reason: format!(
                    "execution {execution_id} already finished as '{}'",
                    current.as_str()
                ),
            });
        }
        store.complete_execution(execution_id, status, error)
    }

    /// Approval state as recorded by the approval collaborator.
    pub fn check_approval(&self, execution_id: &str) -> OpsResult<ApprovalStatus> {
        self.executor.store().approval_status(execution_id)
    }
}
