//! The plan step executor: drives an execution's steps through the tool
//! dispatcher with act/verify staging and rollback.
//!
//! Execution model per execution:
//!
//!   pending → running → act steps (in order) → verify steps (in order) → succeeded
//!
//! - An act-step failure rolls back that step only, then stops.
//! - A verify-step failure rolls back every act step in reverse order,
//!   best-effort, then stops.
//! - Rollback failures never replace the primary error; they only decide
//!   between `rolled_back` and `failed`, and are reported alongside it.
//!
//! Every tool call is recorded as `running` before dispatch and moved to a
//! terminal status before control returns, whichever way the call ends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use opsgate_contracts::{
    cancel::{Budget, CancelToken},
    error::{OpsError, OpsResult},
    evidence::Evidence,
    plan::{ExecutionRef, ExecutionStatus, PlanStep, Stage, ToolCallRecord, ToolCallStatus},
    tool::{ContextRef, ExecuteRequest, UsedPath},
};

use crate::{
    evidence::build_evidence,
    redact::redact_output,
    traits::{BlobStore, Store, ToolDispatcher},
};

/// Step timeout used when none is configured.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunables for the poll loop and per-step budgets.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum executions claimed per poll.
    pub batch_limit: usize,
    /// Upper bound on one tool invocation, rollbacks included.
    pub step_timeout: Duration,
    /// Sleep between polls that found nothing to do.
    pub poll_interval: Duration,
    /// Lifetime of presigned evidence links.
    pub presign_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            poll_interval: Duration::from_secs(2),
            presign_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// The terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub execution: ExecutionRef,
    pub status: ExecutionStatus,
    /// The primary failure, if any.
    pub error: Option<String>,
    /// Failure of the rollback path, reported next to the primary error.
    pub rollback_error: Option<String>,
}

/// The result of one successful tool call made on behalf of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub tool_call_id: String,
    pub used_path: UsedPath,
    pub evidence: Option<Evidence>,
}

/// One tool call to make and record: a step's forward operation or its
/// declared inverse.
struct CallSpec<'a> {
    step_id: &'a str,
    tool: &'a str,
    action: &'a str,
    input: &'a Value,
    rollback: bool,
}

/// Drives pending executions through the dispatcher.
///
/// Steps within an execution run strictly sequentially. The executor keeps
/// no mutable state of its own; several instances may share one store.
pub struct PlanExecutor {
    store: Arc<dyn Store>,
    blobs: Option<Arc<dyn BlobStore>>,
    dispatcher: Arc<dyn ToolDispatcher>,
    config: ExecutorConfig,
}

impl PlanExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn ToolDispatcher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            blobs: None,
            dispatcher,
            config,
        }
    }

    /// Persist tool-call inputs/outputs and link evidence to them.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // ── Poll loop ────────────────────────────────────────────────────────────

    /// Poll until `cancel` fires. Store errors are logged and retried on the
    /// next tick.
    pub fn run(&self, cancel: &CancelToken) {
        info!(batch_limit = self.config.batch_limit, "plan executor started");
        while !cancel.is_cancelled() {
            let idle = match self.run_once(cancel) {
                Ok(outcomes) => outcomes.is_empty(),
                Err(e) => {
                    error!(error = %e, "poll for pending executions failed");
                    true
                }
            };
            if idle && !cancel.sleep(self.config.poll_interval) {
                break;
            }
        }
        if cancel.is_cancelled() {
            self.dispatcher.on_cancel();
        }
        info!("plan executor stopped");
    }

    /// Claim up to `batch_limit` pending executions and run each to a
    /// terminal status.
    pub fn run_once(&self, cancel: &CancelToken) -> OpsResult<Vec<ExecutionOutcome>> {
        let pending = self.store.list_pending_executions(self.config.batch_limit)?;
        debug!(count = pending.len(), "claimed pending executions");

        let mut outcomes = Vec::with_capacity(pending.len());
        for execution in pending {
            if cancel.is_cancelled() {
                break;
            }
            outcomes.push(self.run_execution(&execution, cancel));
        }
        Ok(outcomes)
    }

    // ── One execution ────────────────────────────────────────────────────────

    /// Run one execution end to end. Never returns with the execution left
    /// in `running` unless the store itself refuses the final update.
    pub fn run_execution(&self, execution: &ExecutionRef, cancel: &CancelToken) -> ExecutionOutcome {
        let execution_id = execution.execution_id.as_str();
        info!(execution_id = %execution_id, plan_id = %execution.plan_id, "execution starting");

        if let Err(e) = self.store.update_execution_status(execution_id, ExecutionStatus::Running) {
            return self.finish(execution, ExecutionStatus::Failed, Some(e.to_string()), None);
        }

        let loaded = self
            .store
            .load_context(execution_id)
            .and_then(|ctx| Ok((ctx, self.store.load_steps(&execution.plan_id)?)));
        let (context, steps) = match loaded {
            Ok(pair) => pair,
            Err(e) => {
                return self.finish(execution, ExecutionStatus::Failed, Some(e.to_string()), None)
            }
        };

        let act: Vec<&PlanStep> = steps.iter().filter(|s| s.stage == Stage::Act).collect();
        let verify: Vec<&PlanStep> = steps.iter().filter(|s| s.stage == Stage::Verify).collect();
        debug!(
            execution_id = %execution_id,
            act_steps = act.len(),
            verify_steps = verify.len(),
            "plan loaded"
        );

        // ── Act stage: a failure rolls back the failing step only ────────────
        for step in &act {
            if cancel.is_cancelled() {
                warn!(execution_id = %execution_id, step_id = %step.step_id, "cancelled before act step");
                return self.finish(
                    execution,
                    ExecutionStatus::Failed,
                    Some(OpsError::Cancelled.to_string()),
                    None,
                );
            }

            if let Err(primary) = self.execute_step(execution, &context, step, cancel) {
                warn!(
                    execution_id = %execution_id,
                    step_id = %step.step_id,
                    error = %primary,
                    "act step failed, rolling back this step"
                );
                return match self.rollback_step(execution, &context, step) {
                    Ok(_) => self.finish(
                        execution,
                        ExecutionStatus::RolledBack,
                        Some(primary.to_string()),
                        None,
                    ),
                    Err(rb) => self.finish(
                        execution,
                        ExecutionStatus::Failed,
                        Some(primary.to_string()),
                        Some(rb.to_string()),
                    ),
                };
            }
        }

        // ── Verify stage: a failure rolls back the whole act stage ───────────
        for step in &verify {
            let result = if cancel.is_cancelled() {
                Err(OpsError::Cancelled)
            } else {
                self.execute_step(execution, &context, step, cancel).map(|_| ())
            };

            if let Err(primary) = result {
                warn!(
                    execution_id = %execution_id,
                    step_id = %step.step_id,
                    error = %primary,
                    "verify step failed, rolling back act stage"
                );
                return match self.rollback_act_steps(execution, &context, &act) {
                    Ok(()) => self.finish(
                        execution,
                        ExecutionStatus::RolledBack,
                        Some(primary.to_string()),
                        None,
                    ),
                    Err(rb) => self.finish(
                        execution,
                        ExecutionStatus::Failed,
                        Some(primary.to_string()),
                        Some(rb.to_string()),
                    ),
                };
            }
        }

        self.finish(execution, ExecutionStatus::Succeeded, None, None)
    }

    /// Record the terminal status and build the outcome.
    fn finish(
        &self,
        execution: &ExecutionRef,
        status: ExecutionStatus,
        error: Option<String>,
        rollback_error: Option<String>,
    ) -> ExecutionOutcome {
        let mut error = error;
        if let Err(e) = self
            .store
            .complete_execution(&execution.execution_id, status, error.as_deref())
        {
            error!(
                execution_id = %execution.execution_id,
                status = status.as_str(),
                error = %e,
                "failed to record terminal execution status"
            );
            let note = format!("recording status failed: {e}");
            error = Some(match error {
                Some(primary) => format!("{primary}; {note}"),
                None => note,
            });
        }

        info!(
            execution_id = %execution.execution_id,
            status = status.as_str(),
            rollback_error = rollback_error.as_deref().unwrap_or(""),
            "execution finished"
        );

        ExecutionOutcome {
            execution: execution.clone(),
            status,
            error,
            rollback_error,
        }
    }

    // ── Steps and rollbacks ──────────────────────────────────────────────────

    /// Execute one step through the dispatcher, recording the tool call,
    /// payloads and evidence. Shared by the poller and the durable adapter.
    pub fn execute_step(
        &self,
        execution: &ExecutionRef,
        context: &ContextRef,
        step: &PlanStep,
        cancel: &CancelToken,
    ) -> OpsResult<StepOutcome> {
        let budget = Budget::new(self.config.step_timeout, cancel.clone());
        budget.check()?;

        let call = CallSpec {
            step_id: &step.step_id,
            tool: &step.tool,
            action: &step.action,
            input: &step.input,
            rollback: false,
        };
        self.record_call(execution, context, &call, &budget)
    }

    /// Run the step's declared inverse operation.
    ///
    /// A step without a rollback spec fails with `NoRollback`; callers treat
    /// that like any other rollback failure. Rollbacks run on a budget
    /// detached from the execution's cancel token so an operator cancel
    /// still lets compensation happen.
    pub fn rollback_step(
        &self,
        execution: &ExecutionRef,
        context: &ContextRef,
        step: &PlanStep,
    ) -> OpsResult<StepOutcome> {
        let spec = step
            .rollback
            .as_ref()
            .filter(|r| r.is_declared())
            .ok_or_else(|| OpsError::NoRollback {
                step_id: step.step_id.clone(),
            })?;

        info!(
            execution_id = %execution.execution_id,
            step_id = %step.step_id,
            tool = %spec.tool,
            action = %spec.action,
            "rolling back step"
        );

        let budget = Budget::detached(self.config.step_timeout);
        let call = CallSpec {
            step_id: &step.step_id,
            tool: &spec.tool,
            action: &spec.action,
            input: &spec.input,
            rollback: true,
        };
        self.record_call(execution, context, &call, &budget)
    }

    /// Roll back `act_steps` in reverse order, continuing past failures.
    ///
    /// Returns `RollbackFailed` listing every step that could not be rolled
    /// back, or `Ok(())` if the whole cascade succeeded.
    pub fn rollback_act_steps(
        &self,
        execution: &ExecutionRef,
        context: &ContextRef,
        act_steps: &[&PlanStep],
    ) -> OpsResult<()> {
        let mut failures = Vec::new();
        for step in act_steps.iter().rev() {
            if let Err(e) = self.rollback_step(execution, context, step) {
                warn!(
                    execution_id = %execution.execution_id,
                    step_id = %step.step_id,
                    error = %e,
                    "rollback failed, continuing cascade"
                );
                failures.push(format!("{}: {}", step.step_id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OpsError::RollbackFailed {
                reason: failures.join("; "),
            })
        }
    }

    // ── Tool-call recording ──────────────────────────────────────────────────

    /// Insert a `running` record, perform the call, and always leave the
    /// record in a terminal status.
    fn record_call(
        &self,
        execution: &ExecutionRef,
        context: &ContextRef,
        call: &CallSpec<'_>,
        budget: &Budget,
    ) -> OpsResult<StepOutcome> {
        let mut record = ToolCallRecord {
            tool_call_id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution.execution_id.clone(),
            step_id: call.step_id.to_string(),
            tool: call.tool.to_string(),
            action: call.action.to_string(),
            status: ToolCallStatus::Running,
            rollback: call.rollback,
            input_ref: None,
            output_ref: None,
            used_path: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.insert_tool_call(&record)?;

        match self.perform_call(execution, context, call, &mut record, budget) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                record.status = ToolCallStatus::Failed;
                record.error = Some(e.to_string());
                record.finished_at = Some(Utc::now());
                if let Err(update) = self.store.update_tool_call(&record) {
                    error!(
                        tool_call_id = %record.tool_call_id,
                        error = %update,
                        "failed to mark tool call failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn perform_call(
        &self,
        execution: &ExecutionRef,
        context: &ContextRef,
        call: &CallSpec<'_>,
        record: &mut ToolCallRecord,
        budget: &Budget,
    ) -> OpsResult<StepOutcome> {
        let blob_prefix = format!(
            "executions/{}/tool-calls/{}",
            execution.execution_id, record.tool_call_id
        );

        // Inputs are stored verbatim; redaction happens when they are read.
        if let Some(blobs) = &self.blobs {
            let bytes = serde_json::to_vec(call.input).map_err(OpsError::persistence)?;
            record.input_ref =
                Some(blobs.put(&format!("{blob_prefix}/input.json"), &bytes, "application/json")?);
        }

        let request = ExecuteRequest {
            tool: call.tool.to_string(),
            action: call.action.to_string(),
            input: call.input.clone(),
            tool_call_id: Some(record.tool_call_id.clone()),
            execution_id: Some(execution.execution_id.clone()),
            context: context.clone(),
        };
        let response = self.dispatcher.dispatch(request, budget)?;
        record.used_path = Some(response.used_path);

        let mut link = String::new();
        if let Some(blobs) = &self.blobs {
            let redacted = redact_output(&response.output);
            let output_ref = blobs.put(&format!("{blob_prefix}/output"), &redacted, "text/plain")?;
            link = blobs.presign(&output_ref, self.config.presign_ttl)?;
            record.output_ref = Some(output_ref);
        }

        record.status = ToolCallStatus::Succeeded;
        record.finished_at = Some(Utc::now());
        self.store.update_tool_call(record)?;

        let evidence = match build_evidence(
            &execution.execution_id,
            &record.tool_call_id,
            call.tool,
            call.input,
            &response.output,
        ) {
            Some(mut evidence) => {
                evidence.result_ref = record.output_ref.clone().unwrap_or_default();
                evidence.link = link;
                self.store.insert_evidence(&evidence)?;
                Some(evidence)
            }
            None => None,
        };

        debug!(
            execution_id = %execution.execution_id,
            tool_call_id = %record.tool_call_id,
            tool = %call.tool,
            action = %call.action,
            rollback = call.rollback,
            evidence = evidence.is_some(),
            "tool call succeeded"
        );

        Ok(StepOutcome {
            tool_call_id: record.tool_call_id.clone(),
            used_path: response.used_path,
            evidence,
        })
    }
}
