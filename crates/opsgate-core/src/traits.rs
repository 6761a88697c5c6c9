//! Collaborator trait definitions for the opsgate execution pipeline.
//!
//! These traits define the boundary between the executor and everything it
//! does not own:
//!
//! - `Store`: executions, plans, tool-call records, evidence
//! - `BlobStore`: input/output payloads referenced from records
//! - `ToolDispatcher`: the router that actually runs a tool
//! - `ApiClient`: one HTTP backend used by the router's API fallback
//!
//! The executor is generic over all of them, so the direct poller, the
//! durable-workflow adapter and the tests share one code path.

use std::time::Duration;

use opsgate_contracts::{
    cancel::Budget,
    error::OpsResult,
    evidence::Evidence,
    plan::{ApprovalStatus, ExecutionRef, ExecutionStatus, PlanStep, ToolCallRecord},
    tool::{ContextRef, ExecuteRequest, ExecuteResponse},
};

/// Durable state for executions and their trail.
///
/// Implementations are expected to serialize conflicting updates; the
/// executor holds no shared mutable state beyond what it writes here.
pub trait Store: Send + Sync {
    /// Up to `limit` executions in `pending`, oldest first.
    fn list_pending_executions(&self, limit: usize) -> OpsResult<Vec<ExecutionRef>>;

    /// Register a new `pending` execution of `plan_id`.
    fn create_execution(&self, plan_id: &str, context: &ContextRef) -> OpsResult<ExecutionRef>;

    /// Current status of an execution.
    fn execution_status(&self, execution_id: &str) -> OpsResult<ExecutionStatus>;

    /// Move an execution to a non-terminal status (`running`).
    fn update_execution_status(&self, execution_id: &str, status: ExecutionStatus) -> OpsResult<()>;

    /// Move an execution to a terminal status, recording the primary error.
    fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> OpsResult<()>;

    /// Tenant/environment scoping recorded with the execution.
    fn load_context(&self, execution_id: &str) -> OpsResult<ContextRef>;

    /// The plan's steps in declaration order.
    fn load_steps(&self, plan_id: &str) -> OpsResult<Vec<PlanStep>>;

    /// Approval state recorded by the policy/approval collaborator.
    fn approval_status(&self, execution_id: &str) -> OpsResult<ApprovalStatus>;

    fn insert_tool_call(&self, record: &ToolCallRecord) -> OpsResult<()>;

    fn update_tool_call(&self, record: &ToolCallRecord) -> OpsResult<()>;

    /// Append one evidence record. Records are never modified.
    fn insert_evidence(&self, evidence: &Evidence) -> OpsResult<()>;
}

/// Payload storage for tool-call inputs and outputs.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the reference to record.
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> OpsResult<String>;

    /// A time-limited link to a stored reference.
    fn presign(&self, reference: &str, ttl: Duration) -> OpsResult<String>;
}

/// Runs one fully specified tool request.
pub trait ToolDispatcher: Send + Sync {
    fn dispatch(&self, request: ExecuteRequest, budget: &Budget) -> OpsResult<ExecuteResponse>;

    /// Called once when the poll loop stops on cancellation. Releases
    /// anything held open for observers, such as live log feeds.
    fn on_cancel(&self) {}
}

/// One HTTP request against a tool backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: String,
    /// Path plus query string, relative to the client's base URL.
    pub path: String,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Client for one backend tool's HTTP API.
pub trait ApiClient: Send + Sync {
    /// Perform the request within `budget` and return the raw response body.
    fn call(&self, request: &ApiRequest, budget: &Budget) -> OpsResult<Vec<u8>>;
}
