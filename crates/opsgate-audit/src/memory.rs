//! In-memory implementations of `Store` and `BlobStore`.
//!
//! `InMemoryStore` keeps executions, plans, tool-call records and one
//! evidence hash chain per execution behind a single `Mutex`. It backs the
//! operator CLI and the tests; a database-backed store implements the same
//! trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use opsgate_contracts::{
    error::{OpsError, OpsResult},
    evidence::Evidence,
    plan::{ApprovalStatus, ExecutionRef, ExecutionStatus, PlanStep, ToolCallRecord},
    tool::ContextRef,
};
use opsgate_core::traits::{BlobStore, Store};

use crate::{
    chain::{hash_event, verify_chain},
    event::{EvidenceEvent, EvidenceLog},
};

// ── Internal mutable state ────────────────────────────────────────────────────

/// One execution's row.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub execution: ExecutionRef,
    pub context: ContextRef,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub approval: ApprovalStatus,
}

/// Append-only evidence chain for one execution.
pub(crate) struct Chain {
    pub(crate) events: Vec<EvidenceEvent>,
    sequence: u64,
    last_hash: String,
}

impl Chain {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            sequence: 0,
            last_hash: EvidenceEvent::GENESIS_HASH.to_string(),
        }
    }

    fn append(&mut self, execution_id: &str, evidence: &Evidence) -> &EvidenceEvent {
        let prev_hash = self.last_hash.clone();
        let sequence = self.sequence;
        let this_hash = hash_event(execution_id, sequence, evidence, &prev_hash);

        self.events.push(EvidenceEvent {
            sequence,
            execution_id: execution_id.to_string(),
            evidence: evidence.clone(),
            prev_hash,
            this_hash: this_hash.clone(),
        });
        self.sequence += 1;
        self.last_hash = this_hash;
        &self.events[self.events.len() - 1]
    }
}

#[derive(Default)]
pub(crate) struct InMemoryState {
    /// Creation order; pending executions are listed oldest first.
    executions: Vec<ExecutionEntry>,
    plans: HashMap<String, Vec<PlanStep>>,
    tool_calls: Vec<ToolCallRecord>,
    pub(crate) chains: HashMap<String, Chain>,
}

impl InMemoryState {
    fn entry_mut(&mut self, execution_id: &str) -> OpsResult<&mut ExecutionEntry> {
        self.executions
            .iter_mut()
            .find(|e| e.execution.execution_id == execution_id)
            .ok_or_else(|| OpsError::persistence(format!("execution not found: {execution_id}")))
    }
}

// ── Public store ──────────────────────────────────────────────────────────────

/// Thread-safe in-memory store. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    pub(crate) state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> OpsResult<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|e| OpsError::persistence(format!("store lock poisoned: {e}")))
    }

    /// Register (or replace) a plan's steps.
    pub fn put_plan(&self, plan_id: &str, steps: Vec<PlanStep>) -> OpsResult<()> {
        self.lock()?.plans.insert(plan_id.to_string(), steps);
        Ok(())
    }

    /// Record the approval collaborator's decision for an execution.
    pub fn set_approval(&self, execution_id: &str, approval: ApprovalStatus) -> OpsResult<()> {
        self.lock()?.entry_mut(execution_id)?.approval = approval;
        Ok(())
    }

    pub fn execution(&self, execution_id: &str) -> OpsResult<ExecutionEntry> {
        Ok(self.lock()?.entry_mut(execution_id)?.clone())
    }

    /// Tool-call records of one execution in insertion order.
    pub fn tool_calls(&self, execution_id: &str) -> OpsResult<Vec<ToolCallRecord>> {
        Ok(self
            .lock()?
            .tool_calls
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    /// Snapshot of an execution's evidence chain.
    pub fn export_evidence(&self, execution_id: &str) -> OpsResult<EvidenceLog> {
        let state = self.lock()?;
        let events = state
            .chains
            .get(execution_id)
            .map(|c| c.events.clone())
            .unwrap_or_default();
        let terminal_hash = events.last().map(|e| e.this_hash.clone()).unwrap_or_default();

        Ok(EvidenceLog {
            execution_id: execution_id.to_string(),
            events,
            exported_at: Utc::now(),
            terminal_hash,
        })
    }

    /// Whether an execution's evidence chain is untampered.
    pub fn verify_integrity(&self, execution_id: &str) -> OpsResult<bool> {
        let state = self.lock()?;
        Ok(state
            .chains
            .get(execution_id)
            .map(|c| verify_chain(&c.events))
            .unwrap_or(true))
    }
}

// ── Store impl ────────────────────────────────────────────────────────────────

impl Store for InMemoryStore {
    fn list_pending_executions(&self, limit: usize) -> OpsResult<Vec<ExecutionRef>> {
        Ok(self
            .lock()?
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .take(limit)
            .map(|e| e.execution.clone())
            .collect())
    }

    fn create_execution(&self, plan_id: &str, context: &ContextRef) -> OpsResult<ExecutionRef> {
        let mut state = self.lock()?;
        if !state.plans.contains_key(plan_id) {
            return Err(OpsError::persistence(format!("plan not found: {plan_id}")));
        }

        let execution = ExecutionRef {
            execution_id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
        };
        state.executions.push(ExecutionEntry {
            execution: execution.clone(),
            context: context.clone(),
            status: ExecutionStatus::Pending,
            error: None,
            approval: ApprovalStatus::NotRequired,
        });
        debug!(execution_id = %execution.execution_id, plan_id = %plan_id, "execution stored");
        Ok(execution)
    }

    fn execution_status(&self, execution_id: &str) -> OpsResult<ExecutionStatus> {
        Ok(self.lock()?.entry_mut(execution_id)?.status)
    }

    fn update_execution_status(&self, execution_id: &str, status: ExecutionStatus) -> OpsResult<()> {
        let mut state = self.lock()?;
        let entry = state.entry_mut(execution_id)?;
        if entry.status.is_terminal() {
            return Err(OpsError::persistence(format!(
                "execution {execution_id} already {}",
                entry.status.as_str()
            )));
        }
        entry.status = status;
        Ok(())
    }

    fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> OpsResult<()> {
        if !status.is_terminal() {
            return Err(OpsError::persistence(format!(
                "'{}' is not a terminal status",
                status.as_str()
            )));
        }

        let mut state = self.lock()?;
        let event_count = state.chains.get(execution_id).map_or(0, |c| c.events.len());
        let terminal_hash = state
            .chains
            .get(execution_id)
            .map(|c| c.last_hash.clone())
            .unwrap_or_default();

        let entry = state.entry_mut(execution_id)?;
        entry.status = status;
        entry.error = error.map(str::to_string);

        info!(
            execution_id = %execution_id,
            status = status.as_str(),
            evidence_count = event_count,
            terminal_hash = %terminal_hash,
            "execution completed"
        );
        Ok(())
    }

    fn load_context(&self, execution_id: &str) -> OpsResult<ContextRef> {
        Ok(self.lock()?.entry_mut(execution_id)?.context.clone())
    }

    fn load_steps(&self, plan_id: &str) -> OpsResult<Vec<PlanStep>> {
        self.lock()?
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| OpsError::persistence(format!("plan not found: {plan_id}")))
    }

    fn approval_status(&self, execution_id: &str) -> OpsResult<ApprovalStatus> {
        Ok(self.lock()?.entry_mut(execution_id)?.approval)
    }

    fn insert_tool_call(&self, record: &ToolCallRecord) -> OpsResult<()> {
        let mut state = self.lock()?;
        if state
            .tool_calls
            .iter()
            .any(|r| r.tool_call_id == record.tool_call_id)
        {
            return Err(OpsError::persistence(format!(
                "duplicate tool call: {}",
                record.tool_call_id
            )));
        }
        state.tool_calls.push(record.clone());
        Ok(())
    }

    fn update_tool_call(&self, record: &ToolCallRecord) -> OpsResult<()> {
        let mut state = self.lock()?;
        let existing = state
            .tool_calls
            .iter_mut()
            .find(|r| r.tool_call_id == record.tool_call_id)
            .ok_or_else(|| {
                OpsError::persistence(format!("tool call not found: {}", record.tool_call_id))
            })?;
        *existing = record.clone();
        Ok(())
    }

    fn insert_evidence(&self, evidence: &Evidence) -> OpsResult<()> {
        let mut state = self.lock()?;
        let event = state
            .chains
            .entry(evidence.execution_id.clone())
            .or_insert_with(Chain::new)
            .append(&evidence.execution_id, evidence);
        debug!(
            execution_id = %event.execution_id,
            sequence = event.sequence,
            this_hash = %event.this_hash,
            "evidence appended"
        );
        Ok(())
    }
}

// ── Blob store ────────────────────────────────────────────────────────────────

/// Payload store keyed by `mem://<key>` references.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, (String, Vec<u8>)>>>,
}

impl InMemoryBlobStore {
    pub const SCHEME: &'static str = "mem://";

    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes stored under `reference`, if any.
    pub fn get(&self, reference: &str) -> OpsResult<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| OpsError::persistence(format!("blob lock poisoned: {e}")))?;
        Ok(blobs.get(reference).map(|(_, bytes)| bytes.clone()))
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> OpsResult<String> {
        let reference = format!("{}{key}", Self::SCHEME);
        self.blobs
            .lock()
            .map_err(|e| OpsError::persistence(format!("blob lock poisoned: {e}")))?
            .insert(reference.clone(), (content_type.to_string(), bytes.to_vec()));
        Ok(reference)
    }

    fn presign(&self, reference: &str, ttl: Duration) -> OpsResult<String> {
        if self.get(reference)?.is_none() {
            return Err(OpsError::persistence(format!("blob not found: {reference}")));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{reference}?expires={expires}"))
    }
}
