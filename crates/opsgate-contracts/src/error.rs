//! Runtime error types for the opsgate dispatch and execution pipeline.
//!
//! All fallible operations return `OpsResult<T>`. Variants are grouped by
//! the failure class they represent so callers can decide between
//! fail-closed rejection, retry elsewhere, and rollback.

use thiserror::Error;

/// The unified error type for the opsgate runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpsError {
    // ── Rejections: fail closed, nothing was executed ────────────────────────
    /// The requested tool is not in the registry.
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    /// An argv entry contains a shell metacharacter.
    #[error("dangerous argument at position {index}: {argument:?}")]
    DangerousArgument { index: usize, argument: String },

    /// An argv entry is the empty string.
    #[error("empty argument at position {index}")]
    EmptyArgument { index: usize },

    /// No sandbox policy was supplied, or the policy requires an enabled
    /// sandbox and none is enabled.
    #[error("sandbox required")]
    SandboxRequired,

    /// The sandbox is enabled but a hardening precondition is not met.
    #[error("sandbox precondition not met: {missing}")]
    SandboxPrecondition { missing: String },

    /// The sandbox policy forbids this request (write on a disabled sandbox,
    /// missing egress allowlist).
    #[error("sandbox does not permit request: {reason}")]
    SandboxNotPermitted { reason: String },

    /// A required input field is missing or has the wrong shape.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    // ── Artifact resolution ──────────────────────────────────────────────────
    /// The artifact kind is not one of `git_path`, `object_store`, `inline`.
    #[error("unsupported artifact kind: {kind}")]
    UnsupportedArtifactKind { kind: String },

    /// The artifact ref or digest is syntactically invalid.
    #[error("invalid artifact ref: {reason}")]
    InvalidArtifactRef { reason: String },

    /// The fetched bytes do not match the pinned digest.
    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },

    /// The CLI needed to fetch this kind of artifact is not installed here.
    #[error("artifact resolver not implemented in this environment: {reason}")]
    ResolverUnavailable { reason: String },

    /// The fetch command ran and failed.
    #[error("artifact fetch failed: {reason}")]
    ArtifactFetch { reason: String },

    // ── Routing ──────────────────────────────────────────────────────────────
    /// Neither a CLI binary nor an API fallback is available for the tool.
    #[error("no CLI available for tool '{tool}'")]
    NoCli { tool: String },

    /// The tool supports API fallback but no client is configured for it.
    #[error("no API client configured for tool '{tool}'")]
    NoApiClient { tool: String },

    /// The tool has an API but the action has no HTTP mapping.
    #[error("action '{action}' of tool '{tool}' has no API mapping")]
    UnsupportedApiAction { tool: String, action: String },

    // ── Execution ────────────────────────────────────────────────────────────
    /// The external tool ran and reported failure.
    #[error("tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// The step deadline expired; the process or request was cancelled.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The execution context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An HTTP API call failed at the transport or status level.
    #[error("api call failed: {reason}")]
    Api { reason: String },

    // ── Rollback ─────────────────────────────────────────────────────────────
    /// The step declares no rollback operation.
    #[error("no rollback declared for step '{step_id}'")]
    NoRollback { step_id: String },

    /// One or more rollback attempts in a cascade failed.
    #[error("rollback failed: {reason}")]
    RollbackFailed { reason: String },

    // ── Persistence ──────────────────────────────────────────────────────────
    /// The store or blob store rejected a write or read.
    ///
    /// An unrecorded side effect is a correctness defect, so this always
    /// fails the step.
    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    // ── Configuration ────────────────────────────────────────────────────────
    /// A configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl OpsError {
    /// Return true if a caller may reasonably retry the operation, possibly
    /// on another worker. Rejections and tool failures are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OpsError::ResolverUnavailable { .. }
                | OpsError::Timeout { .. }
                | OpsError::Api { .. }
                | OpsError::Persistence { .. }
        )
    }

    /// Return true for fail-closed rejections that never reached a tool.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OpsError::UnknownTool { .. }
                | OpsError::DangerousArgument { .. }
                | OpsError::EmptyArgument { .. }
                | OpsError::SandboxRequired
                | OpsError::SandboxPrecondition { .. }
                | OpsError::SandboxNotPermitted { .. }
                | OpsError::InvalidInput { .. }
        )
    }

    /// Shorthand for a persistence error from any displayable cause.
    pub fn persistence(cause: impl std::fmt::Display) -> Self {
        OpsError::Persistence {
            reason: cause.to_string(),
        }
    }
}

/// Convenience alias used throughout the opsgate crates.
pub type OpsResult<T> = Result<T, OpsError>;
