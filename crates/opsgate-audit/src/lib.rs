//! # opsgate-audit
//!
//! Append-only, SHA-256 hash-chained evidence trail and the in-memory
//! collaborators for the opsgate runtime.
//!
//! ## Overview
//!
//! Every evidence record the executor inserts is wrapped in an
//! `EvidenceEvent` linked to the previous event of the same execution by
//! its hash. Changing a stored record breaks the chain, which
//! `verify_chain` detects.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opsgate_audit::{InMemoryStore, InMemoryBlobStore};
//!
//! let store = InMemoryStore::new();
//! store.put_plan("plan-1", steps)?;
//! let execution = store.create_execution("plan-1", &context)?;
//! // ... run the executor ...
//! assert!(store.verify_integrity(&execution.execution_id)?);
//! ```

pub mod chain;
pub mod event;
pub mod memory;

pub use chain::{hash_event, verify_chain};
pub use event::{EvidenceEvent, EvidenceLog};
pub use memory::{InMemoryBlobStore, InMemoryStore};

// ── Tests ─────────────────────────────────────────────────────────────────────
