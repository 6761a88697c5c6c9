//! # opsgate-core
//!
//! The plan step executor for the opsgate runtime.
//!
//! This crate provides:
//! - The collaborator traits (`Store`, `BlobStore`, `ToolDispatcher`, `ApiClient`)
//! - The `PlanExecutor` that drives act/verify stages with rollback
//! - The `Activities` adapter for durable workflow engines
//! - Evidence derivation and secret redaction shared with the router
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opsgate_core::{PlanExecutor, executor::ExecutorConfig, traits::{Store, ToolDispatcher}};
//! ```

pub mod activities;
pub mod evidence;
pub mod executor;
pub mod redact;
pub mod traits;

pub use activities::Activities;
pub use executor::PlanExecutor;
