//! # opsgate-contracts
//!
//! Shared types, schemas, and contracts for the opsgate runtime.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate, only data definitions, the error taxonomy and the
//! cancellation primitive every blocking call receives.

pub mod artifact;
pub mod cancel;
pub mod error;
pub mod evidence;
pub mod log;
pub mod plan;
pub mod sandbox;
pub mod tool;
