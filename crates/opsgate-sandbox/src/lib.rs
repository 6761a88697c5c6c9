//! # opsgate-sandbox
//!
//! Where argv actually runs.
//!
//! - `validate_argv` rejects shell metacharacters and empty arguments
//! - `Sandbox` enforces the `SandboxConfig` policy and runs argv as a direct
//!   subprocess or inside a container
//! - `EgressProxy` constrains outbound traffic to an allowlist
//! - `ProcessRunner` is the seam between policy and `std::process`

pub mod process;
pub mod proxy;
pub mod sandbox;
pub mod validate;

pub use process::{HostProcessRunner, ProcessOutput, ProcessRunner, ProcessSpec};
pub use proxy::{is_host_allowed, validate_allowlist, EgressProxy};
pub use sandbox::{cap_output, Invocation, Sandbox, TRUNCATION_SUFFIX};
pub use validate::validate_argv;
