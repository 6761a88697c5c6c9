//! # opsgate-tools
//!
//! Everything between "run tool X with input Y" and the sandbox:
//!
//! - `registry`: the static tool table (binary, API fallback, write and
//!   high-risk actions)
//! - `command`: deterministic argv builders per CLI family
//! - `api`: HTTP mappings and the `ureq` client for API fallback
//! - `artifact`: fetching and digest-checking external payloads
//! - `loghub`: per tool-call log history and live subscribers
//! - `router`: CLI-first, API-fallback dispatch
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opsgate_tools::{ApiClients, ToolRouter};
//!
//! let router = ToolRouter::default();
//! let response = router.execute(request, Some(&sandbox), &ApiClients::new(), &budget)?;
//! ```

pub mod api;
pub mod artifact;
pub mod command;
pub mod locate;
pub mod loghub;
pub mod registry;
pub mod router;

pub use api::{api_request, ApiClients, HttpApiClient};
pub use artifact::ArtifactResolver;
pub use command::build_argv;
pub use locate::{BinaryLocator, PathLocator, StaticLocator};
pub use loghub::{LogHub, Subscription};
pub use registry::ToolRegistry;
pub use router::{RoutedDispatcher, ToolRouter};
