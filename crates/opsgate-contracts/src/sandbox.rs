//! Declarative sandbox execution policy.
//!
//! Supplied once at process start. The default value is fail-secure:
//! enforcement on, sandbox disabled, so every run is rejected until an
//! operator configures an enabled, hardened sandbox (or explicitly turns
//! enforcement off).

use serde::{Deserialize, Serialize};

/// Default cap on captured tool output.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A bind mount into the sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Render as a container runtime `-v` value.
    pub fn to_volume_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Sandbox policy for every tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Run tools under the sandbox (container when `image` is set).
    pub enabled: bool,
    /// Refuse to run anything unless the sandbox is enabled and hardened.
    pub enforce: bool,
    /// Container runtime binary, e.g. "docker" or "podman".
    pub runtime: String,
    /// Container image. Without one, tools run as direct subprocesses.
    pub image: Option<String>,
    /// Hosts reachable through the egress proxy. Exact or `*.suffix`.
    pub egress_allowlist: Vec<String>,
    /// Address the per-run egress proxy binds to (port is ephemeral).
    /// Containers reach it through the host gateway, so container mode
    /// needs a non-loopback address such as `0.0.0.0` or the bridge IP.
    pub proxy_bind: String,
    pub mounts: Vec<Mount>,
    pub read_only_root: bool,
    /// tmpfs mount points; `/tmp` is used when empty.
    pub tmpfs: Vec<String>,
    pub run_as_user: Option<String>,
    pub seccomp_profile: Option<String>,
    pub no_new_privileges: bool,
    pub drop_capabilities: Vec<String>,
    pub require_seccomp: bool,
    pub require_no_new_privileges: bool,
    pub require_user: bool,
    pub require_drop_capabilities: bool,
    /// Reject write actions unless the sandbox is enabled.
    pub require_enabled_for_writes: bool,
    /// Reject every action unless the sandbox is enabled with a non-empty
    /// egress allowlist.
    pub require_egress_allowlist: bool,
    /// Output cap in bytes; 0 disables the cap.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enforce: true,
            runtime: "docker".to_string(),
            image: None,
            egress_allowlist: Vec::new(),
            proxy_bind: "127.0.0.1".to_string(),
            mounts: Vec::new(),
            read_only_root: false,
            tmpfs: Vec::new(),
            run_as_user: None,
            seccomp_profile: None,
            no_new_privileges: false,
            drop_capabilities: Vec::new(),
            require_seccomp: false,
            require_no_new_privileges: false,
            require_user: false,
            require_drop_capabilities: false,
            require_enabled_for_writes: false,
            require_egress_allowlist: false,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SandboxConfig {
    /// A policy with enforcement off: argv runs directly on the host.
    pub fn permissive() -> Self {
        Self {
            enforce: false,
            ..Self::default()
        }
    }

    /// Whether runs go through the container runtime.
    pub fn uses_container(&self) -> bool {
        self.enabled && self.image.as_deref().is_some_and(|i| !i.trim().is_empty())
    }

    pub fn proxy_bind_is_loopback(&self) -> bool {
        let bind = self.proxy_bind.trim();
        bind.eq_ignore_ascii_case("localhost")
            || bind
                .trim_matches(|c| c == '[' || c == ']')
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback())
    }

    /// Whether containers would be pointed at a proxy they cannot reach.
    pub fn container_proxy_unreachable(&self) -> bool {
        self.uses_container() && !self.egress_allowlist.is_empty() && self.proxy_bind_is_loopback()
    }
}
