//! # opsgate-config
//!
//! One TOML document configures a process: the sandbox policy, executor
//! timing, log hub limits and the HTTP endpoints used for API fallback.
//! Every section is optional and the defaults are fail-secure.
//!
//! ```toml
//! [sandbox]
//! enabled = true
//! image = "ghcr.io/example/ops-tools:1.4"
//! seccomp_profile = "/etc/opsgate/seccomp.json"
//! no_new_privileges = true
//! run_as_user = "65534"
//! drop_capabilities = ["ALL"]
//! egress_allowlist = ["*.svc.cluster.local", "api.github.com"]
//! proxy_bind = "0.0.0.0"
//!
//! [executor]
//! step_timeout_secs = 120
//!
//! [api.prometheus]
//! base_url = "http://prometheus:9090"
//!
//! [api.gh]
//! base_url = "https://api.github.com"
//! token_env = "GITHUB_TOKEN"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opsgate_contracts::{
    error::{OpsError, OpsResult},
    sandbox::SandboxConfig,
};
use opsgate_sandbox::validate_allowlist;

/// Poll loop and per-step limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub batch_limit: usize,
    pub step_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Lifetime of presigned evidence links.
    pub presign_ttl_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            step_timeout_secs: 300,
            poll_interval_ms: 2000,
            presign_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl ExecutorSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogHubSettings {
    pub history_lines: usize,
    pub max_keys: usize,
    pub subscriber_buffer: usize,
}

impl Default for LogHubSettings {
    fn default() -> Self {
        Self {
            history_lines: 500,
            max_keys: 1000,
            subscriber_buffer: 256,
        }
    }
}

/// HTTP endpoint of one tool's API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub base_url: String,
    /// Environment variable holding the bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl ApiEndpoint {
    /// The bearer token, if `token_env` names a set, non-empty variable.
    pub fn token(&self) -> Option<String> {
        let var = self.token_env.as_deref()?;
        match std::env::var(var) {
            Ok(token) if !token.is_empty() => Some(token),
            _ => {
                warn!(variable = %var, "api token variable is unset");
                None
            }
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub sandbox: SandboxConfig,
    pub executor: ExecutorSettings,
    pub log_hub: LogHubSettings,
    /// Keyed by tool name.
    pub api: BTreeMap<String, ApiEndpoint>,
}

impl OpsConfig {
    /// Parse `s` as TOML and validate the result.
    ///
    /// Returns `OpsError::Config` if the TOML is malformed, does not match
    /// the schema, or fails `validate`.
    pub fn from_toml_str(s: &str) -> OpsResult<Self> {
        let config: OpsConfig = toml::from_str(s).map_err(|e| OpsError::Config {
            reason: format!("failed to parse config TOML: {e}"),
        })?;
        config.validate()?;
        debug!(
            sandbox_enabled = config.sandbox.enabled,
            enforce = config.sandbox.enforce,
            api_endpoints = config.api.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Read and parse the file at `path`.
    pub fn from_file(path: &Path) -> OpsResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| OpsError::Config {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> OpsResult<()> {
        validate_allowlist(&self.sandbox.egress_allowlist)?;
        if self.executor.step_timeout_secs == 0 {
            return Err(OpsError::Config {
                reason: "executor.step_timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.executor.batch_limit == 0 {
            return Err(OpsError::Config {
                reason: "executor.batch_limit must be greater than zero".to_string(),
            });
        }
        for (tool, endpoint) in &self.api {
            if endpoint.base_url.trim().is_empty() {
                return Err(OpsError::Config {
                    reason: format!("api.{tool}.base_url is empty"),
                });
            }
        }
        if self.sandbox.container_proxy_unreachable() {
            return Err(OpsError::Config {
                reason: format!(
                    "sandbox.proxy_bind {:?} is loopback; containers reach the egress proxy through the host gateway",
                    self.sandbox.proxy_bind
                ),
            });
        }
        if self.sandbox.enabled && !self.sandbox.enforce {
            warn!("sandbox enabled without enforcement; hardening preconditions are not checked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_is_fail_secure() {
        let config = OpsConfig::from_toml_str("").unwrap();
        assert!(config.sandbox.enforce);
        assert!(!config.sandbox.enabled);
        assert_eq!(config.sandbox.max_output_bytes, 1024 * 1024);
        assert_eq!(config.executor.step_timeout(), Duration::from_secs(300));
        assert_eq!(config.executor.batch_limit, 10);
        assert_eq!(config.executor.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.log_hub, LogHubSettings::default());
        assert!(config.api.is_empty());
    }

    #[test]
    fn full_document_parses() {
        let config = OpsConfig::from_toml_str(
            r#"
            [sandbox]
            enabled = true
            image = "tools:1"
            seccomp_profile = "/etc/seccomp.json"
            no_new_privileges = true
            run_as_user = "65534"
            drop_capabilities = ["ALL"]
            egress_allowlist = ["*.example.com", "api.github.com"]

            [[sandbox.mounts]]
            source = "/etc/kube"
            target = "/root/.kube"
            read_only = true

            [executor]
            step_timeout_secs = 60

            [log_hub]
            history_lines = 50

            [api.gh]
            base_url = "https://api.github.com"
            token_env = "GITHUB_TOKEN"
            "#,
        )
        .unwrap();

        assert!(config.sandbox.uses_container());
        assert_eq!(config.sandbox.mounts[0].to_volume_arg(), "/etc/kube:/root/.kube:ro");
        assert_eq!(config.executor.step_timeout_secs, 60);
        assert_eq!(config.executor.batch_limit, 10);
        assert_eq!(config.log_hub.history_lines, 50);
        assert_eq!(config.log_hub.max_keys, 1000);
        assert_eq!(config.api["gh"].token_env.as_deref(), Some("GITHUB_TOKEN"));
    }

    #[test]
    fn shipped_demo_config_parses() {
        let config = OpsConfig::from_toml_str(include_str!("../../../demos/opsgate.toml")).unwrap();
        assert!(config.sandbox.enabled);
        assert!(!config.sandbox.uses_container());
        assert!(config.api.contains_key("prometheus"));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = OpsConfig::from_toml_str("[sandbox\nenabled = ").unwrap_err();
        assert!(matches!(err, OpsError::Config { .. }));
        let err = OpsConfig::from_toml_str("[executor]\nbatch_limit = \"ten\"").unwrap_err();
        assert!(matches!(err, OpsError::Config { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        for doc in [
            "[sandbox]\negress_allowlist = [\"*.\"]",
            "[sandbox]\negress_allowlist = [\"\"]",
            "[executor]\nstep_timeout_secs = 0",
            "[api.grafana]\nbase_url = \" \"",
        ] {
            assert!(
                matches!(OpsConfig::from_toml_str(doc), Err(OpsError::Config { .. })),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn container_egress_rejects_loopback_proxy_bind() {
        let doc = r#"
            [sandbox]
            enabled = true
            image = "tools:1"
            egress_allowlist = ["api.github.com"]
        "#;
        let err = OpsConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("proxy_bind"));

        let fixed = format!("{doc}\nproxy_bind = \"0.0.0.0\"\n");
        assert!(OpsConfig::from_toml_str(&fixed).is_ok());
        // Direct subprocesses reach a loopback proxy fine.
        assert!(OpsConfig::from_toml_str(
            "[sandbox]\nenabled = true\negress_allowlist = [\"api.github.com\"]"
        )
        .is_ok());
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\nenforce = false").unwrap();
        let config = OpsConfig::from_file(file.path()).unwrap();
        assert!(!config.sandbox.enforce);

        let err = OpsConfig::from_file(Path::new("/nonexistent/opsgate.toml")).unwrap_err();
        assert!(matches!(err, OpsError::Config { .. }));
    }

    #[test]
    fn token_comes_from_the_environment() {
        let endpoint = ApiEndpoint {
            base_url: "http://grafana".to_string(),
            token_env: Some("OPSGATE_TEST_GRAFANA_TOKEN".to_string()),
        };
        assert_eq!(endpoint.token(), None);
        std::env::set_var("OPSGATE_TEST_GRAFANA_TOKEN", "glsa_123");
        assert_eq!(endpoint.token().as_deref(), Some("glsa_123"));
        std::env::remove_var("OPSGATE_TEST_GRAFANA_TOKEN");
    }
}
