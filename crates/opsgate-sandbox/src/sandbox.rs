//! Policy-enforcing process and container execution.
//!
//! | enforce | enabled | behaviour                                         |
//! |---------|---------|---------------------------------------------------|
//! | false   | any     | run argv directly, `require_*` flags still apply  |
//! | true    | false   | reject every run with "sandbox required"          |
//! | true    | true    | all hardening preconditions must hold             |
//!
//! With `enabled` and an image the argv runs inside a container; otherwise
//! it runs as a direct subprocess. Either way, a non-empty egress allowlist
//! starts an `EgressProxy` for the duration of the run.

use std::sync::Arc;

use tracing::{debug, info};

use opsgate_contracts::{
    cancel::Budget,
    error::{OpsError, OpsResult},
    sandbox::{Mount, SandboxConfig},
};

use crate::{
    process::{HostProcessRunner, ProcessRunner, ProcessSpec},
    proxy::EgressProxy,
    validate::validate_argv,
};

/// Literal appended to output cut at the cap.
pub const TRUNCATION_SUFFIX: &[u8] = b"...(truncated)";

/// Host alias a container uses to reach the proxy on the host.
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

const PROXY_ENV_KEYS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Cap `output` at `max` bytes (0 = no cap), appending the truncation suffix
/// when anything was cut.
pub fn cap_output(mut output: Vec<u8>, max: usize) -> Vec<u8> {
    if max > 0 && output.len() > max {
        output.truncate(max);
        output.extend_from_slice(TRUNCATION_SUFFIX);
    }
    output
}

/// One argv to run, plus per-run mounts (materialised artifacts).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub extra_mounts: Vec<Mount>,
}

impl Invocation {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            extra_mounts: Vec::new(),
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.extra_mounts.push(mount);
        self
    }
}

/// Executes argv under a `SandboxConfig`.
pub struct Sandbox {
    config: SandboxConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl Default for Sandbox {
    /// Fail-secure: enforcement on, sandbox disabled.
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            runner: Arc::new(HostProcessRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check the enforce/enabled state machine and hardening preconditions.
    pub fn check_preconditions(&self) -> OpsResult<()> {
        let c = &self.config;
        if c.enforce && !c.enabled {
            return Err(OpsError::SandboxRequired);
        }

        let hardened = c.enforce && c.enabled;
        let checks = [
            (
                hardened || c.require_seccomp,
                c.seccomp_profile.as_deref().is_some_and(|p| !p.trim().is_empty()),
                "seccomp profile",
            ),
            (
                hardened || c.require_no_new_privileges,
                c.no_new_privileges,
                "no-new-privileges",
            ),
            (
                hardened || c.require_user,
                c.run_as_user.as_deref().is_some_and(|u| !u.trim().is_empty()),
                "run-as user",
            ),
            (
                hardened || c.require_drop_capabilities,
                !c.drop_capabilities.is_empty(),
                "dropped capabilities",
            ),
        ];
        for (required, present, name) in checks {
            if required && !present {
                return Err(OpsError::SandboxPrecondition {
                    missing: name.to_string(),
                });
            }
        }
        if c.container_proxy_unreachable() {
            return Err(OpsError::SandboxPrecondition {
                missing: "proxy_bind reachable from containers".to_string(),
            });
        }
        Ok(())
    }

    /// Run `invocation` and return its (capped) output.
    ///
    /// Exit status zero is success; anything else is `ToolFailed` carrying
    /// the tail of the output.
    pub fn run(&self, invocation: &Invocation, budget: &Budget) -> OpsResult<Vec<u8>> {
        self.check_preconditions()?;
        validate_argv(&invocation.argv)?;
        let binary = invocation.argv.first().cloned().ok_or_else(|| OpsError::InvalidInput {
            reason: "empty argv".to_string(),
        })?;

        let mut proxy = if self.config.egress_allowlist.is_empty() {
            None
        } else {
            Some(EgressProxy::start(
                &self.config.proxy_bind,
                self.config.egress_allowlist.clone(),
            )?)
        };
        let proxy_port = proxy.as_ref().map(EgressProxy::port);

        let spec = if self.config.uses_container() {
            let name = format!("opsgate-{}", uuid::Uuid::new_v4());
            let mut spec = ProcessSpec::new(
                self.config.runtime.clone(),
                self.container_args(&name, invocation, proxy_port),
            );
            spec.cleanup = Some(vec![
                self.config.runtime.clone(),
                "rm".to_string(),
                "-f".to_string(),
                name,
            ]);
            spec
        } else {
            let mut spec = ProcessSpec::new(binary.clone(), invocation.argv[1..].to_vec());
            if let Some(port) = proxy_port {
                let url = format!("http://{}:{port}", self.proxy_host());
                spec.env = proxy_env(&url);
            }
            spec
        };

        info!(
            binary = %binary,
            container = self.config.uses_container(),
            egress_proxy = proxy_port.is_some(),
            "sandbox run"
        );
        let result = self.runner.run(&spec, budget, self.config.max_output_bytes);
        if let Some(p) = proxy.as_mut() {
            p.shutdown();
        }
        let out = result?;

        let mut output = out.output;
        if out.truncated {
            output.extend_from_slice(TRUNCATION_SUFFIX);
        } else {
            output = cap_output(output, self.config.max_output_bytes);
        }

        if !out.exit_code.is_some_and(|c| c == 0) {
            let status = out
                .exit_code
                .map(|c| format!("exit status {c}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            let text = String::from_utf8_lossy(&output);
            let tail = tail_chars(text.trim(), 512);
            debug!(binary = %binary, status = %status, "sandboxed command failed");
            return Err(OpsError::ToolFailed {
                tool: binary,
                reason: if tail.is_empty() {
                    status
                } else {
                    format!("{status}: {tail}")
                },
            });
        }
        Ok(output)
    }

    /// Address the direct subprocess uses to reach the proxy.
    fn proxy_host(&self) -> &str {
        match self.config.proxy_bind.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            bind => bind,
        }
    }

    /// Full container runtime argv for `invocation`.
    pub fn container_args(
        &self,
        name: &str,
        invocation: &Invocation,
        proxy_port: Option<u16>,
    ) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];

        if c.read_only_root {
            args.push("--read-only".to_string());
        }
        if c.tmpfs.is_empty() {
            args.extend(["--tmpfs".to_string(), "/tmp".to_string()]);
        } else {
            for t in &c.tmpfs {
                args.extend(["--tmpfs".to_string(), t.clone()]);
            }
        }
        if let Some(profile) = c.seccomp_profile.as_deref().filter(|p| !p.trim().is_empty()) {
            args.extend(["--security-opt".to_string(), format!("seccomp={profile}")]);
        }
        if c.no_new_privileges {
            args.extend(["--security-opt".to_string(), "no-new-privileges".to_string()]);
        }
        for cap in &c.drop_capabilities {
            args.extend(["--cap-drop".to_string(), cap.clone()]);
        }
        if let Some(user) = c.run_as_user.as_deref().filter(|u| !u.trim().is_empty()) {
            args.extend(["--user".to_string(), user.to_string()]);
        }
        for mount in c.mounts.iter().chain(invocation.extra_mounts.iter()) {
            args.extend(["-v".to_string(), mount.to_volume_arg()]);
        }

        match proxy_port {
            None => args.push("--network=none".to_string()),
            Some(port) => {
                args.push(format!("--add-host={HOST_GATEWAY_ALIAS}:host-gateway"));
                let url = format!("http://{HOST_GATEWAY_ALIAS}:{port}");
                for (key, value) in proxy_env(&url) {
                    args.extend(["-e".to_string(), format!("{key}={value}")]);
                }
            }
        }

        if let Some(image) = &c.image {
            args.push(image.clone());
        }
        args.extend(invocation.argv.iter().cloned());
        args
    }
}

/// The last `max` characters of `text`.
fn tail_chars(text: &str, max: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(max.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    &text[start..]
}

fn proxy_env(url: &str) -> Vec<(String, String)> {
    PROXY_ENV_KEYS
        .iter()
        .map(|k| (k.to_string(), url.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use opsgate_contracts::{
        cancel::Budget,
        error::{OpsError, OpsResult},
        sandbox::{Mount, SandboxConfig},
    };

    use crate::process::{ProcessOutput, ProcessRunner, ProcessSpec};

    use super::{cap_output, Invocation, Sandbox, TRUNCATION_SUFFIX};

    // ── Mock helpers ─────────────────────────────────────────────────────────

    /// Records every spec and replies with a fixed output.
    struct ScriptedRunner {
        exit_code: Option<i32>,
        output: Vec<u8>,
        specs: Mutex<Vec<ProcessSpec>>,
        /// Whether a proxy port in the env was connectable during the run.
        proxy_reachable: Mutex<Option<bool>>,
    }

    impl ScriptedRunner {
        fn new(exit_code: i32, output: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                exit_code: Some(exit_code),
                output: output.to_vec(),
                specs: Mutex::new(vec![]),
                proxy_reachable: Mutex::new(None),
            })
        }

        fn last(&self) -> ProcessSpec {
            self.specs.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn run(&self, spec: &ProcessSpec, _budget: &Budget, max_output: usize) -> OpsResult<ProcessOutput> {
            self.specs.lock().unwrap().push(spec.clone());
            if let Some((_, url)) = spec.env.iter().find(|(k, _)| k == "HTTP_PROXY") {
                let addr = url.trim_start_matches("http://");
                *self.proxy_reachable.lock().unwrap() = Some(TcpStream::connect(addr).is_ok());
            }
            let mut output = self.output.clone();
            let truncated = max_output > 0 && output.len() > max_output;
            if truncated {
                output.truncate(max_output);
            }
            Ok(ProcessOutput {
                exit_code: self.exit_code,
                output,
                truncated,
            })
        }
    }

    fn hardened() -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            enforce: true,
            image: Some("ops/tools:1.4".to_string()),
            seccomp_profile: Some("/etc/opsgate/seccomp.json".to_string()),
            no_new_privileges: true,
            run_as_user: Some("65532:65532".to_string()),
            drop_capabilities: vec!["ALL".to_string()],
            read_only_root: true,
            ..SandboxConfig::default()
        }
    }

    fn argv(items: &[&str]) -> Invocation {
        Invocation::new(items.iter().map(|s| s.to_string()).collect())
    }

    fn budget() -> Budget {
        Budget::detached(Duration::from_secs(30))
    }

    // ── Enforcement state machine ────────────────────────────────────────────

    #[test]
    fn default_sandbox_rejects_every_run() {
        let runner = ScriptedRunner::new(0, b"");
        let sandbox = Sandbox::default().with_runner(runner.clone());

        let err = sandbox.run(&argv(&["kubectl", "get", "pods"]), &budget()).unwrap_err();
        assert_eq!(err, OpsError::SandboxRequired);
        assert_eq!(err.to_string(), "sandbox required");
        assert!(runner.specs.lock().unwrap().is_empty());
    }

    #[test]
    fn enabled_sandbox_requires_every_hardening_flag() {
        let cases: [(fn(&mut SandboxConfig), &str); 4] = [
            (|c| c.seccomp_profile = None, "seccomp profile"),
            (|c| c.no_new_privileges = false, "no-new-privileges"),
            (|c| c.run_as_user = None, "run-as user"),
            (|c| c.drop_capabilities.clear(), "dropped capabilities"),
        ];
        for (weaken, missing) in cases {
            let mut config = hardened();
            weaken(&mut config);
            let err = Sandbox::new(config).check_preconditions().unwrap_err();
            assert_eq!(err, OpsError::SandboxPrecondition { missing: missing.to_string() });
        }
        assert!(Sandbox::new(hardened()).check_preconditions().is_ok());
    }

    #[test]
    fn require_flags_apply_without_enforcement() {
        let config = SandboxConfig {
            require_user: true,
            ..SandboxConfig::permissive()
        };
        let err = Sandbox::new(config).check_preconditions().unwrap_err();
        assert!(matches!(err, OpsError::SandboxPrecondition { .. }));
    }

    #[test]
    fn permissive_sandbox_runs_directly() {
        let runner = ScriptedRunner::new(0, b"deployment.apps/app scaled");
        let sandbox = Sandbox::new(SandboxConfig::permissive()).with_runner(runner.clone());

        let out = sandbox
            .run(&argv(&["kubectl", "scale", "deploy/app", "--replicas=3"]), &budget())
            .unwrap();
        assert_eq!(out, b"deployment.apps/app scaled".to_vec());

        let spec = runner.last();
        assert_eq!(spec.program, "kubectl");
        assert_eq!(spec.args, vec!["scale", "deploy/app", "--replicas=3"]);
        assert!(spec.env.is_empty());
        assert!(spec.cleanup.is_none());
    }

    #[test]
    fn dangerous_argv_never_reaches_the_runner() {
        let runner = ScriptedRunner::new(0, b"");
        let sandbox = Sandbox::new(SandboxConfig::permissive()).with_runner(runner.clone());
        let err = sandbox.run(&argv(&["kubectl", "get", "pods;rm"]), &budget()).unwrap_err();
        assert!(matches!(err, OpsError::DangerousArgument { index: 2, .. }));
        assert!(runner.specs.lock().unwrap().is_empty());
    }

    // ── Container argv ───────────────────────────────────────────────────────

    #[test]
    fn container_without_allowlist_has_no_network() {
        let runner = ScriptedRunner::new(0, b"ok");
        let mut config = hardened();
        config.mounts.push(Mount {
            source: "/etc/kube".to_string(),
            target: "/kube".to_string(),
            read_only: true,
        });
        let sandbox = Sandbox::new(config).with_runner(runner.clone());

        let invocation = argv(&["helm", "status", "web"]).with_mount(Mount {
            source: "/tmp/values.yaml".to_string(),
            target: "/work/values.yaml".to_string(),
            read_only: true,
        });
        sandbox.run(&invocation, &budget()).unwrap();

        let spec = runner.last();
        assert_eq!(spec.program, "docker");
        let name = spec.args[3].clone();
        assert!(name.starts_with("opsgate-"));
        assert_eq!(
            spec.args,
            vec![
                "run", "--rm", "--name", name.as_str(),
                "--read-only",
                "--tmpfs", "/tmp",
                "--security-opt", "seccomp=/etc/opsgate/seccomp.json",
                "--security-opt", "no-new-privileges",
                "--cap-drop", "ALL",
                "--user", "65532:65532",
                "-v", "/etc/kube:/kube:ro",
                "-v", "/tmp/values.yaml:/work/values.yaml:ro",
                "--network=none",
                "ops/tools:1.4",
                "helm", "status", "web",
            ]
        );
        assert_eq!(
            spec.cleanup,
            Some(vec!["docker".to_string(), "rm".to_string(), "-f".to_string(), name])
        );
    }

    #[test]
    fn container_with_allowlist_gets_proxy_and_gateway_alias() {
        let mut config = hardened();
        config.egress_allowlist = vec!["*.github.com".to_string()];
        config.tmpfs = vec!["/tmp".to_string(), "/home/tool".to_string()];
        let sandbox = Sandbox::new(config);

        let args = sandbox.container_args("opsgate-x", &argv(&["gh", "pr", "view", "1"]), Some(41000));
        assert!(!args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--add-host=host.docker.internal:host-gateway".to_string()));
        assert!(args.contains(&"HTTPS_PROXY=http://host.docker.internal:41000".to_string()));
        assert!(args.contains(&"http_proxy=http://host.docker.internal:41000".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--tmpfs").count(), 2);
        assert_eq!(&args[args.len() - 5..], ["ops/tools:1.4", "gh", "pr", "view", "1"]);
    }

    #[test]
    fn container_egress_needs_a_reachable_proxy_bind() {
        let runner = ScriptedRunner::new(0, b"");
        let mut config = hardened();
        config.egress_allowlist = vec!["api.github.com".to_string()];
        let sandbox = Sandbox::new(config.clone()).with_runner(runner.clone());
        let err = sandbox.run(&argv(&["gh", "pr", "view", "1"]), &budget()).unwrap_err();
        assert_eq!(
            err,
            OpsError::SandboxPrecondition {
                missing: "proxy_bind reachable from containers".to_string()
            }
        );
        assert!(runner.specs.lock().unwrap().is_empty());

        for bind in ["localhost", "::1", "127.0.0.2"] {
            config.proxy_bind = bind.to_string();
            assert!(Sandbox::new(config.clone()).check_preconditions().is_err(), "{bind}");
        }
        config.proxy_bind = "0.0.0.0".to_string();
        assert!(Sandbox::new(config).check_preconditions().is_ok());
    }

    #[test]
    fn direct_run_with_allowlist_injects_live_proxy() {
        let runner = ScriptedRunner::new(0, b"");
        let config = SandboxConfig {
            egress_allowlist: vec!["api.github.com".to_string()],
            ..SandboxConfig::permissive()
        };
        let sandbox = Sandbox::new(config).with_runner(runner.clone());
        sandbox.run(&argv(&["gh", "pr", "view", "7"]), &budget()).unwrap();

        let spec = runner.last();
        let url = &spec.env.iter().find(|(k, _)| k == "HTTPS_PROXY").unwrap().1;
        assert!(url.starts_with("http://127.0.0.1:"));
        assert_eq!(*runner.proxy_reachable.lock().unwrap(), Some(true));

        // The proxy is torn down once the run returns.
        let addr = url.trim_start_matches("http://").to_string();
        assert!(TcpStream::connect(addr).is_err());
    }

    // ── Output and exit status ───────────────────────────────────────────────

    #[test]
    fn output_over_cap_gets_suffix() {
        let runner = ScriptedRunner::new(0, b"0123456789");
        let config = SandboxConfig {
            max_output_bytes: 4,
            ..SandboxConfig::permissive()
        };
        let out = Sandbox::new(config)
            .with_runner(runner)
            .run(&argv(&["git", "log"]), &budget())
            .unwrap();
        assert_eq!(out, b"0123...(truncated)".to_vec());
    }

    #[test]
    fn nonzero_exit_is_tool_failure_with_output() {
        let runner = ScriptedRunner::new(1, b"Error from server (NotFound)\n");
        let err = Sandbox::new(SandboxConfig::permissive())
            .with_runner(runner)
            .run(&argv(&["kubectl", "get", "deploy/missing"]), &budget())
            .unwrap_err();
        match err {
            OpsError::ToolFailed { tool, reason } => {
                assert_eq!(tool, "kubectl");
                assert!(reason.starts_with("exit status 1"));
                assert!(reason.contains("NotFound"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cap_output_leaves_short_output_alone() {
        assert_eq!(cap_output(b"abc".to_vec(), 3), b"abc".to_vec());
        assert_eq!(cap_output(b"abcd".to_vec(), 0), b"abcd".to_vec());
        let capped = cap_output(b"abcd".to_vec(), 2);
        assert!(capped.ends_with(TRUNCATION_SUFFIX));
    }
}
