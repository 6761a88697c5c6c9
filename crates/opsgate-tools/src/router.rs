//! CLI-first, API-fallback tool dispatch.
//!
//! `ToolRouter::execute` is the single entry point for running a tool:
//!
//! 1. assign a tool-call id
//! 2. refuse to run without a sandbox policy
//! 3. look the tool up in the registry and classify the action
//! 4. apply the policy's write and egress requirements
//! 5. run the CLI through the sandbox when its binary is installed,
//!    otherwise call the tool's HTTP API when it has one
//!
//! Every outcome is written to the `LogHub` under the tool-call id, and
//! every failure is logged at error level before it is returned.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use opsgate_contracts::{
    artifact::ArtifactRef,
    cancel::Budget,
    error::{OpsError, OpsResult},
    log::{LogLevel, LogLine},
    sandbox::Mount,
    tool::{ActionClass, ExecuteRequest, ExecuteResponse, ToolDescriptor, UsedPath},
};
use opsgate_core::{redact::redact_output, traits::ToolDispatcher};
use opsgate_sandbox::{cap_output, validate_argv, Invocation, Sandbox};

use crate::{
    api::{api_request, ApiClients},
    artifact::ArtifactResolver,
    command::build_argv,
    locate::{BinaryLocator, PathLocator},
    loghub::LogHub,
    registry::ToolRegistry,
};

/// Longest output excerpt written to a log line.
const LOG_PREVIEW_CHARS: usize = 2048;

/// Where a materialised values document appears inside a container.
const CONTAINER_VALUES_PATH: &str = "/opsgate/values.yaml";

fn preview(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(&redact_output(output)).into_owned();
    if text.chars().count() > LOG_PREVIEW_CHARS {
        let mut cut: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
        cut.push_str("...(truncated)");
        cut
    } else {
        text
    }
}

pub struct ToolRouter {
    registry: ToolRegistry,
    locator: Arc<dyn BinaryLocator>,
    resolver: ArtifactResolver,
    logs: LogHub,
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new(ToolRegistry::builtin())
    }
}

impl ToolRouter {
    /// A router over `registry` that resolves binaries on `PATH`.
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            locator: Arc::new(PathLocator),
            resolver: ArtifactResolver::default(),
            logs: LogHub::default(),
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn BinaryLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_resolver(mut self, resolver: ArtifactResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_log_hub(mut self, logs: LogHub) -> Self {
        self.logs = logs;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn logs(&self) -> &LogHub {
        &self.logs
    }

    /// Run one tool request.
    ///
    /// `sandbox` must be supplied even when permissive; `None` is rejected
    /// with `SandboxRequired` before anything else happens.
    pub fn execute(
        &self,
        mut request: ExecuteRequest,
        sandbox: Option<&Sandbox>,
        apis: &ApiClients,
        budget: &Budget,
    ) -> OpsResult<ExecuteResponse> {
        // ── Identity ──
        let tool_call_id = request
            .tool_call_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.tool_call_id = Some(tool_call_id.clone());

        // ── Policy gates ──
        let Some(sandbox) = sandbox else {
            warn!(tool_call_id = %tool_call_id, tool = %request.tool, "rejected: no sandbox policy");
            return Err(OpsError::SandboxRequired);
        };
        let descriptor = self.registry.lookup(&request.tool)?;
        let class = descriptor.classify(&request.action);
        self.check_policy(sandbox, class)?;

        self.log(
            &request,
            LogLevel::Info,
            format!(
                "start {} {} ({:?}, {:?} risk)",
                request.tool,
                request.action,
                class,
                descriptor.risk_tier(&request.action)
            ),
        );

        // ── Route ──
        let installed = descriptor
            .cli_binary
            .as_deref()
            .is_some_and(|binary| self.locator.locate(binary).is_some());
        let result = if installed {
            self.run_cli(&request, descriptor, sandbox, budget)
                .map(|out| (out, UsedPath::Cli))
        } else if descriptor.supports_api_fallback {
            self.run_api(&request, sandbox, apis, budget)
                .map(|out| (out, UsedPath::Api))
        } else {
            Err(OpsError::NoCli {
                tool: request.tool.clone(),
            })
        };

        match result {
            Ok((output, used_path)) => {
                info!(
                    tool_call_id = %tool_call_id,
                    execution_id = request.execution_id.as_deref().unwrap_or(""),
                    tool = %request.tool,
                    action = %request.action,
                    used_path = ?used_path,
                    bytes = output.len(),
                    "tool call succeeded"
                );
                self.log(&request, LogLevel::Info, preview(&output));
                Ok(ExecuteResponse {
                    tool_call_id,
                    output,
                    used_path,
                })
            }
            Err(e) => {
                let message = preview(e.to_string().as_bytes());
                error!(
                    tool_call_id = %tool_call_id,
                    execution_id = request.execution_id.as_deref().unwrap_or(""),
                    tool = %request.tool,
                    action = %request.action,
                    error = %message,
                    "tool call failed"
                );
                self.log(&request, LogLevel::Error, message);
                Err(e)
            }
        }
    }

    fn check_policy(&self, sandbox: &Sandbox, class: ActionClass) -> OpsResult<()> {
        let config = sandbox.config();
        if config.require_enabled_for_writes && class == ActionClass::Write && !sandbox.is_enabled() {
            return Err(OpsError::SandboxNotPermitted {
                reason: "write actions require an enabled sandbox".to_string(),
            });
        }
        if config.require_egress_allowlist
            && (config.egress_allowlist.is_empty() || !sandbox.is_enabled())
        {
            return Err(OpsError::SandboxNotPermitted {
                reason: "an enabled sandbox with a non-empty egress allowlist is required".to_string(),
            });
        }
        Ok(())
    }

    fn run_cli(
        &self,
        request: &ExecuteRequest,
        descriptor: &ToolDescriptor,
        sandbox: &Sandbox,
        budget: &Budget,
    ) -> OpsResult<Vec<u8>> {
        let mut input = request.input.clone();
        let mut mounts = Vec::new();

        // Removed from disk when dropped, whatever the outcome.
        let values_file = if descriptor.name == "helm" && request.action == "upgrade" {
            self.materialise_values(&mut input, sandbox, &mut mounts, budget)?
        } else {
            None
        };

        let argv = build_argv(&descriptor.name, &request.action, &input);
        validate_argv(&argv)?;
        debug!(tool_call_id = request.tool_call_id.as_deref().unwrap_or(""), argv = ?argv, "cli path");

        let invocation = mounts
            .into_iter()
            .fold(Invocation::new(argv), Invocation::with_mount);
        let result = sandbox.run(&invocation, budget);
        drop(values_file);
        result
    }

    /// Resolve `input.values_ref` into a temp file and point
    /// `input.values_file` at it.
    fn materialise_values(
        &self,
        input: &mut Value,
        sandbox: &Sandbox,
        mounts: &mut Vec<Mount>,
        budget: &Budget,
    ) -> OpsResult<Option<NamedTempFile>> {
        let Some(raw) = input.get("values_ref").filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let artifact: ArtifactRef =
            serde_json::from_value(raw.clone()).map_err(|e| OpsError::InvalidInput {
                reason: format!("values_ref: {e}"),
            })?;
        let bytes = self.resolver.resolve(&artifact, budget)?;

        let stage_err = |e: std::io::Error| OpsError::ArtifactFetch {
            reason: format!("cannot stage values file: {e}"),
        };
        let mut file = tempfile::Builder::new()
            .prefix("opsgate-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(stage_err)?;
        file.write_all(&bytes).map_err(stage_err)?;
        file.flush().map_err(stage_err)?;

        let host_path = file.path().to_string_lossy().into_owned();
        let visible_path = if sandbox.config().uses_container() {
            mounts.push(Mount {
                source: host_path,
                target: CONTAINER_VALUES_PATH.to_string(),
                read_only: true,
            });
            CONTAINER_VALUES_PATH.to_string()
        } else {
            host_path
        };
        input["values_file"] = Value::String(visible_path);
        Ok(Some(file))
    }

    fn run_api(
        &self,
        request: &ExecuteRequest,
        sandbox: &Sandbox,
        apis: &ApiClients,
        budget: &Budget,
    ) -> OpsResult<Vec<u8>> {
        let client = apis.get(&request.tool).ok_or_else(|| OpsError::NoApiClient {
            tool: request.tool.clone(),
        })?;
        let api = api_request(&request.tool, &request.action, &request.input)?;
        debug!(
            tool_call_id = request.tool_call_id.as_deref().unwrap_or(""),
            method = %api.method,
            path = %api.path,
            "api path"
        );
        let body = client.call(&api, budget)?;
        Ok(cap_output(body, sandbox.config().max_output_bytes))
    }

    fn log(&self, request: &ExecuteRequest, level: LogLevel, message: String) {
        self.logs.publish(LogLine {
            tool_call_id: request.tool_call_id.clone().unwrap_or_default(),
            execution_id: request.execution_id.clone(),
            tool: request.tool.clone(),
            action: request.action.clone(),
            level,
            message,
            timestamp: Utc::now(),
        });
    }
}

/// `ToolDispatcher` that sends every request through a `ToolRouter` with a
/// fixed sandbox policy and API clients.
pub struct RoutedDispatcher {
    router: Arc<ToolRouter>,
    sandbox: Option<Sandbox>,
    apis: ApiClients,
}

impl RoutedDispatcher {
    pub fn new(router: Arc<ToolRouter>, sandbox: Option<Sandbox>, apis: ApiClients) -> Self {
        Self {
            router,
            sandbox,
            apis,
        }
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }
}

impl ToolDispatcher for RoutedDispatcher {
    fn dispatch(&self, mut request: ExecuteRequest, budget: &Budget) -> OpsResult<ExecuteResponse> {
        let tool_call_id = request
            .tool_call_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.tool_call_id = Some(tool_call_id.clone());

        let result = self
            .router
            .execute(request, self.sandbox.as_ref(), &self.apis, budget);
        if budget.is_cancelled() {
            debug!(tool_call_id = %tool_call_id, "execution cancelled, closing log feeds");
            self.router.logs().close(&tool_call_id);
        }
        result
    }

    fn on_cancel(&self) {
        self.router.logs().close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use opsgate_audit::InMemoryStore;
    use opsgate_contracts::{cancel::CancelToken, sandbox::SandboxConfig};
    use opsgate_core::{
        executor::ExecutorConfig,
        traits::{ApiClient, ApiRequest},
        PlanExecutor,
    };
    use opsgate_sandbox::{ProcessOutput, ProcessRunner, ProcessSpec};

    use super::*;
    use crate::locate::StaticLocator;

    // ── Fakes ────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingRunner {
        exit_code: i32,
        output: Vec<u8>,
        seen: Mutex<Vec<ProcessSpec>>,
        /// (path, content) of any `--values` file at the moment of the run.
        values: Mutex<Option<(String, String)>>,
    }

    impl ProcessRunner for RecordingRunner {
        fn run(&self, spec: &ProcessSpec, _budget: &Budget, _max: usize) -> OpsResult<ProcessOutput> {
            if let Some(pos) = spec.args.iter().position(|a| a == "--values") {
                let path = spec.args[pos + 1].clone();
                let content = std::fs::read_to_string(&path).unwrap_or_default();
                *self.values.lock().unwrap() = Some((path, content));
            }
            self.seen.lock().unwrap().push(spec.clone());
            Ok(ProcessOutput {
                exit_code: Some(self.exit_code),
                output: self.output.clone(),
                truncated: false,
            })
        }
    }

    /// Cancels the run's token mid-flight, as an operator would.
    struct CancellingRunner {
        token: CancelToken,
    }

    impl ProcessRunner for CancellingRunner {
        fn run(&self, _spec: &ProcessSpec, budget: &Budget, _max: usize) -> OpsResult<ProcessOutput> {
            self.token.cancel();
            budget.check()?;
            unreachable!("budget was cancelled")
        }
    }

    struct FakeApi {
        body: Vec<u8>,
        calls: Mutex<Vec<ApiRequest>>,
    }

    impl FakeApi {
        fn new(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: body.to_vec(),
                calls: Mutex::new(vec![]),
            })
        }
    }

    impl ApiClient for FakeApi {
        fn call(&self, request: &ApiRequest, _budget: &Budget) -> OpsResult<Vec<u8>> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(self.body.clone())
        }
    }

    fn runner(output: &[u8]) -> Arc<RecordingRunner> {
        Arc::new(RecordingRunner {
            output: output.to_vec(),
            ..Default::default()
        })
    }

    fn sandbox_with(config: SandboxConfig, runner: Arc<RecordingRunner>) -> Sandbox {
        Sandbox::new(config).with_runner(runner)
    }

    fn router(installed: &[&str]) -> ToolRouter {
        ToolRouter::default().with_locator(Arc::new(StaticLocator::new(installed.iter().copied())))
    }

    fn budget() -> Budget {
        Budget::detached(Duration::from_secs(5))
    }

    fn get_app() -> ExecuteRequest {
        ExecuteRequest::new("argocd", "get", json!({ "app": "checkout" }))
    }

    // ── Gates ────────────────────────────────────────────────────────────────

    #[test]
    fn missing_sandbox_is_rejected() {
        let router = router(&["kubectl"]);
        let err = router
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" })),
                None,
                &ApiClients::new(),
                &budget(),
            )
            .unwrap_err();
        assert_eq!(err, OpsError::SandboxRequired);
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let run = runner(b"");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let err = router(&["kubectl"])
            .execute(ExecuteRequest::new("terraform", "apply", json!({})), Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap_err();
        assert_eq!(err, OpsError::UnknownTool { tool: "terraform".to_string() });
        assert!(run.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn writes_need_enabled_sandbox_when_required() {
        let run = runner(b"ok");
        let config = SandboxConfig {
            require_enabled_for_writes: true,
            ..SandboxConfig::permissive()
        };
        let sandbox = sandbox_with(config, run.clone());
        let router = router(&["kubectl"]);

        let err = router
            .execute(
                ExecuteRequest::new("kubectl", "scale", json!({ "resource": "deploy/app", "replicas": 2 })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap_err();
        assert!(matches!(err, OpsError::SandboxNotPermitted { .. }));

        router
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap();
        assert_eq!(run.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn egress_requirement_needs_allowlist_and_enabled_sandbox() {
        let config = SandboxConfig {
            require_egress_allowlist: true,
            egress_allowlist: vec!["api.example.com".to_string()],
            ..SandboxConfig::permissive()
        };
        let sandbox = sandbox_with(config, runner(b""));
        let err = router(&["kubectl"])
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap_err();
        assert!(matches!(err, OpsError::SandboxNotPermitted { .. }));
    }

    #[test]
    fn dangerous_argument_never_reaches_the_sandbox() {
        let run = runner(b"");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let err = router(&["kubectl"])
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods", "name": "x;rm -rf /" })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap_err();
        assert!(matches!(err, OpsError::DangerousArgument { index: 3, .. }));
        assert!(run.seen.lock().unwrap().is_empty());
    }

    // ── CLI-first precedence ─────────────────────────────────────────────────

    #[test]
    fn installed_cli_wins_over_configured_api() {
        let run = runner(b"{\"status\":\"Synced\"}");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let api = FakeApi::new(b"{}");
        let apis = ApiClients::new().with("argocd", api.clone());

        let response = router(&["argocd"])
            .execute(get_app(), Some(&sandbox), &apis, &budget())
            .unwrap();

        assert_eq!(response.used_path, UsedPath::Cli);
        assert!(api.calls.lock().unwrap().is_empty());
        let seen = run.seen.lock().unwrap();
        assert_eq!(seen[0].program, "argocd");
        assert_eq!(seen[0].args, vec!["app", "get", "checkout", "-o", "json"]);
    }

    #[test]
    fn missing_cli_falls_back_to_api() {
        let run = runner(b"");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let api = FakeApi::new(b"{\"metadata\":{}}");
        let apis = ApiClients::new().with("argocd", api.clone());

        let response = router(&[]).execute(get_app(), Some(&sandbox), &apis, &budget()).unwrap();

        assert_eq!(response.used_path, UsedPath::Api);
        assert_eq!(response.output, b"{\"metadata\":{}}".to_vec());
        assert!(run.seen.lock().unwrap().is_empty());
        assert_eq!(api.calls.lock().unwrap()[0].path, "/api/v1/applications/checkout");
    }

    #[test]
    fn missing_cli_without_api_is_no_cli() {
        let sandbox = sandbox_with(SandboxConfig::permissive(), runner(b""));
        let err = router(&[])
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap_err();
        assert_eq!(err, OpsError::NoCli { tool: "kubectl".to_string() });
    }

    #[test]
    fn api_fallback_without_client_is_reported() {
        let sandbox = sandbox_with(SandboxConfig::permissive(), runner(b""));
        let err = router(&[])
            .execute(get_app(), Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap_err();
        assert_eq!(err, OpsError::NoApiClient { tool: "argocd".to_string() });
    }

    #[test]
    fn api_output_is_capped() {
        let config = SandboxConfig {
            max_output_bytes: 4,
            ..SandboxConfig::permissive()
        };
        let sandbox = sandbox_with(config, runner(b""));
        let apis = ApiClients::new().with("prometheus", FakeApi::new(b"abcdefgh"));
        let response = router(&[])
            .execute(
                ExecuteRequest::new("prometheus", "query", json!({ "query": "up" })),
                Some(&sandbox),
                &apis,
                &budget(),
            )
            .unwrap();
        assert_eq!(response.output, b"abcd...(truncated)".to_vec());
    }

    // ── Values materialisation ───────────────────────────────────────────────

    #[test]
    fn helm_upgrade_materialises_values_and_removes_file() {
        let run = runner(b"Release \"web\" has been upgraded");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let request = ExecuteRequest::new(
            "helm",
            "upgrade",
            json!({
                "release": "web",
                "chart": "charts/web",
                "values_ref": { "kind": "inline", "ref": "replicas: 2\n" }
            }),
        );

        router(&["helm"])
            .execute(request, Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap();

        let (path, content) = run.values.lock().unwrap().clone().unwrap();
        assert_eq!(content, "replicas: 2\n");
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn values_file_is_removed_on_failure_too() {
        let run = Arc::new(RecordingRunner {
            exit_code: 1,
            output: b"Error: UPGRADE FAILED".to_vec(),
            ..Default::default()
        });
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let request = ExecuteRequest::new(
            "helm",
            "upgrade",
            json!({
                "release": "web",
                "chart": "charts/web",
                "values_ref": { "kind": "inline", "ref": "x: 1" }
            }),
        );

        let err = router(&["helm"])
            .execute(request, Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolFailed { .. }));
        let (path, _) = run.values.lock().unwrap().clone().unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn bad_values_digest_stops_before_running() {
        let run = runner(b"");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run.clone());
        let request = ExecuteRequest::new(
            "helm",
            "upgrade",
            json!({
                "release": "web",
                "values_ref": { "kind": "inline", "ref": "x: 1", "sha": "0".repeat(64) }
            }),
        );
        let err = router(&["helm"])
            .execute(request, Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap_err();
        assert!(matches!(err, OpsError::InvalidArtifact { .. }));
        assert!(run.seen.lock().unwrap().is_empty());
    }

    // ── Logging ──────────────────────────────────────────────────────────────

    #[test]
    fn assigns_id_and_logs_redacted_result() {
        let run = runner(b"token=supersecret");
        let sandbox = sandbox_with(SandboxConfig::permissive(), run);
        let router = router(&["kubectl"]);

        let response = router
            .execute(
                ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" })),
                Some(&sandbox),
                &ApiClients::new(),
                &budget(),
            )
            .unwrap();

        assert!(!response.tool_call_id.is_empty());
        assert_eq!(response.output, b"token=supersecret".to_vec());
        let history = router.logs().history(&response.tool_call_id);
        assert_eq!(history.len(), 2);
        assert!(history[0].message.starts_with("start kubectl get"));
        assert!(!history[1].message.contains("supersecret"));
    }

    #[test]
    fn keeps_caller_id_and_logs_failures_at_error() {
        let sandbox = sandbox_with(SandboxConfig::permissive(), runner(b""));
        let router = router(&[]);
        let mut request = ExecuteRequest::new("kubectl", "get", json!({}));
        request.tool_call_id = Some("tc-7".to_string());

        router
            .execute(request, Some(&sandbox), &ApiClients::new(), &budget())
            .unwrap_err();

        let history = router.logs().history("tc-7");
        assert_eq!(history.last().unwrap().level, LogLevel::Error);
        assert!(history.last().unwrap().message.contains("no CLI"));
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[test]
    fn cancelled_dispatch_closes_its_log_feed() {
        let token = CancelToken::new();
        let sandbox = Sandbox::new(SandboxConfig::permissive())
            .with_runner(Arc::new(CancellingRunner { token: token.clone() }));
        let dispatcher =
            RoutedDispatcher::new(Arc::new(router(&["kubectl"])), Some(sandbox), ApiClients::new());
        let feed = dispatcher.router().logs().subscribe("tc-cancel");
        let bystander = dispatcher.router().logs().subscribe("tc-other");

        let mut request = ExecuteRequest::new("kubectl", "get", json!({ "resource": "pods" }));
        request.tool_call_id = Some("tc-cancel".to_string());
        let err = dispatcher
            .dispatch(request, &Budget::new(Duration::from_secs(5), token))
            .unwrap_err();

        assert_eq!(err, OpsError::Cancelled);
        assert!(!feed.is_open());
        assert!(bystander.is_open());
        // Lines published before the close are still readable.
        assert!(feed.try_recv().unwrap().message.starts_with("start kubectl get"));
    }

    #[test]
    fn cancelled_executor_closes_every_log_feed() {
        let dispatcher = Arc::new(RoutedDispatcher::new(
            Arc::new(router(&["kubectl"])),
            Some(Sandbox::new(SandboxConfig::permissive())),
            ApiClients::new(),
        ));
        let feed = dispatcher.router().logs().subscribe("tc-watch");

        let executor = PlanExecutor::new(
            Arc::new(InMemoryStore::new()),
            dispatcher.clone(),
            ExecutorConfig::default(),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        executor.run(&cancel);

        assert!(!feed.is_open());
    }

    #[test]
    fn routed_dispatcher_uses_its_policy() {
        let dispatcher = RoutedDispatcher::new(Arc::new(router(&["kubectl"])), None, ApiClients::new());
        let err = dispatcher
            .dispatch(ExecuteRequest::new("kubectl", "get", json!({})), &budget())
            .unwrap_err();
        assert_eq!(err, OpsError::SandboxRequired);
    }
}
