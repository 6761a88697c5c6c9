//! opsctl: operator CLI for the opsgate runtime.
//!
//! Usage:
//!   opsctl run-plan --plan plan.json [--config ops.toml]
//!   opsctl argv --tool kubectl --action scale --input '{"resource":"deploy/web","replicas":3}'
//!   opsctl resolve --kind git_path --ref 'charts@main:web/values.yaml' [--sha <hex>]
//!   opsctl proxy --allow api.github.com --allow '*.svc.cluster.local'

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use opsgate_audit::{InMemoryBlobStore, InMemoryStore};
use opsgate_config::OpsConfig;
use opsgate_contracts::{
    artifact::ArtifactRef,
    cancel::{Budget, CancelToken},
    error::{OpsError, OpsResult},
    plan::{ExecutionStatus, PlanStep},
    tool::ContextRef,
};
use opsgate_core::{executor::ExecutorConfig, redact::redact_json, traits::Store, PlanExecutor};
use opsgate_sandbox::{validate_argv, EgressProxy, Sandbox};
use opsgate_tools::{
    build_argv, ApiClients, ArtifactResolver, HttpApiClient, LogHub, RoutedDispatcher, ToolRegistry,
    ToolRouter,
};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Dispatch operational tools through a sandbox and run remediation plans.
#[derive(Parser)]
#[command(name = "opsctl", about = "opsgate tool dispatch and plan execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one plan file end to end and print the outcome as JSON.
    RunPlan {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the argv a tool action would run, after validation.
    Argv {
        #[arg(long)]
        tool: String,
        #[arg(long)]
        action: String,
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Fetch an artifact and write it to stdout.
    Resolve {
        #[arg(long)]
        kind: String,
        #[arg(long = "ref")]
        reference: String,
        #[arg(long)]
        sha: Option<String>,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Run a standalone egress proxy until interrupted.
    Proxy {
        #[arg(long = "allow", required = true)]
        allow: Vec<String>,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },
}

/// A plan file: steps plus optional scoping.
#[derive(Deserialize)]
struct PlanFile {
    #[serde(default = "default_plan_id")]
    plan_id: String,
    #[serde(default)]
    context: ContextRef,
    steps: Vec<PlanStep>,
}

fn default_plan_id() -> String {
    "plan".to_string()
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    // Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::RunPlan { plan, config } => run_plan(&plan, config.as_deref()),
        Command::Argv { tool, action, input } => print_argv(&tool, &action, &input),
        Command::Resolve {
            kind,
            reference,
            sha,
            timeout_secs,
        } => resolve(kind, reference, sha, timeout_secs),
        Command::Proxy { allow, bind } => proxy(&bind, allow),
    };

    if let Err(e) = result {
        eprintln!("opsctl: {e}");
        std::process::exit(1);
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> OpsResult<OpsConfig> {
    match path {
        Some(path) => OpsConfig::from_file(path),
        None => Ok(OpsConfig::default()),
    }
}

fn api_clients(config: &OpsConfig) -> ApiClients {
    let mut clients = ApiClients::new();
    for (tool, endpoint) in &config.api {
        let mut client = HttpApiClient::new(endpoint.base_url.clone());
        if let Some(token) = endpoint.token() {
            client = client.with_token(token);
        }
        clients.insert(tool.clone(), Arc::new(client));
    }
    clients
}

fn to_json<T: serde::Serialize>(value: &T) -> OpsResult<Value> {
    serde_json::to_value(value).map_err(|e| OpsError::InvalidInput {
        reason: format!("cannot encode output: {e}"),
    })
}

fn run_plan(plan_path: &Path, config_path: Option<&Path>) -> OpsResult<()> {
    let config = load_config(config_path)?;
    let raw = std::fs::read_to_string(plan_path).map_err(|e| OpsError::InvalidInput {
        reason: format!("failed to read plan '{}': {e}", plan_path.display()),
    })?;
    let plan: PlanFile = serde_json::from_str(&raw).map_err(|e| OpsError::InvalidInput {
        reason: format!("invalid plan '{}': {e}", plan_path.display()),
    })?;

    let store = InMemoryStore::new();
    let blobs = InMemoryBlobStore::new();
    store.put_plan(&plan.plan_id, plan.steps)?;
    let execution = store.create_execution(&plan.plan_id, &plan.context)?;

    let hub = LogHub::new(
        config.log_hub.history_lines,
        config.log_hub.max_keys,
        config.log_hub.subscriber_buffer,
    );
    let router = Arc::new(ToolRouter::new(ToolRegistry::builtin()).with_log_hub(hub));
    let dispatcher = RoutedDispatcher::new(
        router,
        Some(Sandbox::new(config.sandbox.clone())),
        api_clients(&config),
    );
    let executor = PlanExecutor::new(
        Arc::new(store.clone()),
        Arc::new(dispatcher),
        ExecutorConfig {
            batch_limit: config.executor.batch_limit,
            step_timeout: config.executor.step_timeout(),
            poll_interval: config.executor.poll_interval(),
            presign_ttl: config.executor.presign_ttl(),
        },
    )
    .with_blob_store(Arc::new(blobs));

    info!(execution_id = %execution.execution_id, plan_id = %plan.plan_id, "running plan");
    let outcome = executor.run_execution(&execution, &CancelToken::new());

    let records = store.tool_calls(&execution.execution_id)?;
    let evidence = store.export_evidence(&execution.execution_id)?;
    let report = json!({
        "execution_id": outcome.execution.execution_id,
        "plan_id": outcome.execution.plan_id,
        "status": outcome.status.as_str(),
        "error": outcome.error,
        "rollback_error": outcome.rollback_error,
        "chain_valid": store.verify_integrity(&execution.execution_id)?,
        "tool_calls": redact_json(&to_json(&records)?),
        "evidence": to_json(&evidence)?,
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());

    if outcome.status == ExecutionStatus::Succeeded {
        Ok(())
    } else {
        Err(OpsError::ToolFailed {
            tool: "plan".to_string(),
            reason: format!("execution finished as {}", outcome.status.as_str()),
        })
    }
}

fn print_argv(tool: &str, action: &str, input: &str) -> OpsResult<()> {
    let input: Value = serde_json::from_str(input).map_err(|e| OpsError::InvalidInput {
        reason: format!("--input is not JSON: {e}"),
    })?;
    ToolRegistry::builtin().lookup(tool)?;
    let argv = build_argv(tool, action, &input);
    validate_argv(&argv)?;
    println!("{}", serde_json::to_string(&argv).unwrap_or_default());
    Ok(())
}

fn resolve(kind: String, reference: String, sha: Option<String>, timeout_secs: u64) -> OpsResult<()> {
    let artifact = ArtifactRef {
        kind,
        reference,
        sha,
    };
    let bytes = ArtifactResolver::default()
        .resolve(&artifact, &Budget::detached(Duration::from_secs(timeout_secs)))?;
    std::io::stdout()
        .write_all(&bytes)
        .map_err(|e| OpsError::InvalidInput {
            reason: format!("failed to write output: {e}"),
        })
}

fn proxy(bind: &str, allow: Vec<String>) -> OpsResult<()> {
    opsgate_sandbox::validate_allowlist(&allow)?;
    let proxy = EgressProxy::start(bind, allow)?;
    println!("egress proxy listening on {}", proxy.addr());
    loop {
        thread::sleep(Duration::from_secs(60));
        info!(active = proxy.active_connections(), "egress proxy");
    }
}
