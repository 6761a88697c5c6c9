//! Command builders: `(tool, action, input) → argv`.
//!
//! Pure and deterministic. Inputs are read as a loosely typed JSON document
//! so unknown fields are ignored; a missing field drops the corresponding
//! argument rather than failing. Unknown actions yield just the binary name.
//! The argv shapes here are a contract external runbooks depend on.

use serde_json::Value;

/// Read `key` as text: strings (non-empty), numbers and booleans.
pub fn field(input: &Value, key: &str) -> Option<String> {
    match input.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn enabled(input: &Value, key: &str) -> bool {
    match input.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Small argv accumulator.
struct Argv(Vec<String>);

impl Argv {
    fn new(binary: &str) -> Self {
        Self(vec![binary.to_string()])
    }

    fn args(mut self, items: &[&str]) -> Self {
        self.0.extend(items.iter().map(|s| s.to_string()));
        self
    }

    /// Positional argument, skipped when absent.
    fn arg(mut self, value: Option<String>) -> Self {
        self.0.extend(value);
        self
    }

    /// `--name=value`, skipped when absent.
    fn joined(mut self, name: &str, value: Option<String>) -> Self {
        if let Some(v) = value {
            self.0.push(format!("{name}={v}"));
        }
        self
    }

    /// `name value`, skipped when absent.
    fn pair(mut self, name: &str, value: Option<String>) -> Self {
        if let Some(v) = value {
            self.0.push(name.to_string());
            self.0.push(v);
        }
        self
    }

    fn switch(mut self, name: &str, on: bool) -> Self {
        if on {
            self.0.push(name.to_string());
        }
        self
    }

    fn done(self) -> Vec<String> {
        self.0
    }
}

/// Build the argv for `tool`/`action`. Tools without a builder (API-only
/// tools) yield just the tool name.
pub fn build_argv(tool: &str, action: &str, input: &Value) -> Vec<String> {
    match tool {
        "kubectl" => kubectl(action, input),
        "k8s" => k8s(action, input),
        "helm" => helm(action, input),
        "argocd" => argocd(action, input),
        "aws" => aws(action, input),
        "vault" => vault(action, input),
        "gh" => gh(action, input),
        "glab" => glab(action, input),
        "git" => git(action, input),
        other => vec![other.to_string()],
    }
}

// ── Cluster orchestrator ─────────────────────────────────────────────────────

fn kubectl(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("kubectl");
    let resource = field(input, "resource");
    let name = field(input, "name");
    let ns = field(input, "namespace");

    let b = match action {
        "scale" => b
            .arg(Some("scale".to_string()))
            .arg(resource)
            .joined("--replicas", field(input, "replicas"))
            .joined("--current-replicas", field(input, "current_replicas"))
            .joined("--resource-version", field(input, "resource_version")),
        "rollout-restart" => b.args(&["rollout", "restart"]).arg(resource),
        "rollout-status" => b
            .args(&["rollout", "status"])
            .arg(resource)
            .joined("--timeout", field(input, "timeout")),
        "rollout-undo" => b
            .args(&["rollout", "undo"])
            .arg(resource)
            .joined("--to-revision", field(input, "revision")),
        "get" => b
            .arg(Some("get".to_string()))
            .arg(resource)
            .arg(name)
            .pair("-o", field(input, "output").or_else(|| Some("json".to_string()))),
        "describe" => b.arg(Some("describe".to_string())).arg(resource).arg(name),
        "logs" => b
            .arg(Some("logs".to_string()))
            .arg(resource.or(name))
            .pair("-c", field(input, "container"))
            .joined("--tail", field(input, "tail"))
            .joined("--since", field(input, "since")),
        "delete-pod" => b.args(&["delete", "pod"]).arg(name),
        "cordon" | "uncordon" => b.arg(Some(action.to_string())).arg(field(input, "node")),
        _ => return b.done(),
    };
    b.pair("-n", ns).done()
}

/// Read-only cluster queries. Anything that would mutate yields the bare
/// binary.
fn k8s(action: &str, input: &Value) -> Vec<String> {
    match action {
        "get" | "describe" | "logs" | "rollout-status" => kubectl(action, input),
        _ => vec!["kubectl".to_string()],
    }
}

// ── Package manager ──────────────────────────────────────────────────────────

fn helm(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("helm");
    let release = field(input, "release");
    let ns = field(input, "namespace");

    let b = match action {
        "upgrade" => b
            .arg(Some("upgrade".to_string()))
            .arg(release)
            .arg(field(input, "chart"))
            .pair("--version", field(input, "version"))
            .pair("--values", field(input, "values_file"))
            .switch("--install", enabled(input, "install"))
            .switch("--atomic", enabled(input, "atomic"))
            .switch("--wait", enabled(input, "wait"))
            .joined("--timeout", field(input, "timeout")),
        "rollback" => b
            .arg(Some("rollback".to_string()))
            .arg(release)
            .arg(field(input, "revision"))
            .switch("--wait", enabled(input, "wait")),
        "status" | "history" => b
            .arg(Some(action.to_string()))
            .arg(release)
            .args(&["-o", "json"]),
        "list" => b.args(&["list", "-o", "json"]),
        _ => return b.done(),
    };
    b.pair("-n", ns).done()
}

// ── GitOps controller ────────────────────────────────────────────────────────

fn argocd(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("argocd");
    let app = field(input, "app");
    match action {
        "sync" => b
            .args(&["app", "sync"])
            .arg(app)
            .pair("--revision", field(input, "revision"))
            .switch("--prune", enabled(input, "prune")),
        "sync-dry-run" => b.args(&["app", "sync"]).arg(app).args(&["--dry-run"]),
        "get" => b.args(&["app", "get"]).arg(app).args(&["-o", "json"]),
        "diff" => b.args(&["app", "diff"]).arg(app),
        "rollback" => b.args(&["app", "rollback"]).arg(app).arg(field(input, "id")),
        _ => b,
    }
    .done()
}

// ── Cloud CLI ────────────────────────────────────────────────────────────────

fn aws(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("aws");
    let region = field(input, "region");
    let b = match action {
        "lookup-events" => b
            .args(&["cloudtrail", "lookup-events"])
            .pair(
                "--lookup-attributes",
                field(input, "resource_name")
                    .map(|r| format!("AttributeKey=ResourceName,AttributeValue={r}")),
            )
            .pair("--max-results", field(input, "max_results"))
            .args(&["--output", "json"]),
        "ecs-update-service" => b
            .args(&["ecs", "update-service"])
            .pair("--cluster", field(input, "cluster"))
            .pair("--service", field(input, "service"))
            .pair("--desired-count", field(input, "desired_count"))
            .pair("--task-definition", field(input, "task_definition"))
            .switch("--force-new-deployment", enabled(input, "force_new_deployment"))
            .args(&["--output", "json"]),
        "s3-cp" => b
            .args(&["s3", "cp"])
            .arg(field(input, "source"))
            .arg(field(input, "destination")),
        _ => return b.done(),
    };
    b.pair("--region", region).done()
}

// ── Secret manager ───────────────────────────────────────────────────────────

fn vault(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("vault");
    match action {
        "kv-get" => b.args(&["kv", "get", "-format=json"]).arg(field(input, "path")),
        "rotate" => b.args(&["write", "-format=json", "-f"]).arg(field(input, "path")),
        "lease-revoke" => b.args(&["lease", "revoke"]).arg(field(input, "lease_id")),
        _ => b,
    }
    .done()
}

// ── SCM clients ──────────────────────────────────────────────────────────────

fn gh(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("gh");
    let repo = field(input, "repo");
    match action {
        "pr-create" => b
            .args(&["pr", "create"])
            .pair("--repo", repo)
            .pair("--title", field(input, "title"))
            .pair("--body", field(input, "body"))
            .pair("--base", field(input, "base"))
            .pair("--head", field(input, "head")),
        "pr-view" => b
            .args(&["pr", "view"])
            .arg(field(input, "number"))
            .pair("--repo", repo)
            .args(&["--json", "url,number,state,headRefOid"]),
        "pr-merge" => {
            let method = match field(input, "method").as_deref() {
                Some("merge") => "--merge",
                Some("rebase") => "--rebase",
                _ => "--squash",
            };
            b.args(&["pr", "merge"])
                .arg(field(input, "number"))
                .pair("--repo", repo)
                .args(&[method])
        }
        _ => b,
    }
    .done()
}

fn glab(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("glab");
    let repo = field(input, "repo");
    match action {
        "mr-create" => b
            .args(&["mr", "create"])
            .pair("--repo", repo)
            .pair("--title", field(input, "title"))
            .pair("--description", field(input, "description"))
            .pair("--source-branch", field(input, "source_branch"))
            .pair("--target-branch", field(input, "target_branch"))
            .args(&["--yes"]),
        "mr-view" => b
            .args(&["mr", "view"])
            .arg(field(input, "id"))
            .pair("--repo", repo)
            .args(&["--output", "json"]),
        _ => b,
    }
    .done()
}

// ── Version control ──────────────────────────────────────────────────────────

fn git(action: &str, input: &Value) -> Vec<String> {
    let b = Argv::new("git").pair("-C", field(input, "repo"));
    let rev = field(input, "rev");
    match action {
        "show" => {
            let object = match (rev, field(input, "path")) {
                (rev, Some(path)) => Some(format!("{}:{path}", rev.as_deref().unwrap_or("HEAD"))),
                (rev, None) => rev,
            };
            b.arg(Some("show".to_string())).arg(object)
        }
        "rev-parse" => b
            .arg(Some("rev-parse".to_string()))
            .arg(rev.or_else(|| Some("HEAD".to_string()))),
        "log" => b
            .args(&["log", "--oneline"])
            .pair("-n", field(input, "limit").or_else(|| Some("20".to_string())))
            .arg(rev),
        _ => return vec!["git".to_string()],
    }
    .done()
}
