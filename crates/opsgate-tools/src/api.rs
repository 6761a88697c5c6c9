//! HTTP fallback for tools whose CLI is not installed.
//!
//! `api_request` maps `(tool, action, input)` to a method, a path with an
//! encoded query string and an optional JSON body. `HttpApiClient` performs
//! the request with `ureq` against a configured base URL.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use opsgate_contracts::{
    cancel::Budget,
    error::{OpsError, OpsResult},
};
use opsgate_core::traits::{ApiClient, ApiRequest};

use crate::command::field;

fn required(input: &Value, key: &str) -> OpsResult<String> {
    field(input, key).ok_or_else(|| OpsError::InvalidInput {
        reason: format!("missing field '{key}'"),
    })
}

fn query_string(pairs: &[(&str, Option<String>)]) -> String {
    let encoded = pairs
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}={}", urlencoding::encode(v))))
        .collect::<Vec<_>>()
        .join("&");
    if encoded.is_empty() {
        encoded
    } else {
        format!("?{encoded}")
    }
}

/// Encode each `/`-separated segment, keeping the separators.
fn encode_segments(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn json_body(value: Value) -> OpsResult<Vec<u8>> {
    serde_json::to_vec(&value).map_err(|e| OpsError::InvalidInput {
        reason: format!("cannot encode request body: {e}"),
    })
}

/// Copy the listed input fields that are present into a JSON object under
/// new names.
fn pick(input: &Value, fields: &[(&str, &str)]) -> Value {
    let mut out = Map::new();
    for (from, to) in fields {
        if let Some(v) = input.get(*from).filter(|v| !v.is_null()) {
            out.insert((*to).to_string(), v.clone());
        }
    }
    Value::Object(out)
}

/// Map a tool action onto its HTTP request.
pub fn api_request(tool: &str, action: &str, input: &Value) -> OpsResult<ApiRequest> {
    let request = match (tool, action) {
        ("prometheus" | "thanos", "query") => {
            let query = required(input, "query")?;
            ApiRequest::new(
                "POST",
                format!(
                    "/api/v1/query{}",
                    query_string(&[("query", Some(query)), ("time", field(input, "time"))])
                ),
            )
        }
        ("prometheus" | "thanos", "query-range") => {
            let query = required(input, "query")?;
            ApiRequest::new(
                "POST",
                format!(
                    "/api/v1/query_range{}",
                    query_string(&[
                        ("query", Some(query)),
                        ("start", field(input, "start")),
                        ("end", field(input, "end")),
                        ("step", field(input, "step")),
                    ])
                ),
            )
        }

        ("tempo", "trace") => {
            let trace_id = required(input, "trace_id")?;
            ApiRequest::new("GET", format!("/api/traces/{}", urlencoding::encode(&trace_id)))
        }
        ("tempo", "search") => {
            let q = required(input, "q")?;
            ApiRequest::new(
                "GET",
                format!(
                    "/api/search{}",
                    query_string(&[("q", Some(q)), ("limit", field(input, "limit"))])
                ),
            )
        }

        ("grafana", "dashboard") => {
            let uid = required(input, "uid")?;
            ApiRequest::new("GET", format!("/api/dashboards/uid/{}", urlencoding::encode(&uid)))
        }
        ("grafana", "annotate") => {
            required(input, "text")?;
            let body = pick(
                input,
                &[
                    ("text", "text"),
                    ("tags", "tags"),
                    ("dashboard_uid", "dashboardUID"),
                    ("panel_id", "panelId"),
                    ("time", "time"),
                ],
            );
            ApiRequest::new("POST", "/api/annotations").with_body(json_body(body)?)
        }

        ("argocd", "get") => {
            let app = required(input, "app")?;
            ApiRequest::new("GET", format!("/api/v1/applications/{}", urlencoding::encode(&app)))
        }
        ("argocd", "sync" | "sync-dry-run") => {
            let app = required(input, "app")?;
            let mut body = pick(input, &[("revision", "revision"), ("prune", "prune")]);
            if action == "sync-dry-run" {
                body["dryRun"] = json!(true);
            }
            ApiRequest::new(
                "POST",
                format!("/api/v1/applications/{}/sync", urlencoding::encode(&app)),
            )
            .with_body(json_body(body)?)
        }

        ("vault", "kv-get") => {
            let path = required(input, "path")?;
            ApiRequest::new("GET", format!("/v1/{}", encode_segments(&path)))
        }
        ("vault", "rotate") => {
            let path = required(input, "path")?;
            ApiRequest::new("POST", format!("/v1/{}", encode_segments(&path))).with_body(b"{}".to_vec())
        }

        ("gh", "pr-view") => {
            let repo = required(input, "repo")?;
            let number = required(input, "number")?;
            ApiRequest::new(
                "GET",
                format!("/repos/{}/pulls/{}", encode_segments(&repo), urlencoding::encode(&number)),
            )
        }
        ("gh", "pr-create") => {
            let repo = required(input, "repo")?;
            let body = pick(
                input,
                &[("title", "title"), ("body", "body"), ("head", "head"), ("base", "base")],
            );
            ApiRequest::new("POST", format!("/repos/{}/pulls", encode_segments(&repo)))
                .with_body(json_body(body)?)
        }

        _ => {
            return Err(OpsError::UnsupportedApiAction {
                tool: tool.to_string(),
                action: action.to_string(),
            })
        }
    };
    Ok(request)
}

// ── Clients ──────────────────────────────────────────────────────────────────

/// API clients keyed by tool name.
#[derive(Clone, Default)]
pub struct ApiClients {
    clients: BTreeMap<String, Arc<dyn ApiClient>>,
}

impl ApiClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: impl Into<String>, client: Arc<dyn ApiClient>) {
        self.clients.insert(tool.into(), client);
    }

    pub fn with(mut self, tool: impl Into<String>, client: Arc<dyn ApiClient>) -> Self {
        self.insert(tool, client);
        self
    }

    pub fn get(&self, tool: &str) -> Option<&Arc<dyn ApiClient>> {
        self.clients.get(tool)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// `ApiClient` over HTTP(S) with an optional bearer token.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    base_url: String,
    token: Option<String>,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl ApiClient for HttpApiClient {
    fn call(&self, request: &ApiRequest, budget: &Budget) -> OpsResult<Vec<u8>> {
        budget.check()?;
        let url = self.endpoint(&request.path);
        debug!(method = %request.method, url = %url, "api call");

        let mut req = ureq::request(&request.method, &url)
            .timeout(budget.remaining())
            .set("accept", "application/json")
            .set("user-agent", concat!("opsgate/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }

        let result = match &request.body {
            Some(body) => req.set("content-type", "application/json").send_bytes(body),
            None => req.call(),
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                let detail: String = detail.chars().take(512).collect();
                return Err(OpsError::Api {
                    reason: format!("{} {}: status {code}: {detail}", request.method, request.path),
                });
            }
            Err(e) => {
                budget.check()?;
                return Err(OpsError::Api {
                    reason: format!("{} {}: {e}", request.method, request.path),
                });
            }
        };

        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| OpsError::Api {
                reason: format!("{} {}: failed to read body: {e}", request.method, request.path),
            })?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::*;

    // ── Mapping ──────────────────────────────────────────────────────────────

    #[test]
    fn metrics_query_is_post_with_encoded_query() {
        let req = api_request("prometheus", "query", &json!({ "query": "rate(http_errors[5m]) > 0" }))
            .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/v1/query?query=rate%28http_errors%5B5m%5D%29%20%3E%200");
        assert!(req.body.is_none());

        let req = api_request("thanos", "query", &json!({ "query": "up", "time": 1700000000 })).unwrap();
        assert_eq!(req.path, "/api/v1/query?query=up&time=1700000000");
    }

    #[test]
    fn dashboard_fetch_is_get_by_uid() {
        let req = api_request("grafana", "dashboard", &json!({ "uid": "svc-overview" })).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/dashboards/uid/svc-overview");
    }

    #[test]
    fn annotation_body_uses_grafana_field_names() {
        let req = api_request(
            "grafana",
            "annotate",
            &json!({ "text": "deploy", "tags": ["opsgate"], "dashboard_uid": "abc" }),
        )
        .unwrap();
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "text": "deploy", "tags": ["opsgate"], "dashboardUID": "abc" }));
    }

    #[test]
    fn gitops_dry_run_sets_flag() {
        let req = api_request("argocd", "sync-dry-run", &json!({ "app": "checkout" })).unwrap();
        assert_eq!(req.path, "/api/v1/applications/checkout/sync");
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["dryRun"], json!(true));
    }

    #[test]
    fn paths_keep_separators_but_encode_segments() {
        let req = api_request("vault", "kv-get", &json!({ "path": "secret/data/my app" })).unwrap();
        assert_eq!(req.path, "/v1/secret/data/my%20app");
        let req = api_request("gh", "pr-view", &json!({ "repo": "org/repo", "number": 42 })).unwrap();
        assert_eq!(req.path, "/repos/org/repo/pulls/42");
    }

    #[test]
    fn missing_fields_and_unknown_actions_are_rejected() {
        assert!(matches!(
            api_request("prometheus", "query", &json!({})),
            Err(OpsError::InvalidInput { .. })
        ));
        assert!(matches!(
            api_request("vault", "lease-revoke", &json!({ "lease_id": "x" })),
            Err(OpsError::UnsupportedApiAction { .. })
        ));
    }

    // ── HTTP client ──────────────────────────────────────────────────────────

    /// Serve one canned response and hand back the raw request head.
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&head).into_owned()
        });
        (base, handle)
    }

    #[test]
    fn http_client_sends_bearer_token_and_returns_body() {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}");
        let client = HttpApiClient::new(format!("{base}/")).with_token("t0k3n");

        let body = client
            .call(
                &ApiRequest::new("GET", "/api/dashboards/uid/x"),
                &Budget::detached(Duration::from_secs(5)),
            )
            .unwrap();

        assert_eq!(body, b"{\"ok\":true}".to_vec());
        let head = server.join().unwrap();
        assert!(head.starts_with("GET /api/dashboards/uid/x HTTP/1.1"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer t0k3n"));
    }

    #[test]
    fn http_client_maps_error_status() {
        let (base, server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndown",
        );
        let err = HttpApiClient::new(base)
            .call(&ApiRequest::new("GET", "/ready"), &Budget::detached(Duration::from_secs(5)))
            .unwrap_err();
        server.join().unwrap();

        match err {
            OpsError::Api { reason } => {
                assert!(reason.contains("503"));
                assert!(reason.contains("down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
