//! Secret redaction for tool output and stored payloads.
//!
//! Output is redacted before it is logged or persisted. Stored inputs are
//! kept verbatim and pass through `redact_json` only when read back for
//! display.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Replacement for any redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a JSON value as secret (matched case-insensitively).
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "authorization",
    "private_key",
    "credential",
];

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*").expect("static regex"));

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)([a-z_\-]*(?:password|passwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key))(\s*[=:]\s*"?)[^\s",]+"#,
    )
    .expect("static regex")
});

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase().replace('-', "_");
    SECRET_KEY_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Return a copy of `value` with every secret-looking field masked.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_secret_key(k) && !v.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_json(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::String(s) => Value::String(redact_text(s)),
        other => other.clone(),
    }
}

/// Mask bearer tokens and `key=value` / `key: value` secrets in free text.
pub fn redact_text(text: &str) -> String {
    let once = BEARER.replace_all(text, format!("${{1}}{REDACTED}").as_str());
    KEY_VALUE
        .replace_all(&once, format!("${{1}}${{2}}{REDACTED}").as_str())
        .into_owned()
}

/// Redact raw tool output: structurally when it is JSON, textually otherwise.
pub fn redact_output(output: &[u8]) -> Vec<u8> {
    if let Ok(value) = serde_json::from_slice::<Value>(output) {
        if value.is_object() || value.is_array() {
            if let Ok(bytes) = serde_json::to_vec(&redact_json(&value)) {
                return bytes;
            }
        }
    }
    redact_text(&String::from_utf8_lossy(output)).into_bytes()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_secret_fields_are_masked_recursively() {
        let input = json!({
            "name": "db",
            "data": { "password": "hunter2", "Api-Key": "abc", "replicas": 3 },
            "items": [ { "client_secret": "s" } ]
        });
        let out = redact_json(&input);
        assert_eq!(out["name"], "db");
        assert_eq!(out["data"]["password"], REDACTED);
        assert_eq!(out["data"]["Api-Key"], REDACTED);
        assert_eq!(out["data"]["replicas"], 3);
        assert_eq!(out["items"][0]["client_secret"], REDACTED);
    }

    #[test]
    fn text_bearer_and_key_values_are_masked() {
        let out = redact_text("Authorization: Bearer eyJhbGciOi.abc-def\npassword=hunter2 user=bob");
        assert!(!out.contains("eyJhbGciOi"));
        assert!(!out.contains("hunter2"));
        assert!(out.contains("user=bob"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn output_redaction_keeps_plain_text_readable() {
        let out = redact_output(b"deployment.apps/app scaled");
        assert_eq!(out, b"deployment.apps/app scaled".to_vec());
    }

    #[test]
    fn output_redaction_handles_json() {
        let out = redact_output(br#"{"data":{"token":"t0ps3cret"},"lease_id":"x"}"#);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("t0ps3cret"));
        assert!(text.contains("lease_id"));
    }
}
