//! Fetches externally referenced payloads and checks their digest.
//!
//! Refs by kind:
//!
//! - `inline`: the ref string itself
//! - `git_path`: `[repo[@revision]:]path`, fetched with `git show`
//! - `object_store`: `s3://bucket/key` or `bucket/key`, fetched with
//!   `aws s3 cp <uri> -`
//!
//! A missing fetch CLI is reported as `ResolverUnavailable` so callers can
//! retry on a worker that has it.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use opsgate_contracts::{
    artifact::{ArtifactKind, ArtifactRef},
    cancel::Budget,
    error::{OpsError, OpsResult},
};
use opsgate_sandbox::{HostProcessRunner, ProcessRunner, ProcessSpec};

use crate::locate::{BinaryLocator, PathLocator};

/// Normalise a pinned digest to 64 lowercase hex characters.
pub fn normalize_sha(sha: &str) -> OpsResult<String> {
    let trimmed = sha.trim();
    let bare = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed)
        .to_ascii_lowercase();
    if bare.len() != 64 || !bare.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OpsError::InvalidArtifactRef {
            reason: format!("sha must be 64 hex characters, got {sha:?}"),
        });
    }
    Ok(bare)
}

/// `(repo, revision, path)` from a `git_path` ref.
pub fn parse_git_path(reference: &str) -> OpsResult<(String, String, String)> {
    let (location, path) = match reference.split_once(':') {
        Some((location, path)) => (location, path),
        None => ("", reference),
    };
    let (repo, revision) = match location.rsplit_once('@') {
        Some((repo, revision)) => (repo, revision),
        None => (location, ""),
    };
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Err(OpsError::InvalidArtifactRef {
            reason: format!("git_path ref {reference:?} has no path"),
        });
    }
    let repo = if repo.is_empty() { "." } else { repo };
    let revision = if revision.is_empty() { "HEAD" } else { revision };
    Ok((repo.to_string(), revision.to_string(), path.to_string()))
}

/// `s3://bucket/key` from either accepted form.
pub fn normalize_object_uri(reference: &str) -> OpsResult<String> {
    let rest = reference.strip_prefix("s3://").unwrap_or(reference);
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(format!("s3://{rest}")),
        _ => Err(OpsError::InvalidArtifactRef {
            reason: format!("object_store ref {reference:?} must be bucket/key"),
        }),
    }
}

pub struct ArtifactResolver {
    locator: Arc<dyn BinaryLocator>,
    runner: Arc<dyn ProcessRunner>,
}

impl Default for ArtifactResolver {
    fn default() -> Self {
        Self::new(Arc::new(PathLocator), Arc::new(HostProcessRunner))
    }
}

impl ArtifactResolver {
    pub fn new(locator: Arc<dyn BinaryLocator>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { locator, runner }
    }

    /// Fetch `artifact` within `budget` and verify its digest if pinned.
    pub fn resolve(&self, artifact: &ArtifactRef, budget: &Budget) -> OpsResult<Vec<u8>> {
        let kind = ArtifactKind::parse(&artifact.kind).ok_or_else(|| OpsError::UnsupportedArtifactKind {
            kind: artifact.kind.clone(),
        })?;
        let expected = artifact.pinned_sha().map(normalize_sha).transpose()?;

        let bytes = match kind {
            ArtifactKind::Inline => artifact.reference.clone().into_bytes(),
            ArtifactKind::GitPath => {
                let (repo, revision, path) = parse_git_path(&artifact.reference)?;
                self.fetch(
                    "git",
                    vec![
                        "-C".to_string(),
                        repo,
                        "show".to_string(),
                        format!("{revision}:{path}"),
                    ],
                    budget,
                )?
            }
            ArtifactKind::ObjectStore => {
                let uri = normalize_object_uri(&artifact.reference)?;
                self.fetch(
                    "aws",
                    vec!["s3".to_string(), "cp".to_string(), uri, "-".to_string()],
                    budget,
                )?
            }
        };

        if let Some(expected) = expected {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != expected {
                warn!(kind = %artifact.kind, expected = %expected, actual = %actual, "artifact digest mismatch");
                return Err(OpsError::InvalidArtifact {
                    reason: format!("sha256 mismatch: expected {expected}, got {actual}"),
                });
            }
        }
        debug!(kind = %artifact.kind, bytes = bytes.len(), "artifact resolved");
        Ok(bytes)
    }

    fn fetch(&self, binary: &str, args: Vec<String>, budget: &Budget) -> OpsResult<Vec<u8>> {
        let program = self
            .locator
            .locate(binary)
            .ok_or_else(|| OpsError::ResolverUnavailable {
                reason: format!("'{binary}' not found on PATH"),
            })?;
        let spec = ProcessSpec::new(program.to_string_lossy(), args);
        let out = self.runner.run(&spec, budget, 0)?;
        if !out.success() {
            let text = String::from_utf8_lossy(&out.output);
            return Err(OpsError::ArtifactFetch {
                reason: format!(
                    "{binary} exited with {:?}: {}",
                    out.exit_code,
                    text.trim().chars().take(512).collect::<String>()
                ),
            });
        }
        Ok(out.output)
    }
}
