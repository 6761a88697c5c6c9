//! Artifact references: pointers to externally stored content.

use serde::{Deserialize, Serialize};

/// Wire shape `{kind, ref, sha}`, used as a resolve request and embedded in
/// a step's `input.values_ref`.
///
/// `kind` stays a plain string so an unknown kind surfaces as an
/// "unsupported kind" error at resolution time rather than a decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
    /// `sha256:<64 hex>` or bare 64 hex. Must match when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

impl ArtifactRef {
    pub fn new(kind: ArtifactKind, reference: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            reference: reference.into(),
            sha: None,
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    /// The digest to verify against. An empty or blank `sha` counts as
    /// absent, since some producers emit `""` for unset fields.
    pub fn pinned_sha(&self) -> Option<&str> {
        self.sha.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Supported artifact sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    GitPath,
    ObjectStore,
    Inline,
}

impl ArtifactKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "git_path" => Some(ArtifactKind::GitPath),
            "object_store" => Some(ArtifactKind::ObjectStore),
            "inline" => Some(ArtifactKind::Inline),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::GitPath => "git_path",
            ArtifactKind::ObjectStore => "object_store",
            ArtifactKind::Inline => "inline",
        }
    }
}
