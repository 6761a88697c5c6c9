//! Binary resolution on the execution environment's search path.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Finds executables. Injected so routing decisions are testable without
/// the real tools installed.
pub trait BinaryLocator: Send + Sync {
    fn locate(&self, binary: &str) -> Option<PathBuf>;
}

/// Looks binaries up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl BinaryLocator for PathLocator {
    fn locate(&self, binary: &str) -> Option<PathBuf> {
        which::which(binary).ok()
    }
}

/// A fixed set of "installed" binaries.
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    binaries: BTreeMap<String, PathBuf>,
}

impl StaticLocator {
    pub fn new<I, S>(binaries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binaries: binaries
                .into_iter()
                .map(|b| {
                    let b = b.into();
                    let path = PathBuf::from("/usr/bin").join(&b);
                    (b, path)
                })
                .collect(),
        }
    }
}

impl BinaryLocator for StaticLocator {
    fn locate(&self, binary: &str) -> Option<PathBuf> {
        self.binaries.get(binary).cloned()
    }
}
