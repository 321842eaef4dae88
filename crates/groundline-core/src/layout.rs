//! Canonical file locations relative to a repository root.

use std::path::{Path, PathBuf};

/// Protocol document, relative to the root.
pub const PROTOCOL_PATH: &str = "protocol/protocol.json";

/// Published constraint set, relative to the root.
pub const ARTIFACT_PATH: &str = ".well-known/grounding-constraints.json";

/// Published integrity metrics, relative to the root.
pub const METRICS_PATH: &str = ".well-known/integrity/metrics.json";

/// Where the engine reads and writes its files.
///
/// Local data-source paths in the protocol are resolved against `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub protocol_path: PathBuf,
    pub artifact_path: PathBuf,
    pub metrics_path: PathBuf,
}

impl Layout {
    /// Canonical layout under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            protocol_path: root.join(PROTOCOL_PATH),
            artifact_path: root.join(ARTIFACT_PATH),
            metrics_path: root.join(METRICS_PATH),
            root,
        }
    }

    /// Use a protocol file other than the canonical one. A relative `path`
    /// is resolved against `root`, not the process working directory.
    pub fn with_protocol(mut self, path: impl AsRef<Path>) -> Self {
        self.protocol_path = self.root.join(path);
        self
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(".")
    }
}
