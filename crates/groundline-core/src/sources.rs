//! Data source resolution.
//!
//! Turns the `local_paths` of a [`DataSourceSpec`] into content the agent can
//! cite. Retrieval URLs and allowed origins are passed through as declared;
//! nothing here touches the network.
//!
//! A missing or unreadable file only affects its own entry, which is marked
//! `unavailable`. A structured file that fails to parse is returned as
//! `unparsed` raw text together with the parse error.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{ensure_under_root, DataSourceSpec};

/// Errors that abort a resolution.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("data source '{id}' resolves outside the root: {}", .path.display())]
    OutsideRoot { id: String, path: PathBuf },
}

/// Filesystem access used by the resolver.
pub trait SourceReader {
    /// Read the whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Resolve symlinks. Only used to keep sources under the root.
    fn real_path(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }
}

/// Reads from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

impl SourceReader for FsReader {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Content resolved for one source id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolvedSource {
    /// Parsed JSON or YAML.
    Structured { path: PathBuf, value: Value },

    /// Plain text file.
    Text { path: PathBuf, content: String },

    /// Should have been structured data but did not parse.
    Unparsed {
        path: PathBuf,
        content: String,
        reason: String,
    },

    /// Missing or unreadable.
    Unavailable { path: PathBuf, reason: String },
}

impl ResolvedSource {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedSource::Structured { path, .. }
            | ResolvedSource::Text { path, .. }
            | ResolvedSource::Unparsed { path, .. }
            | ResolvedSource::Unavailable { path, .. } => path,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, ResolvedSource::Unavailable { .. })
    }
}

/// Result of resolving a [`DataSourceSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSources {
    /// Source id -> content
    pub sources: BTreeMap<String, ResolvedSource>,

    /// Unresolved; fetching is left to the caller
    pub retrieval_urls: Vec<String>,

    pub allowed_origins: BTreeSet<String>,

    pub retrieval_order: Vec<String>,
}

/// A local source location, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSourcePath {
    pub id: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where each local source lives, in declaration order.
pub fn local_source_paths(spec: &DataSourceSpec, root: &Path) -> Vec<LocalSourcePath> {
    spec.local_paths
        .iter()
        .map(|entry| LocalSourcePath {
            id: entry.id().to_string(),
            path: root.join(entry.path()),
            description: entry.description().map(str::to_string),
        })
        .collect()
}

/// Resolve local sources from the filesystem.
pub fn resolve(spec: &DataSourceSpec, root: &Path) -> Result<ResolvedSources, SourceError> {
    resolve_with(&FsReader, spec, root)
}

/// Resolve local sources through `reader`.
pub fn resolve_with(
    reader: &dyn SourceReader,
    spec: &DataSourceSpec,
    root: &Path,
) -> Result<ResolvedSources, SourceError> {
    let real_root = reader
        .real_path(root)
        .unwrap_or_else(|_| root.to_path_buf());

    let mut sources = BTreeMap::new();
    for entry in &spec.local_paths {
        let id = entry.id().to_string();
        let path = root.join(entry.path());

        if ensure_under_root(entry.path()).is_err() {
            return Err(SourceError::OutsideRoot { id, path });
        }
        // A missing file has no real path; it is reported as unavailable below.
        if let Ok(real) = reader.real_path(&path) {
            if !real.starts_with(&real_root) {
                return Err(SourceError::OutsideRoot { id, path: real });
            }
        }

        let resolved = match reader.read(&path) {
            Ok(bytes) => classify(path, bytes),
            Err(e) => {
                warn!(source = %id, path = %path.display(), error = %e, "data source unavailable");
                ResolvedSource::Unavailable {
                    reason: format!("{}: {}", path.display(), e),
                    path,
                }
            }
        };

        if let ResolvedSource::Unparsed { reason, .. } = &resolved {
            warn!(source = %id, reason = %reason, "structured data source returned as raw text");
        }
        sources.insert(id, resolved);
    }

    debug!(
        resolved = sources.values().filter(|s| s.is_available()).count(),
        total = sources.len(),
        "data sources resolved"
    );

    Ok(ResolvedSources {
        sources,
        retrieval_urls: spec.retrieval_urls.clone(),
        allowed_origins: spec.allowed_origins.clone(),
        retrieval_order: spec.retrieval_order.clone(),
    })
}

enum Format {
    Json,
    Yaml,
    Text,
}

fn format_of(path: &Path) -> Format {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => Format::Json,
        Some("yaml") | Some("yml") => Format::Yaml,
        _ => Format::Text,
    }
}

fn classify(path: PathBuf, bytes: Vec<u8>) -> ResolvedSource {
    let parsed = match format_of(&path) {
        Format::Text => None,
        Format::Json => Some(serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string())),
        Format::Yaml => Some(serde_yaml::from_slice::<Value>(&bytes).map_err(|e| e.to_string())),
    };

    match parsed {
        Some(Ok(value)) => ResolvedSource::Structured { path, value },
        Some(Err(reason)) => ResolvedSource::Unparsed {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            path,
            reason,
        },
        None => ResolvedSource::Text {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            path,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalPath;
    use std::collections::HashMap;

    /// In-memory reader keyed by path.
    struct MemReader(HashMap<PathBuf, Vec<u8>>);

    impl SourceReader for MemReader {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }

        fn real_path(&self, path: &Path) -> io::Result<PathBuf> {
            Ok(path.to_path_buf())
        }
    }

    fn spec(paths: &[&str]) -> DataSourceSpec {
        DataSourceSpec {
            local_paths: paths.iter().map(|p| LocalPath::Bare(p.to_string())).collect(),
            retrieval_urls: vec!["https://example.org/data.json".to_string()],
            allowed_origins: ["example.org".to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    fn reader(files: &[(&str, &str)]) -> MemReader {
        MemReader(
            files
                .iter()
                .map(|(p, c)| (Path::new("/root").join(p), c.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_missing_entry_does_not_abort() {
        let reader = reader(&[("notes.md", "hello")]);
        let resolved =
            resolve_with(&reader, &spec(&["notes.md", "gone.md"]), Path::new("/root")).unwrap();

        assert_eq!(resolved.sources.len(), 2);
        assert!(matches!(
            &resolved.sources["notes.md"],
            ResolvedSource::Text { content, .. } if content == "hello"
        ));
        assert!(!resolved.sources["gone.md"].is_available());
    }

    #[test]
    fn test_structured_sources_are_parsed() {
        let reader = reader(&[("a.json", r#"{"k": 1}"#), ("b.yml", "k: 2\n")]);
        let resolved =
            resolve_with(&reader, &spec(&["a.json", "b.yml"]), Path::new("/root")).unwrap();

        assert!(matches!(
            &resolved.sources["a.json"],
            ResolvedSource::Structured { value, .. } if value["k"] == 1
        ));
        assert!(matches!(
            &resolved.sources["b.yml"],
            ResolvedSource::Structured { value, .. } if value["k"] == 2
        ));
    }

    #[test]
    fn test_bad_json_falls_back_to_raw_text() {
        let reader = reader(&[("broken.json", "{ nope")]);
        let resolved = resolve_with(&reader, &spec(&["broken.json"]), Path::new("/root")).unwrap();

        match &resolved.sources["broken.json"] {
            ResolvedSource::Unparsed { content, reason, .. } => {
                assert_eq!(content, "{ nope");
                assert!(!reason.is_empty());
            }
            other => panic!("expected unparsed, got {:?}", other),
        }
    }

    #[test]
    fn test_urls_and_origins_pass_through() {
        let reader = reader(&[]);
        let resolved = resolve_with(&reader, &spec(&[]), Path::new("/root")).unwrap();
        assert_eq!(resolved.retrieval_urls, vec!["https://example.org/data.json"]);
        assert!(resolved.allowed_origins.contains("example.org"));
    }

    #[test]
    fn test_escaping_path_is_rejected() {
        let reader = reader(&[]);
        let result = resolve_with(&reader, &spec(&["../secret.txt"]), Path::new("/root"));
        assert!(matches!(result, Err(SourceError::OutsideRoot { .. })));
    }

    #[test]
    fn test_declared_ids_and_descriptions() {
        let spec = DataSourceSpec {
            local_paths: vec![LocalPath::Declared {
                id: Some("catalog".to_string()),
                path: "data/catalog.json".to_string(),
                description: Some("Product catalog".to_string()),
            }],
            ..Default::default()
        };
        let paths = local_source_paths(&spec, Path::new("/root"));
        assert_eq!(paths[0].id, "catalog");
        assert_eq!(paths[0].path, Path::new("/root/data/catalog.json"));
        assert_eq!(paths[0].description.as_deref(), Some("Product catalog"));
    }

    #[test]
    fn test_filesystem_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "on disk").unwrap();

        let resolved = resolve(&spec(&["present.txt", "absent.txt"]), dir.path()).unwrap();
        assert!(resolved.sources["present.txt"].is_available());
        assert!(matches!(
            &resolved.sources["absent.txt"],
            ResolvedSource::Unavailable { reason, .. } if reason.contains("absent.txt")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), root.path().join("link.txt"))
            .unwrap();

        let result = resolve(&spec(&["link.txt"]), root.path());
        assert!(matches!(result, Err(SourceError::OutsideRoot { .. })));
    }
}
