//! Static artifact generation.
//!
//! The canonical (no-query) constraint set is published as a JSON file that
//! remote agents fetch directly. Writes go to a temporary file in the target
//! directory which is then renamed over the artifact, so readers see either
//! the previous file or the new one. Nothing is written unless the protocol
//! loads and validates.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::derive::{derive, GroundingConstraintSet, ROUTE_NOTE};
use crate::layout::Layout;
use crate::protocol::{ConfigError, Protocol};

const ARTIFACT_DESCRIPTION: &str = "Grounding constraints (logic route). Structure data and \
attributions; the user establishes truthfulness. Includes data_sources (where the model must \
grab data from).";

const ARTIFACT_USAGE: &str = "Point your agent or provider at this URL so answers follow the \
same protocol as the repository.";

/// Errors from artifact generation.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read artifact {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {} is not a valid constraint set: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub description: String,
    pub usage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// The published snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Always `null`: the artifact is the no-query baseline
    pub query: Option<String>,

    pub grounding_constraints: GroundingConstraintSet,

    pub note: String,

    #[serde(rename = "_meta")]
    pub meta: ArtifactMeta,
}

impl Artifact {
    /// Snapshot of the canonical constraint set.
    pub fn build(protocol: &Protocol) -> Self {
        Self {
            query: None,
            grounding_constraints: derive(protocol, None),
            note: ROUTE_NOTE.to_string(),
            meta: ArtifactMeta {
                description: ARTIFACT_DESCRIPTION.to_string(),
                usage: ARTIFACT_USAGE.to_string(),
                protocol_version: protocol.version().map(str::to_string),
                generated_at: Utc::now(),
            },
        }
    }

    /// Read a published artifact back.
    ///
    /// Terms and rules are recompiled while parsing, so a hand-edited
    /// artifact with a broken pattern is rejected here.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ArtifactError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Load the protocol from `layout` and publish its canonical constraint set.
///
/// On any error the existing artifact is left untouched.
pub fn regenerate(layout: &Layout) -> Result<Artifact, ArtifactError> {
    let protocol = Protocol::load(&layout.protocol_path)?;
    write_artifact(&protocol, &layout.artifact_path)
}

/// Publish the canonical constraint set of an already-loaded protocol.
pub fn write_artifact(protocol: &Protocol, path: &Path) -> Result<Artifact, ArtifactError> {
    let artifact = Artifact::build(protocol);
    let json = serde_json::to_string_pretty(&artifact)?;
    write_atomic(path, json.as_bytes())?;
    info!(
        path = %path.display(),
        rules = artifact.grounding_constraints.rule_count(),
        "grounding constraints artifact written"
    );
    Ok(artifact)
}

/// Replace `path` with `contents` via temp file + rename in the same directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTOCOL: &str = r#"{
        "operational_protocol": {
            "sourcing": {
                "banned_terms": ["guaranteed", { "term": "fact", "match": "word" }],
                "vocabulary_rules": [
                    { "id": "H1", "kind": "require_marker", "markers": ["likely"], "when": ["studies show"] }
                ],
                "data_sources": {
                    "local_paths": [{ "id": "notes", "path": "docs/notes.md" }],
                    "retrieval_urls": ["https://example.org/notes.md"],
                    "allowed_origins": ["example.org"]
                }
            }
        },
        "output_schema": {},
        "integrity_protocol": { "version": "2.0.0" }
    }"#;

    fn repo_with_protocol(contents: &str) -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.protocol_path.parent().unwrap()).unwrap();
        fs::write(&layout.protocol_path, contents).unwrap();
        (dir, layout)
    }

    #[test]
    fn test_regenerate_writes_canonical_set() {
        let (_dir, layout) = repo_with_protocol(PROTOCOL);
        let artifact = regenerate(&layout).unwrap();

        assert!(artifact.query.is_none());
        assert_eq!(artifact.meta.protocol_version.as_deref(), Some("2.0.0"));

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&layout.artifact_path).unwrap()).unwrap();
        assert!(written["query"].is_null());
        assert_eq!(
            written["grounding_constraints"]["vocabulary"]["banned_terms"][0],
            "guaranteed"
        );
        assert!(written["_meta"]["generated_at"].is_string());
    }

    #[test]
    fn test_round_trip_matches_live_derivation() {
        let (_dir, layout) = repo_with_protocol(PROTOCOL);
        regenerate(&layout).unwrap();

        let loaded = Artifact::load(&layout.artifact_path).unwrap();
        let live = derive(&Protocol::load(&layout.protocol_path).unwrap(), None);
        assert_eq!(loaded.grounding_constraints, live);
    }

    #[test]
    fn test_failed_regenerate_leaves_artifact_untouched() {
        let (_dir, layout) = repo_with_protocol(PROTOCOL);
        regenerate(&layout).unwrap();
        let before = fs::read(&layout.artifact_path).unwrap();

        // Drop the integrity section: structurally invalid.
        fs::write(
            &layout.protocol_path,
            r#"{ "operational_protocol": { "sourcing": { "data_sources": {} } }, "output_schema": {} }"#,
        )
        .unwrap();

        let err = regenerate(&layout).unwrap_err();
        assert!(matches!(err, ArtifactError::Config(ConfigError::Schema { .. })));
        assert_eq!(fs::read(&layout.artifact_path).unwrap(), before);
    }

    #[test]
    fn test_failed_first_run_writes_nothing() {
        let (_dir, layout) = repo_with_protocol("{ broken");
        assert!(regenerate(&layout).is_err());
        assert!(!layout.artifact_path.exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, layout) = repo_with_protocol(PROTOCOL);
        regenerate(&layout).unwrap();
        regenerate(&layout).unwrap();

        let entries: Vec<_> = fs::read_dir(layout.artifact_path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("grounding-constraints.json")]);
    }

    #[test]
    fn test_load_rejects_broken_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.json");
        let protocol = Protocol::from_json(PROTOCOL).unwrap();
        write_artifact(&protocol, &path).unwrap();

        let edited = fs::read_to_string(&path)
            .unwrap()
            .replace(r#""term": "fact""#, r#""term": "(fact""#)
            .replace(r#""match": "word""#, r#""match": "regex""#);
        fs::write(&path, edited).unwrap();

        assert!(matches!(
            Artifact::load(&path),
            Err(ArtifactError::Malformed { .. })
        ));
    }
}
