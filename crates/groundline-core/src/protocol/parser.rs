//! Protocol parsing from JSON/YAML.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::schema::validate_protocol_schema;
use super::terms::Term;
use crate::rules::{RuleKind, VocabularyRule};

/// Origin reported for protocols parsed from a string.
const INLINE_ORIGIN: &str = "<inline>";

/// Errors that can occur when loading a protocol.
///
/// Every variant names the file it came from; `Invalid` also names the
/// section.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read protocol file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol file {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("protocol file {} is not valid YAML: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("protocol file {} failed schema validation: {}", .path.display(), .errors.join("; "))]
    Schema { path: PathBuf, errors: Vec<String> },

    #[error("protocol file {}, section {section}: {message}", .path.display())]
    Invalid {
        path: PathBuf,
        section: String,
        message: String,
    },
}

impl ConfigError {
    fn invalid(path: &Path, section: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            path: path.to_path_buf(),
            section: section.into(),
            message: message.into(),
        }
    }
}

/// A local data source entry: a bare path or `{id, path, description}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalPath {
    Bare(String),
    Declared {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl LocalPath {
    /// Source identifier: the declared id, or the path itself.
    pub fn id(&self) -> &str {
        match self {
            LocalPath::Bare(path) => path,
            LocalPath::Declared { id, path, .. } => id.as_deref().unwrap_or(path),
        }
    }

    /// Path relative to the data-source root.
    pub fn path(&self) -> &str {
        match self {
            LocalPath::Bare(path) | LocalPath::Declared { path, .. } => path,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            LocalPath::Bare(_) => None,
            LocalPath::Declared { description, .. } => description.as_deref(),
        }
    }
}

/// Where the agent must take data from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Local files, relative to the data-source root, in retrieval order
    #[serde(default)]
    pub local_paths: Vec<LocalPath>,

    /// Remote locations an external fetcher may retrieve
    #[serde(default)]
    pub retrieval_urls: Vec<String>,

    /// Domains citations may point at
    #[serde(default)]
    pub allowed_origins: BTreeSet<String>,

    #[serde(default)]
    pub retrieval_order: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `operational_protocol.sourcing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcingPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,

    /// Preferred source categories, most preferred first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_technique: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_style: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banned_terms: Vec<Term>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vocabulary_rules: Vec<VocabularyRule>,

    pub data_sources: DataSourceSpec,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `operational_protocol.vocabulary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VocabularySection {
    #[serde(default)]
    pub banned_terms: Vec<Term>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Language {
    /// Phrases the agent must not use about itself
    #[serde(default)]
    pub avoid: Vec<Term>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `operational_protocol.identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `operational_protocol.boundaries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Boundaries {
    #[serde(
        default,
        rename = "personalSpace",
        skip_serializing_if = "Option::is_none"
    )]
    pub personal_space: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,

    #[serde(default)]
    pub rules: Vec<String>,

    #[serde(default)]
    pub ethical_considerations: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Narrative {
    #[serde(default)]
    pub injection_prevention: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `operational_protocol.corePrinciples`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CorePrinciples {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<Narrative>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalProtocol {
    pub sourcing: SourcingPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary: Option<VocabularySection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundaries: Option<Boundaries>,

    #[serde(
        default,
        rename = "corePrinciples",
        skip_serializing_if = "Option::is_none"
    )]
    pub core_principles: Option<CorePrinciples>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DisclosureSchema {
    /// Metric names to publish
    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `integrity_protocol`: process-wide versioning and disclosure settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntegrityProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disclosure_schema: Option<DisclosureSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_spec: Option<Map<String, Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The protocol document.
///
/// Loaded once and only ever handed out by shared reference. Unknown keys
/// are kept in the `extra` maps and serialized back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub operational_protocol: OperationalProtocol,

    /// Structural expectations for agent responses (opaque)
    pub output_schema: Map<String, Value>,

    pub integrity_protocol: IntegrityProtocol,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Protocol {
    /// Load a protocol file. `.yaml`/`.yml` files are read as YAML, anything
    /// else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let value = if is_yaml(path) {
            parse_yaml(&contents, path)?
        } else {
            parse_json(&contents, path)?
        };

        let protocol = Self::from_value(value, path)?;
        debug!(
            path = %path.display(),
            banned_terms = protocol.banned_terms().count(),
            vocabulary_rules = protocol.sourcing().vocabulary_rules.len(),
            local_paths = protocol.data_sources().local_paths.len(),
            "protocol loaded"
        );
        Ok(protocol)
    }

    /// Parse a protocol from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let origin = Path::new(INLINE_ORIGIN);
        Self::from_value(parse_json(json, origin)?, origin)
    }

    /// Parse a protocol from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let origin = Path::new(INLINE_ORIGIN);
        Self::from_value(parse_yaml(yaml, origin)?, origin)
    }

    /// Validate and convert an already-parsed document. `origin` is only used
    /// in error messages.
    pub fn from_value(value: Value, origin: &Path) -> Result<Self, ConfigError> {
        validate_protocol_schema(&value).map_err(|errors| ConfigError::Schema {
            path: origin.to_path_buf(),
            errors,
        })?;

        // Item-wise first, so a bad term or rule is reported by index.
        check_items::<Term>(&value, "/operational_protocol/sourcing/banned_terms", origin)?;
        check_items::<Term>(&value, "/operational_protocol/vocabulary/banned_terms", origin)?;
        check_items::<Term>(&value, "/operational_protocol/identity/language/avoid", origin)?;
        check_items::<VocabularyRule>(
            &value,
            "/operational_protocol/sourcing/vocabulary_rules",
            origin,
        )?;

        let protocol: Protocol = serde_json::from_value(value)
            .map_err(|e| ConfigError::invalid(origin, "protocol", e.to_string()))?;
        protocol.validate(origin)?;
        Ok(protocol)
    }

    pub fn sourcing(&self) -> &SourcingPolicy {
        &self.operational_protocol.sourcing
    }

    pub fn data_sources(&self) -> &DataSourceSpec {
        &self.operational_protocol.sourcing.data_sources
    }

    /// Banned terms from `sourcing.banned_terms` followed by
    /// `vocabulary.banned_terms`.
    pub fn banned_terms(&self) -> impl Iterator<Item = &Term> {
        let legacy = self
            .operational_protocol
            .vocabulary
            .iter()
            .flat_map(|v| v.banned_terms.iter());
        self.sourcing().banned_terms.iter().chain(legacy)
    }

    /// Phrases listed under `identity.language.avoid`.
    pub fn language_avoid(&self) -> &[Term] {
        self.operational_protocol
            .identity
            .as_ref()
            .and_then(|i| i.language.as_ref())
            .map(|l| l.avoid.as_slice())
            .unwrap_or(&[])
    }

    /// `integrity_protocol.version`, if declared.
    pub fn version(&self) -> Option<&str> {
        self.integrity_protocol.version.as_deref()
    }

    /// Semantic checks the schema cannot express.
    fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        let sources = self.data_sources();
        let section = "operational_protocol.sourcing.data_sources";

        let mut ids = HashSet::new();
        for (index, entry) in sources.local_paths.iter().enumerate() {
            ensure_under_root(entry.path()).map_err(|message| {
                ConfigError::invalid(origin, format!("{}.local_paths[{}]", section, index), message)
            })?;
            if !ids.insert(entry.id()) {
                return Err(ConfigError::invalid(
                    origin,
                    format!("{}.local_paths[{}]", section, index),
                    format!("duplicate source id '{}'", entry.id()),
                ));
            }
        }

        for (index, url) in sources.retrieval_urls.iter().enumerate() {
            let lower = url.to_ascii_lowercase();
            if !(lower.starts_with("https://") || lower.starts_with("http://")) {
                return Err(ConfigError::invalid(
                    origin,
                    format!("{}.retrieval_urls[{}]", section, index),
                    format!("'{}' is not an http(s) URL", url),
                ));
            }
        }

        self.validate_vocabulary_rules(origin)
    }

    /// Rule ids, where given, must be unique, and every rule must be
    /// satisfiable by some response.
    fn validate_vocabulary_rules(&self, origin: &Path) -> Result<(), ConfigError> {
        let allowed_origins = &self.data_sources().allowed_origins;
        let mut seen = HashSet::new();

        for (index, rule) in self.sourcing().vocabulary_rules.iter().enumerate() {
            let section = format!("operational_protocol.sourcing.vocabulary_rules[{}]", index);

            if let Some(id) = &rule.id {
                if !seen.insert(id) {
                    return Err(ConfigError::invalid(
                        origin,
                        section,
                        format!("duplicate {} rule id '{}'", rule.rule.name(), id),
                    ));
                }
            }

            match &rule.rule {
                RuleKind::RequireMarker { markers, .. } if markers.is_empty() => {
                    return Err(ConfigError::invalid(
                        origin,
                        section,
                        "require_marker needs at least one marker",
                    ));
                }
                RuleKind::RequireCitation {
                    allowed_origins_only: true,
                } if allowed_origins.is_empty() => {
                    return Err(ConfigError::invalid(
                        origin,
                        section,
                        "allowed_origins_only is set but data_sources.allowed_origins is empty",
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Reject absolute paths and paths whose `..` components climb above the
/// root. Purely lexical; symlinks are checked when resolving.
pub fn ensure_under_root(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("local path must not be empty".to_string());
    }

    let mut depth: usize = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("local path '{}' must be relative to the root", path));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("local path '{}' escapes the root", path))?;
            }
            Component::Normal(_) => depth += 1,
        }
    }

    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

fn parse_json(contents: &str, origin: &Path) -> Result<Value, ConfigError> {
    serde_json::from_str(contents).map_err(|source| ConfigError::Json {
        path: origin.to_path_buf(),
        source,
    })
}

fn parse_yaml(contents: &str, origin: &Path) -> Result<Value, ConfigError> {
    serde_yaml::from_str(contents).map_err(|source| ConfigError::Yaml {
        path: origin.to_path_buf(),
        source,
    })
}

/// Deserialize each element of the array at `pointer` on its own.
fn check_items<T: DeserializeOwned>(
    value: &Value,
    pointer: &str,
    origin: &Path,
) -> Result<(), ConfigError> {
    let Some(items) = value.pointer(pointer).and_then(Value::as_array) else {
        return Ok(());
    };

    let section = pointer.trim_start_matches('/').replace('/', ".");
    for (index, item) in items.iter().enumerate() {
        serde_json::from_value::<T>(item.clone()).map_err(|e| {
            ConfigError::invalid(origin, format!("{}[{}]", section, index), e.to_string())
        })?;
    }

    Ok(())
}
