//! # groundline-core
//!
//! Deterministic grounding-constraint derivation and response validation.
//!
//! A static protocol document describes how an external text-generation
//! agent must source and phrase its answers. This crate answers:
//! - Which rules apply to this query?
//! - Where may the agent take its data from?
//! - Does this candidate response break any rule?
//!
//! ## Key Guarantees
//!
//! 1. **All-or-nothing loading**: a protocol either validates completely or
//!    is rejected with the file and section at fault
//! 2. **Non-narrowing**: the constraints for any query include every rule of
//!    the no-query baseline
//! 3. **Infallible validation**: any response text yields a result
//! 4. **No truth judgment**: checks are structural and textual only
//!
//! ## Example
//!
//! ```rust,ignore
//! use groundline_core::{derive, validate, Protocol};
//!
//! let protocol = Protocol::load("protocol/protocol.json")?;
//! let constraints = derive(&protocol, None);
//! let result = validate("This is guaranteed.", &constraints);
//!
//! for violation in &result.violations {
//!     println!("{:?}: {}", violation.kind, violation.message);
//! }
//! ```

pub mod artifact;
pub mod derive;
pub mod integrity;
pub mod layout;
pub mod protocol;
pub mod rules;
pub mod sources;
pub mod validator;

// Re-export main types at crate root
pub use artifact::{regenerate, write_artifact, Artifact, ArtifactError};
pub use derive::{derive, route, GroundingConstraintSet, LogicRoute};
pub use integrity::{metrics_snapshot, regenerate_metrics};
pub use layout::Layout;
pub use protocol::{ConfigError, DataSourceSpec, LocalPath, MatchMode, Protocol, Term};
pub use rules::{RuleCheck, RuleKind, Violation, ViolationKind, VocabularyRule};
pub use sources::{
    local_source_paths, resolve, resolve_with, FsReader, ResolvedSource, ResolvedSources,
    SourceError, SourceReader,
};
pub use validator::{validate, PassedCheck, ValidationResult};
