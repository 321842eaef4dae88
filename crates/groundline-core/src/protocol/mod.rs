//! Protocol loading and validation.
//!
//! The protocol is structured data validated against JSON Schema, then
//! deserialized into typed sections. This module handles parsing YAML/JSON
//! protocols and the semantic checks the schema cannot express.

mod parser;
mod schema;
mod terms;

pub use parser::{
    ensure_under_root, Boundaries, ConfigError, CorePrinciples, DataSourceSpec, DisclosureSchema,
    Identity, IntegrityProtocol, Language, LocalPath, Narrative, OperationalProtocol, Protocol,
    SourcingPolicy, VocabularySection,
};
pub use schema::{validate_protocol_schema, SchemaError};
pub use terms::{MatchMode, Term, TermError, TermSpec};
