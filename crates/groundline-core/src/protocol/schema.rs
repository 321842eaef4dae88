//! JSON Schema validation for protocol documents.
//!
//! Protocols are validated against schema/protocol.schema.json before typed
//! deserialization, so a missing section is reported with its instance path.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded protocol schema (loaded at compile time).
const PROTOCOL_SCHEMA_JSON: &str = include_str!("../../../../schema/protocol.schema.json");

/// Compiled once; a compile failure is kept and reported on every call.
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from schema validation.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("embedded protocol schema is unusable: {0}")]
    Unusable(String),
}

fn compile_schema() -> Result<jsonschema::Validator, String> {
    let schema: serde_json::Value = serde_json::from_str(PROTOCOL_SCHEMA_JSON)
        .map_err(|e| format!("not valid JSON: {}", e))?;
    jsonschema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .build(&schema)
        .map_err(|e| format!("does not compile: {}", e))
}

fn validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    COMPILED_SCHEMA
        .get_or_init(compile_schema)
        .as_ref()
        .map_err(|e| SchemaError::Unusable(e.clone()))
}

/// Validate a protocol JSON value against the schema.
///
/// Returns `Err` with one message per violation, each suffixed with the
/// instance path it was found at (e.g. `/operational_protocol/sourcing`).
pub fn validate_protocol_schema(protocol_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let compiled = validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = compiled
        .iter_errors(protocol_json)
        .map(|e| format!("{} at {}", e, display_instance_path(&e.instance_path.to_string())))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// The document root has an empty JSON pointer; name it.
fn display_instance_path(pointer: &str) -> &str {
    if pointer.is_empty() {
        "/"
    } else {
        pointer
    }
}
