//! Integrity disclosure metrics.
//!
//! `integrity_protocol.disclosure_schema.fields` names the metrics the
//! repository publishes. Fields the protocol itself can answer are filled
//! in; measured values (intervention rates, audit counts, ...) come from
//! outside the engine and are published as `null` until supplied.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use crate::artifact::{write_atomic, ArtifactError};
use crate::layout::Layout;
use crate::protocol::Protocol;

const DEFAULT_MODEL_VERSION: &str = "0.0.0";

/// Metric name -> value for every disclosed field.
pub fn metrics_snapshot(protocol: &Protocol) -> BTreeMap<String, Value> {
    let integrity = &protocol.integrity_protocol;
    let fields = integrity
        .disclosure_schema
        .as_ref()
        .map(|d| d.fields.as_slice())
        .unwrap_or(&[]);

    fields
        .iter()
        .map(|field| {
            let value = match field.as_str() {
                "model_version" => {
                    Value::from(protocol.version().unwrap_or(DEFAULT_MODEL_VERSION))
                }
                "odds" => integrity
                    .operational_spec
                    .as_ref()
                    .and_then(|spec| spec.get("odds"))
                    .cloned()
                    .unwrap_or_else(|| Value::from("")),
                _ => Value::Null,
            };
            (field.clone(), value)
        })
        .collect()
}

/// Load the protocol from `layout` and publish its metrics snapshot.
pub fn regenerate_metrics(layout: &Layout) -> Result<BTreeMap<String, Value>, ArtifactError> {
    let protocol = Protocol::load(&layout.protocol_path)?;
    let metrics = metrics_snapshot(&protocol);
    let json = serde_json::to_string_pretty(&metrics)?;
    write_atomic(&layout.metrics_path, json.as_bytes())?;
    info!(path = %layout.metrics_path.display(), fields = metrics.len(), "integrity metrics written");
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(integrity: serde_json::Value) -> Protocol {
        let value = serde_json::json!({
            "operational_protocol": { "sourcing": { "data_sources": {} } },
            "output_schema": {},
            "integrity_protocol": integrity
        });
        Protocol::from_value(value, std::path::Path::new("test.json")).unwrap()
    }

    #[test]
    fn test_snapshot_fills_known_fields() {
        let p = protocol(serde_json::json!({
            "version": "1.4.0",
            "disclosure_schema": {
                "fields": ["model_version", "odds", "open_audit_cases"]
            },
            "operational_spec": { "odds": "3:1" }
        }));
        let metrics = metrics_snapshot(&p);

        assert_eq!(metrics["model_version"], "1.4.0");
        assert_eq!(metrics["odds"], "3:1");
        assert!(metrics["open_audit_cases"].is_null());
    }

    #[test]
    fn test_snapshot_defaults() {
        let p = protocol(serde_json::json!({
            "disclosure_schema": { "fields": ["model_version", "odds"] }
        }));
        let metrics = metrics_snapshot(&p);
        assert_eq!(metrics["model_version"], DEFAULT_MODEL_VERSION);
        assert_eq!(metrics["odds"], "");
    }

    #[test]
    fn test_no_disclosure_schema_means_no_metrics() {
        assert!(metrics_snapshot(&protocol(serde_json::json!({}))).is_empty());
    }

    #[test]
    fn test_regenerate_metrics_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.protocol_path.parent().unwrap()).unwrap();
        std::fs::write(
            &layout.protocol_path,
            r#"{
                "operational_protocol": { "sourcing": { "data_sources": {} } },
                "output_schema": {},
                "integrity_protocol": {
                    "version": "1.0.0",
                    "disclosure_schema": { "fields": ["model_version"] }
                }
            }"#,
        )
        .unwrap();

        regenerate_metrics(&layout).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&layout.metrics_path).unwrap()).unwrap();
        assert_eq!(written, serde_json::json!({ "model_version": "1.0.0" }));
    }
}
