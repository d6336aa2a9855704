//! Inbound payload validation.
//!
//! Only presence is checked. Deep fields are stored as received.

use crate::db::{Snapshot, DEFAULT_MACHINE_ID, MACHINE_KEY};

use serde_json::{Map, Value};
use thiserror::Error;

/// Accepted spellings of the machine identifier, first match wins.
const MACHINE_ALIASES: [&str; 3] = [MACHINE_KEY, "machineId", "machine_id"];

/// Sections that mark a payload as a machine report. `gateway` alone is
/// the single-machine legacy shape.
const DISCRIMINATORS: [&str; 2] = ["system", "gateway"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("body is not a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// A payload that passed validation, with its machine resolved.
#[derive(Debug, Clone)]
pub struct ValidatedPush {
    pub snapshot: Snapshot,
    /// Alert objects from the payload, in payload order.
    pub alerts: Vec<Map<String, Value>>,
}

/// Validate a raw push body.
pub fn validate(body: &[u8]) -> Result<ValidatedPush, ValidationError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

    let Value::Object(mut document) = value else {
        return Err(ValidationError::NotAnObject);
    };

    if !document.contains_key("ts") {
        if let Some(ts) = document.remove("timestamp") {
            document.insert("ts".to_string(), ts);
        }
    }
    if !document.get("ts").is_some_and(is_truthy) {
        return Err(ValidationError::MissingField("ts"));
    }

    if !DISCRIMINATORS.iter().any(|key| document.contains_key(*key)) {
        return Err(ValidationError::MissingField("system"));
    }

    let machine_id = resolve_machine_id(&mut document);
    let alerts = extract_alerts(&document);

    Ok(ValidatedPush {
        snapshot: Snapshot::new(document, &machine_id),
        alerts,
    })
}

/// Pull the machine identifier out of whichever alias carries it.
fn resolve_machine_id(document: &mut Map<String, Value>) -> String {
    let mut resolved = None;
    for key in MACHINE_ALIASES {
        if let Some(value) = document.remove(key) {
            if resolved.is_none() {
                resolved = value
                    .as_str()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string);
            }
        }
    }
    resolved.unwrap_or_else(|| DEFAULT_MACHINE_ID.to_string())
}

fn extract_alerts(document: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let Some(Value::Array(items)) = document.get("alerts") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(alert) => Some(alert.clone()),
            other => {
                tracing::warn!("Skipping alert that is not an object: {}", other);
                None
            }
        })
        .collect()
}

/// Loose truthiness: null, false, zero and empty strings don't count.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
