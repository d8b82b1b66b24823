// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-boundary validation of event payloads.
//!
//! Every append runs its payload through [`validate_payload`]: the event
//! log serializes the payload and checks it against the generated schema
//! for [`EventPayload`](crate::EventPayload) before committing, and raw
//! sandbox JSON is decoded through the same function. Validation happens
//! at the boundary, not at client render time.

use crate::event::EventPayload;
use std::sync::LazyLock;

/// Compiled JSON Schema for [`EventPayload`], built once per process.
static PAYLOAD_VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let schema = schemars::schema_for!(EventPayload);
    let value = serde_json::to_value(&schema).expect("payload schema serializes");
    jsonschema::validator_for(&value).expect("payload schema compiles")
});

/// Errors from [`validate_payload`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The raw value does not conform to any payload variant's schema.
    #[error("payload failed schema validation: {reasons:?}")]
    Schema {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// The value passed the schema but could not be decoded.
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Validate a raw JSON payload against the per-type schema and decode it.
///
/// # Errors
///
/// [`PayloadError::Schema`] when the value does not match the schema for
/// its declared `type`, [`PayloadError::Decode`] if decoding fails after
/// validation (should not happen for a conforming schema).
pub fn validate_payload(value: &serde_json::Value) -> Result<EventPayload, PayloadError> {
    let reasons: Vec<String> = PAYLOAD_VALIDATOR
        .iter_errors(value)
        .map(|e| e.to_string())
        .collect();
    if !reasons.is_empty() {
        return Err(PayloadError::Schema { reasons });
    }
    Ok(serde_json::from_value(value.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn valid_tool_call_payload_decodes() {
        let raw = json!({
            "type": "tool.called",
            "tool": "write",
            "tool_use_id": null,
            "args": {"path": "out.md", "content": "hello"},
        });
        let payload = validate_payload(&raw).unwrap();
        assert_eq!(payload.event_type(), EventType::ToolCalled);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = json!({"type": "tool.imagined", "tool": "x"});
        let err = validate_payload(&raw).unwrap_err();
        assert!(matches!(err, PayloadError::Schema { .. }));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        // tool.called without its args.
        let raw = json!({"type": "tool.called", "tool": "write"});
        assert!(validate_payload(&raw).is_err());
    }

    #[test]
    fn phase_change_payload_decodes() {
        let raw = json!({"type": "phase.changed", "from": "planning", "to": "executing"});
        let payload = validate_payload(&raw).unwrap();
        assert_eq!(payload.event_type(), EventType::PhaseChanged);
    }
}
