//! A2A envelope: the uniform request wrapper on the inter-agent bus.
//!
//! Every message between agents travels as an envelope. Validation is
//! all-or-nothing: a malformed envelope is rejected before any handler
//! sees it, with every violation listed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The six required envelope fields.
pub const ENVELOPE_FIELDS: [&str; 6] = [
    "message_id",
    "from_agent",
    "to_agent",
    "timestamp",
    "correlation_id",
    "payload",
];

/// An A2A envelope. `payload` must be a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// `msg-<uuid>`.
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub timestamp: DateTime<Utc>,
    /// Conversation id; carried across request/response pairs.
    pub correlation_id: String,
    pub payload: Value,
}

impl Envelope {
    /// Build a request envelope with a fresh message id and correlation id.
    pub fn request(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        payload: Value,
    ) -> Self {
        let message_id = format!("msg-{}", Uuid::new_v4());
        Self {
            correlation_id: message_id.clone(),
            message_id,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Carry an existing correlation id onto this envelope.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Validate the envelope shape. Accumulates every violation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        if self.message_id.trim().is_empty() {
            violations.push("message_id must be non-empty".to_string());
        }
        if self.from_agent.trim().is_empty() {
            violations.push("from_agent must be non-empty".to_string());
        }
        if self.to_agent.trim().is_empty() {
            violations.push("to_agent must be non-empty".to_string());
        }
        if self.correlation_id.trim().is_empty() {
            violations.push("correlation_id must be non-empty".to_string());
        }
        if !self.payload.is_object() {
            violations.push("payload must be an object".to_string());
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Validate a raw JSON value as an envelope, listing every missing or
    /// malformed field before any deserialization shortcut can mask one.
    pub fn validate_value(value: &Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        let Some(obj) = value.as_object() else {
            return Err(vec!["envelope must be an object".to_string()]);
        };
        for field in ENVELOPE_FIELDS {
            match obj.get(field) {
                None | Some(Value::Null) => {
                    violations.push(format!("missing field: {field}"));
                }
                Some(v) if field == "payload" => {
                    if !v.is_object() {
                        violations.push("payload must be an object".to_string());
                    }
                }
                Some(v) => {
                    let empty_string = v.as_str().is_some_and(|s| s.trim().is_empty());
                    if !v.is_string() || empty_string {
                        violations.push(format!("{field} must be a non-empty string"));
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_is_valid() {
        let env = Envelope::request("vigil-coordinator", "vigil-triage", json!({"alert": {}}));
        assert!(env.validate().is_ok());
        assert!(env.message_id.starts_with("msg-"));
        assert_eq!(env.correlation_id, env.message_id);
    }

    #[test]
    fn test_with_correlation_overrides() {
        let env = Envelope::request("a", "b", json!({}))
            .with_correlation("msg-existing");
        assert_eq!(env.correlation_id, "msg-existing");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let mut env = Envelope::request("a", "b", json!({}));
        env.payload = json!([1, 2, 3]);
        let violations = env.validate().unwrap_err();
        assert_eq!(violations, vec!["payload must be an object".to_string()]);

        env.payload = json!("scalar");
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_value_lists_every_violation() {
        let raw = json!({
            "message_id": "msg-1",
            "to_agent": "",
            "payload": [1]
        });
        let violations = Envelope::validate_value(&raw).unwrap_err();
        assert!(violations.iter().any(|v| v.contains("from_agent")));
        assert!(violations.iter().any(|v| v.contains("to_agent")));
        assert!(violations.iter().any(|v| v.contains("timestamp")));
        assert!(violations.iter().any(|v| v.contains("correlation_id")));
        assert!(violations.iter().any(|v| v.contains("payload")));
        assert_eq!(violations.len(), 5);
    }

    #[test]
    fn test_validate_value_accepts_complete_envelope() {
        let raw = json!({
            "message_id": "msg-1",
            "from_agent": "vigil-coordinator",
            "to_agent": "vigil-triage",
            "timestamp": "2026-01-01T00:00:00Z",
            "correlation_id": "msg-1",
            "payload": {"alert": {}}
        });
        assert!(Envelope::validate_value(&raw).is_ok());
    }

    #[test]
    fn test_validate_value_rejects_non_object() {
        let violations = Envelope::validate_value(&json!("nope")).unwrap_err();
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_blank_fields_rejected() {
        let mut env = Envelope::request("a", "b", json!({}));
        env.from_agent = "  ".to_string();
        env.correlation_id = String::new();
        let violations = env.validate().unwrap_err();
        assert_eq!(violations.len(), 2);
    }
}
