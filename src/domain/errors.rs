//! Domain error types for the Vigil orchestrator.
//!
//! Each enum covers one component boundary. Transient classification
//! (HTTP 429 or any 5xx on the transport) drives the retry primitive.

use thiserror::Error;

/// Errors surfaced by the document store adapter.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Document missing from the given index.
    #[error("Document not found: {index}/{id}")]
    NotFound { index: String, id: String },

    /// Create-only write hit an existing document.
    #[error("Document already exists: {index}/{id}")]
    AlreadyExists { index: String, id: String },

    /// Optimistic-concurrency tokens did not match the current document.
    #[error("Concurrency conflict on {index}/{id}")]
    ConcurrencyConflict { index: String, id: String },

    /// Transport-level failure with an HTTP-like status.
    #[error("Store transport error {status}: {message}")]
    Transport { status: u16, message: String },

    /// Query was rejected by the engine.
    #[error("Query failed: {0}")]
    Query(String),

    /// Document could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient errors are retried with backoff; everything else surfaces.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { status, .. } if *status == 429 || *status >= 500)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the incident state machine.
#[derive(Error, Debug)]
pub enum TransitionError {
    /// Requested status is not in the allowed-successor set.
    #[error("Invalid transition from {from} to {to} (allowed: {allowed:?})")]
    InvalidTransition {
        from: String,
        to: String,
        allowed: Vec<&'static str>,
    },

    /// A registered guard denied the transition.
    #[error("Guard denied {from} -> {to}: {reason}")]
    GuardDenied {
        from: String,
        to: String,
        reason: String,
    },

    /// Optimistic-concurrency retries exhausted.
    #[error("Concurrency conflict updating incident {0} after retries")]
    ConcurrencyConflict(String),

    /// Incident document missing.
    #[error("Incident not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Incident serialization error: {0}")]
    Serialization(String),
}

/// Errors from the A2A bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// Envelope failed shape validation; every violation is listed.
    #[error("Invalid envelope: {}", .0.join("; "))]
    InvalidEnvelope(Vec<String>),

    /// No handler registered under the target agent id.
    #[error("No such agent: {0}")]
    NoSuchAgent(String),

    /// Handler did not respond within the per-call timeout.
    #[error("Agent {agent} did not respond within {timeout_ms}ms")]
    DeadlineExceeded { agent: String, timeout_ms: u64 },

    /// Handler returned an error.
    #[error("Agent {agent} failed: {message}")]
    Handler { agent: String, message: String },
}

/// Errors from the tool registry.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool {tool}: missing required parameter '{param}'")]
    MissingParam { tool: String, param: String },

    #[error("Tool {tool}: parameter '{param}' must be {expected}")]
    InvalidParam {
        tool: String,
        param: String,
        expected: &'static str,
    },

    #[error("Tool {tool} query failed: {source}")]
    Query {
        tool: String,
        #[source]
        source: StoreError,
    },

    #[error("Tool {tool} timed out after {timeout_ms}ms")]
    DeadlineExceeded { tool: String, timeout_ms: u64 },

    /// Definition file was malformed or unreadable.
    #[error("Tool definition error: {0}")]
    Definition(String),
}

impl ToolError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Query { source, .. } if source.is_transient())
    }
}

/// Errors from worker agents.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Request payload failed contract validation.
    #[error("Contract validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Agent deadline fired before the composed operation settled.
    #[error("Agent deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] Box<BusError>),

    /// An effector workflow returned a non-success payload.
    #[error("Workflow failure: {0}")]
    Workflow(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_transient_classification() {
        assert!(StoreError::Transport {
            status: 429,
            message: "throttled".to_string()
        }
        .is_transient());
        assert!(StoreError::Transport {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(!StoreError::Transport {
            status: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!StoreError::NotFound {
            index: "vigil-incidents".to_string(),
            id: "INC-1".to_string()
        }
        .is_transient());
        assert!(!StoreError::ConcurrencyConflict {
            index: "vigil-incidents".to_string(),
            id: "INC-1".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_tool_error_transient_delegates_to_store() {
        let transient = ToolError::Query {
            tool: "alert-enrichment".to_string(),
            source: StoreError::Transport {
                status: 502,
                message: "bad gateway".to_string(),
            },
        };
        assert!(transient.is_transient());

        let permanent = ToolError::Query {
            tool: "alert-enrichment".to_string(),
            source: StoreError::Query("syntax".to_string()),
        };
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_invalid_envelope_lists_all_violations() {
        let err = BusError::InvalidEnvelope(vec![
            "missing field: from_agent".to_string(),
            "payload must be an object".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("from_agent"));
        assert!(msg.contains("payload"));
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError::InvalidTransition {
            from: "resolved".to_string(),
            to: "executing".to_string(),
            allowed: vec![],
        };
        assert!(err.to_string().contains("resolved"));
        assert!(err.to_string().contains("executing"));
    }
}
