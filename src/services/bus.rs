//! A2A bus: logical agent addressing over in-process handlers.
//!
//! The bus validates the envelope, resolves the target handler, and runs it
//! under the caller's timeout. It does not interpret payloads and does not
//! retry; retry is the caller's choice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::errors::{AgentError, BusError};
use crate::domain::models::Envelope;
use crate::services::concurrency::with_deadline;

/// A registered message handler. Handlers receive the envelope payload and
/// return the response object.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError>;
}

/// Adapter to register a closure as a handler. Used heavily by tests and by
/// effector workflow stubs.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> AgentHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, AgentError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        (self.0)(payload).await
    }
}

/// Default per-call timeout when the caller does not specify one.
pub const DEFAULT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The bus: a mapping from logical agent id to handler.
#[derive(Default)]
pub struct AgentBus {
    handlers: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a logical agent id. Re-registering replaces
    /// the previous handler.
    pub async fn register(&self, agent_id: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        let agent_id = agent_id.into();
        tracing::debug!(agent = %agent_id, "registering agent handler");
        self.handlers.write().await.insert(agent_id, handler);
    }

    pub async fn unregister(&self, agent_id: &str) {
        self.handlers.write().await.remove(agent_id);
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send an envelope to its target under a timeout.
    ///
    /// 1. Validate the envelope shape (all-or-nothing).
    /// 2. Resolve the target handler.
    /// 3. Race the handler against the timeout.
    pub async fn send(
        &self,
        envelope: &Envelope,
        timeout: std::time::Duration,
    ) -> Result<Value, BusError> {
        envelope.validate().map_err(BusError::InvalidEnvelope)?;

        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&envelope.to_agent)
                .cloned()
                .ok_or_else(|| BusError::NoSuchAgent(envelope.to_agent.clone()))?
        };

        tracing::debug!(
            message_id = %envelope.message_id,
            from = %envelope.from_agent,
            to = %envelope.to_agent,
            correlation_id = %envelope.correlation_id,
            "dispatching envelope"
        );

        let payload = envelope.payload.clone();
        match with_deadline(timeout, handler.handle(payload)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(BusError::Handler {
                agent: envelope.to_agent.clone(),
                message: err.to_string(),
            }),
            Err(_) => Err(BusError::DeadlineExceeded {
                agent: envelope.to_agent.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn echo_handler() -> Arc<dyn AgentHandler> {
        Arc::new(FnHandler(|payload: Value| async move {
            Ok(json!({"echo": payload}))
        }))
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let bus = AgentBus::new();
        bus.register("vigil-triage", echo_handler()).await;

        let envelope = Envelope::request("vigil-coordinator", "vigil-triage", json!({"x": 1}));
        let response = bus.send(&envelope, DEFAULT_SEND_TIMEOUT).await.unwrap();
        assert_eq!(response["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent() {
        let bus = AgentBus::new();
        let envelope = Envelope::request("a", "vigil-ghost", json!({}));
        let err = bus.send(&envelope, DEFAULT_SEND_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BusError::NoSuchAgent(agent) if agent == "vigil-ghost"));
    }

    #[tokio::test]
    async fn test_send_rejects_malformed_envelope_before_dispatch() {
        let bus = AgentBus::new();
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        bus.register(
            "vigil-triage",
            Arc::new(FnHandler(move |_| {
                let called = Arc::clone(&called_clone);
                async move {
                    called.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(json!({}))
                }
            })),
        )
        .await;

        let mut envelope = Envelope::request("", "vigil-triage", json!({}));
        envelope.payload = json!(42);
        let err = bus.send(&envelope, DEFAULT_SEND_TIMEOUT).await.unwrap_err();
        match err {
            BusError::InvalidEnvelope(violations) => assert_eq!(violations.len(), 2),
            other => panic!("expected InvalidEnvelope, got {other:?}"),
        }
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_slow_handler() {
        let bus = AgentBus::new();
        bus.register(
            "vigil-slow",
            Arc::new(FnHandler(|_| async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(json!({}))
            })),
        )
        .await;

        let envelope = Envelope::request("a", "vigil-slow", json!({}));
        let err = bus.send(&envelope, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::DeadlineExceeded { timeout_ms: 100, .. }
        ));
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_with_agent_id() {
        let bus = AgentBus::new();
        bus.register(
            "vigil-broken",
            Arc::new(FnHandler(|_| async {
                Err(AgentError::Workflow("effector returned failure".to_string()))
            })),
        )
        .await;

        let envelope = Envelope::request("a", "vigil-broken", json!({}));
        let err = bus.send(&envelope, DEFAULT_SEND_TIMEOUT).await.unwrap_err();
        match err {
            BusError::Handler { agent, message } => {
                assert_eq!(agent, "vigil-broken");
                assert!(message.contains("effector returned failure"));
            }
            other => panic!("expected Handler, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let bus = AgentBus::new();
        bus.register("vigil-x", Arc::new(FnHandler(|_| async { Ok(json!({"v": 1})) })))
            .await;
        bus.register("vigil-x", Arc::new(FnHandler(|_| async { Ok(json!({"v": 2})) })))
            .await;
        let envelope = Envelope::request("a", "vigil-x", json!({}));
        let response = bus.send(&envelope, DEFAULT_SEND_TIMEOUT).await.unwrap();
        assert_eq!(response["v"], 2);
        assert_eq!(bus.registered_agents().await, vec!["vigil-x".to_string()]);
    }
}
