//! Per-incident state machine.
//!
//! Transitions are checked against the allowed-successor table, then against
//! the guard registry, then committed through an optimistic-concurrency
//! read-modify-write cycle with bounded retries. Every committed transition
//! emits an audit row; terminal transitions notify the analyst hook.
//!
//! Guards are evaluated against the proposed document (current state with
//! the caller's metadata merged), so a transition can carry the field that
//! justifies it (an approval decision, a verification result, a stored
//! plan) in one atomic step.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::domain::errors::{StoreError, TransitionError};
use crate::domain::indices;
use crate::domain::models::{
    ActionRecord, ApprovalStatus, Incident, IncidentStatus, ResolutionType,
};
use crate::domain::ports::store::{Refresh, Store};

/// Outcome of a guard evaluation.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub allowed: bool,
    pub redirect_to: Option<IncidentStatus>,
    pub reason: Option<String>,
}

impl GuardVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            redirect_to: None,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            redirect_to: None,
            reason: Some(reason.into()),
        }
    }

    pub fn redirect(to: IncidentStatus, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            redirect_to: Some(to),
            reason: Some(reason.into()),
        }
    }
}

/// Notification that an incident reached a terminal state.
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub incident_id: String,
    pub status: IncidentStatus,
}

/// Configuration for the state machine guards.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Strictly-below this priority score, triage suppresses.
    pub suppress_threshold: f64,
    /// Reflection iterations before forced escalation.
    pub max_reflection_loops: u32,
    /// Optimistic-concurrency commit attempts per transition.
    pub occ_retries: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            suppress_threshold: 0.4,
            max_reflection_loops: 3,
            occ_retries: 3,
        }
    }
}

/// The incident state machine.
pub struct IncidentStateMachine {
    store: Arc<dyn Store>,
    config: StateMachineConfig,
    terminal_tx: Option<mpsc::UnboundedSender<TerminalEvent>>,
}

impl IncidentStateMachine {
    pub fn new(store: Arc<dyn Store>, config: StateMachineConfig) -> Self {
        Self {
            store,
            config,
            terminal_tx: None,
        }
    }

    /// Attach the terminal-transition hook. Events are delivered after the
    /// state write committed with wait-for-visible refresh, so the consumer
    /// always observes the committed document.
    pub fn with_terminal_hook(mut self, tx: mpsc::UnboundedSender<TerminalEvent>) -> Self {
        self.terminal_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Create the incident document (create-only).
    pub async fn create_incident(&self, incident: &Incident) -> Result<(), TransitionError> {
        let doc = serde_json::to_value(incident)
            .map_err(|e| TransitionError::Serialization(e.to_string()))?;
        self.store
            .create(indices::INCIDENTS, &incident.incident_id, doc, Refresh::WaitFor)
            .await?;
        Ok(())
    }

    /// Versioned read of an incident.
    pub async fn load(&self, incident_id: &str) -> Result<Incident, TransitionError> {
        let versioned = self.store.get(indices::INCIDENTS, incident_id).await.map_err(
            |e| match e {
                StoreError::NotFound { .. } => TransitionError::NotFound(incident_id.to_string()),
                other => TransitionError::Store(other),
            },
        )?;
        serde_json::from_value(versioned.doc)
            .map_err(|e| TransitionError::Serialization(e.to_string()))
    }

    /// Drive one transition, applying the reflection-limit rule: a commit
    /// into `reflecting` whose incremented count has reached the bound is
    /// immediately followed by `reflecting -> escalated`.
    pub async fn transition(
        &self,
        incident_id: &str,
        new_status: IncidentStatus,
        metadata: Value,
    ) -> Result<Incident, TransitionError> {
        let incident = self
            .transition_once(incident_id, new_status, metadata)
            .await?;

        if incident.status == IncidentStatus::Reflecting
            && incident.reflection_count >= self.config.max_reflection_loops
        {
            tracing::warn!(
                incident_id,
                reflection_count = incident.reflection_count,
                "reflection limit reached, escalating"
            );
            return self
                .transition_once(
                    incident_id,
                    IncidentStatus::Escalated,
                    json!({
                        "escalation_reason": format!(
                            "reflection limit reached ({})",
                            self.config.max_reflection_loops
                        ),
                    }),
                )
                .await;
        }
        Ok(incident)
    }

    async fn transition_once(
        &self,
        incident_id: &str,
        requested: IncidentStatus,
        metadata: Value,
    ) -> Result<Incident, TransitionError> {
        let mut attempt = 0u32;
        loop {
            let versioned = self.store.get(indices::INCIDENTS, incident_id).await.map_err(
                |e| match e {
                    StoreError::NotFound { .. } => {
                        TransitionError::NotFound(incident_id.to_string())
                    }
                    other => TransitionError::Store(other),
                },
            )?;
            let incident: Incident = serde_json::from_value(versioned.doc.clone())
                .map_err(|e| TransitionError::Serialization(e.to_string()))?;
            let current = incident.status;

            let new_status = self.resolve_target(&incident, &versioned.doc, requested, &metadata)?;

            let patch = self.compose_patch(&incident, new_status, &metadata);
            let mut updated_doc = versioned.doc.clone();
            shallow_merge(&mut updated_doc, &patch);

            match self
                .store
                .update(
                    indices::INCIDENTS,
                    incident_id,
                    patch,
                    versioned.token(),
                    Refresh::WaitFor,
                )
                .await
            {
                Ok(()) => {
                    let updated: Incident = serde_json::from_value(updated_doc)
                        .map_err(|e| TransitionError::Serialization(e.to_string()))?;
                    tracing::info!(
                        incident_id,
                        from = current.as_str(),
                        to = new_status.as_str(),
                        "incident transitioned"
                    );
                    self.emit_audit(&updated, current, new_status, &metadata).await;
                    if new_status.is_terminal() {
                        self.notify_terminal(&updated);
                    }
                    return Ok(updated);
                }
                Err(StoreError::ConcurrencyConflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.occ_retries {
                        return Err(TransitionError::ConcurrencyConflict(
                            incident_id.to_string(),
                        ));
                    }
                    tracing::debug!(incident_id, attempt, "concurrency conflict, re-reading");
                }
                Err(other) => return Err(TransitionError::Store(other)),
            }
        }
    }

    /// Check the transition table and guards; returns the (possibly
    /// redirected) target status.
    fn resolve_target(
        &self,
        incident: &Incident,
        current_doc: &Value,
        requested: IncidentStatus,
        metadata: &Value,
    ) -> Result<IncidentStatus, TransitionError> {
        let current = incident.status;
        if !current.can_transition_to(requested) {
            return Err(TransitionError::InvalidTransition {
                from: current.as_str().to_string(),
                to: requested.as_str().to_string(),
                allowed: current
                    .valid_transitions()
                    .iter()
                    .map(|s| s.as_str())
                    .collect(),
            });
        }

        // Guards see the proposed document: current state plus metadata.
        let mut proposed_doc = current_doc.clone();
        shallow_merge(&mut proposed_doc, metadata);
        let proposed: Incident = serde_json::from_value(proposed_doc)
            .map_err(|e| TransitionError::Serialization(e.to_string()))?;

        let verdict = self.evaluate_guard(&proposed, current, requested);
        if verdict.allowed {
            return Ok(requested);
        }
        if let Some(redirect) = verdict.redirect_to {
            if !current.can_transition_to(redirect) {
                return Err(TransitionError::InvalidTransition {
                    from: current.as_str().to_string(),
                    to: redirect.as_str().to_string(),
                    allowed: current
                        .valid_transitions()
                        .iter()
                        .map(|s| s.as_str())
                        .collect(),
                });
            }
            let redirected = self.evaluate_guard(&proposed, current, redirect);
            if redirected.allowed {
                tracing::info!(
                    incident_id = %incident.incident_id,
                    from = current.as_str(),
                    requested = requested.as_str(),
                    redirected_to = redirect.as_str(),
                    "guard redirected transition"
                );
                return Ok(redirect);
            }
        }
        Err(TransitionError::GuardDenied {
            from: current.as_str().to_string(),
            to: requested.as_str().to_string(),
            reason: verdict.reason.unwrap_or_else(|| "guard denied".to_string()),
        })
    }

    /// The guard registry. Pairs without an entry are allowed.
    fn evaluate_guard(
        &self,
        proposed: &Incident,
        from: IncidentStatus,
        to: IncidentStatus,
    ) -> GuardVerdict {
        use IncidentStatus::{
            AwaitingApproval, Escalated, Executing, Investigating, Planning, Reflecting, Resolved,
            Suppressed, Triaged, Verifying,
        };
        let threshold = self.config.suppress_threshold;
        match (from, to) {
            (Triaged, Suppressed) => {
                if proposed.priority_score < threshold {
                    GuardVerdict::allow()
                } else {
                    GuardVerdict::deny(format!(
                        "priority_score {} is at or above suppress threshold {threshold}",
                        proposed.priority_score
                    ))
                }
            }
            (Triaged, Investigating) => {
                if proposed.priority_score >= threshold {
                    GuardVerdict::allow()
                } else {
                    GuardVerdict::redirect(
                        Suppressed,
                        format!(
                            "priority_score {} below suppress threshold {threshold}",
                            proposed.priority_score
                        ),
                    )
                }
            }
            (Planning, AwaitingApproval) => match &proposed.remediation_plan {
                Some(plan) if plan.any_approval_required() => GuardVerdict::allow(),
                Some(_) => GuardVerdict::deny("no planned action requires approval"),
                None => GuardVerdict::deny("no remediation plan stored"),
            },
            (Planning, Executing) => match &proposed.remediation_plan {
                Some(plan) if !plan.any_approval_required() => GuardVerdict::allow(),
                Some(_) => GuardVerdict::deny("plan contains approval-gated actions"),
                None => GuardVerdict::deny("no remediation plan stored"),
            },
            (AwaitingApproval, Executing) => match proposed.approval_status {
                Some(ApprovalStatus::Approved) => GuardVerdict::allow(),
                other => GuardVerdict::deny(format!(
                    "approval_status is {:?}, not approved",
                    other.map(|s| s.as_str())
                )),
            },
            (AwaitingApproval, Escalated) => match proposed.approval_status {
                Some(ApprovalStatus::Rejected | ApprovalStatus::Timeout) => GuardVerdict::allow(),
                other => GuardVerdict::deny(format!(
                    "approval_status is {:?}, not rejected or timeout",
                    other.map(|s| s.as_str())
                )),
            },
            (Verifying, Resolved) => match proposed.last_verification() {
                Some(v) if v.passed => GuardVerdict::allow(),
                Some(_) => GuardVerdict::deny("verification did not pass"),
                None => GuardVerdict::deny("no verification result recorded"),
            },
            (Verifying, Reflecting) => match proposed.last_verification() {
                Some(v) if !v.passed => GuardVerdict::allow(),
                Some(_) => GuardVerdict::deny("verification passed, nothing to reflect on"),
                None => GuardVerdict::deny("no verification result recorded"),
            },
            (Reflecting, Escalated) => {
                if proposed.reflection_count >= self.config.max_reflection_loops {
                    GuardVerdict::allow()
                } else {
                    GuardVerdict::deny(format!(
                        "reflection_count {} below limit {}",
                        proposed.reflection_count, self.config.max_reflection_loops
                    ))
                }
            }
            _ => GuardVerdict::allow(),
        }
    }

    /// Compose the update patch. Caller metadata merges first; the state
    /// machine's own fields always win.
    fn compose_patch(
        &self,
        incident: &Incident,
        new_status: IncidentStatus,
        metadata: &Value,
    ) -> Value {
        let now = Utc::now();
        let mut patch = serde_json::Map::new();
        if let Some(meta) = metadata.as_object() {
            for (k, v) in meta {
                patch.insert(k.clone(), v.clone());
            }
        }
        patch.insert("status".to_string(), json!(new_status.as_str()));
        patch.insert("updated_at".to_string(), json!(now));

        // First entry into each state only.
        let mut timestamps = incident.state_timestamps.clone();
        timestamps
            .entry(new_status.as_str().to_string())
            .or_insert(now);
        patch.insert("_state_timestamps".to_string(), json!(timestamps));

        if new_status == IncidentStatus::Reflecting {
            patch.insert(
                "reflection_count".to_string(),
                json!(incident.reflection_count + 1),
            );
        }

        if new_status.is_terminal() {
            patch.insert("resolved_at".to_string(), json!(now));
            if let Some(resolution) = ResolutionType::for_status(new_status) {
                patch.insert("resolution_type".to_string(), json!(resolution));
            }
            let duration = (now - incident.created_at).num_seconds().max(0);
            patch.insert("total_duration_seconds".to_string(), json!(duration));
        } else if incident.resolved_at.is_some() {
            // Re-opened incident: resolved_at is set iff the status is
            // terminal.
            patch.insert("resolved_at".to_string(), Value::Null);
            patch.insert("resolution_type".to_string(), Value::Null);
            patch.insert("total_duration_seconds".to_string(), Value::Null);
        }
        Value::Object(patch)
    }

    /// Write the transition audit row. Failures are logged, never surfaced.
    async fn emit_audit(
        &self,
        incident: &Incident,
        previous: IncidentStatus,
        new: IncidentStatus,
        metadata: &Value,
    ) {
        let detail = metadata
            .get("reason")
            .or_else(|| metadata.get("escalation_reason"))
            .and_then(Value::as_str)
            .map_or_else(
                || format!("{} -> {}", previous.as_str(), new.as_str()),
                ToString::to_string,
            );
        let record =
            ActionRecord::state_transition(&incident.incident_id, previous, new, detail);
        let doc = match serde_json::to_value(&record) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(incident_id = %incident.incident_id, error = %e, "audit serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .store
            .index(indices::ACTIONS, Some(&record.action_id), doc, Refresh::WaitFor)
            .await
        {
            tracing::error!(
                incident_id = %incident.incident_id,
                action_id = %record.action_id,
                error = %e,
                "audit write failed"
            );
        }
    }

    fn notify_terminal(&self, incident: &Incident) {
        if let Some(tx) = &self.terminal_tx {
            let event = TerminalEvent {
                incident_id: incident.incident_id.clone(),
                status: incident.status,
            };
            if let Err(e) = tx.send(event) {
                tracing::warn!(
                    incident_id = %incident.incident_id,
                    error = %e,
                    "terminal hook delivery failed"
                );
            }
        }
    }
}

fn shallow_merge(doc: &mut Value, patch: &Value) {
    if let (Some(target), Some(source)) = (doc.as_object_mut(), patch.as_object()) {
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
    }
}
