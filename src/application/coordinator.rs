//! Coordinator: drives each incident through the response pipeline.
//!
//! Security flow: triage, suppress-gate, investigation, optional threat
//! hunt with the conflicting-assessments check, then the common planning /
//! approval / execution / verification path with a bounded reflection loop.
//! Operational flow: synthetic triage, change-correlation investigation,
//! same common path without the hunt. Every failure mode escalates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::errors::{AgentError, StoreError, TransitionError};
use crate::domain::indices::{self, agents};
use crate::domain::models::{
    Alert, AnomalyReport, AnomalyRole, ConfidenceBand, Disposition, Envelope, Incident,
    IncidentSource, IncidentStatus, InvestigationReport, RecommendedNext, RemediationPlan,
    Severity, ThreatScope, TimingMetrics, TriageReport, VerificationReport,
};
use crate::domain::ports::store::{Query, Refresh, SearchRequest, Sort, Store};
use crate::infrastructure::config::VigilConfig;
use crate::services::bus::AgentBus;
use crate::services::contracts;
use crate::services::state_machine::IncidentStateMachine;

/// Fixed synthetic priority for operational anomalies.
const OPERATIONAL_PRIORITY: f64 = 0.6;

/// Margin on top of a worker's own deadline for the bus call.
const BUS_MARGIN: Duration = Duration::from_secs(5);

/// The coordinator's answer for one driven incident.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorResponse {
    pub incident_id: String,
    /// `resolved`, `escalated`, or `suppressed`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CoordinatorResponse {
    fn resolved(incident_id: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            status: "resolved".to_string(),
            reason: None,
        }
    }

    fn suppressed(incident_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            status: "suppressed".to_string(),
            reason: Some(reason.into()),
        }
    }

    fn escalated(incident_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            status: "escalated".to_string(),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Error, Debug)]
enum FlowError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("agent call failed: {0}")]
    Bus(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

enum PlanApproval {
    Approved,
    Rejected { user: String },
    TimedOut,
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
    state_machine: Arc<IncidentStateMachine>,
    config: VigilConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<AgentBus>,
        state_machine: Arc<IncidentStateMachine>,
        config: VigilConfig,
    ) -> Self {
        Self {
            store,
            bus,
            state_machine,
            config,
        }
    }

    /// Drive a security alert to a terminal outcome.
    pub async fn handle_security_alert(&self, alert: Alert) -> CoordinatorResponse {
        let triage = self.run_triage(&alert).await;
        let incident = Incident::new(
            alert.alert_id.clone(),
            IncidentSource::SecurityAlert,
            alert.severity_original,
        )
        .with_rule(alert.rule_id.clone())
        .with_priority_score(triage.priority_score);

        if let Err(e) = self.state_machine.create_incident(&incident).await {
            tracing::error!(alert_id = %alert.alert_id, error = %e, "incident creation failed");
            return CoordinatorResponse::escalated(
                incident.incident_id,
                format!("incident creation failed: {e}"),
            );
        }
        let incident_id = incident.incident_id.clone();

        match self.security_flow(&incident_id, &alert, &triage).await {
            Ok(response) => response,
            Err(e) => self.fail_safe(&incident_id, incident.severity, &e.to_string()).await,
        }
    }

    /// Drive a sentinel anomaly to a terminal outcome.
    pub async fn handle_operational_anomaly(&self, anomaly: AnomalyReport) -> CoordinatorResponse {
        let severity = operational_severity(&anomaly);
        let incident = Incident::new(
            anomaly.anomaly_id.clone(),
            IncidentSource::OperationalAnomaly,
            severity,
        )
        .with_rule("ops-anomaly")
        .with_priority_score(OPERATIONAL_PRIORITY);

        if let Err(e) = self.state_machine.create_incident(&incident).await {
            tracing::error!(anomaly_id = %anomaly.anomaly_id, error = %e, "incident creation failed");
            return CoordinatorResponse::escalated(
                incident.incident_id,
                format!("incident creation failed: {e}"),
            );
        }
        let incident_id = incident.incident_id.clone();

        match self.operational_flow(&incident_id, &anomaly, severity).await {
            Ok(response) => response,
            Err(e) => self.fail_safe(&incident_id, severity, &e.to_string()).await,
        }
    }

    async fn security_flow(
        &self,
        incident_id: &str,
        alert: &Alert,
        triage: &TriageReport,
    ) -> Result<CoordinatorResponse, FlowError> {
        self.transition(
            incident_id,
            IncidentStatus::Triaged,
            json!({
                "priority_score": triage.priority_score,
                "reason": format!("triaged as {}", triage.disposition.as_str()),
            }),
        )
        .await?;

        // Suppress-gate: strictly below the threshold.
        if triage.priority_score < self.config.triage.suppress_threshold {
            self.transition(
                incident_id,
                IncidentStatus::Suppressed,
                json!({"reason": "priority below suppress threshold"}),
            )
            .await?;
            self.notify_terminal(incident_id, alert.severity_original, "suppressed").await;
            return Ok(CoordinatorResponse::suppressed(
                incident_id,
                format!("priority_score {} below suppress threshold", triage.priority_score),
            ));
        }

        self.transition(incident_id, IncidentStatus::Investigating, json!({})).await?;
        let investigation = self.call_investigator(incident_id, alert, "security", None).await?;

        if investigation.recommended_next == RecommendedNext::Escalate {
            return Err(FlowError::Bus(format!(
                "investigator recommends escalation: {}",
                investigation.root_cause
            )));
        }

        let mut threat_scope: Option<ThreatScope> = None;
        if investigation.recommended_next == RecommendedNext::ThreatHunt {
            self.transition(
                incident_id,
                IncidentStatus::ThreatHunting,
                investigation_metadata(&investigation),
            )
            .await?;
            let scope = self.call_threat_hunter(incident_id, alert, &investigation).await?;

            if let Some(conflict) = conflicting_assessments(&investigation, &scope) {
                self.transition(
                    incident_id,
                    IncidentStatus::Planning,
                    json!({"threat_scope": &scope}),
                )
                .await?;
                self.record_escalation(incident_id, &conflict, json!({
                    "investigator_confirmed": investigation.high_confidence_assets(),
                    "hunter_confirmed": scope.confirmed_ids(),
                }))
                .await;
                return Ok(CoordinatorResponse::escalated(incident_id, conflict));
            }
            self.transition(
                incident_id,
                IncidentStatus::Planning,
                json!({"threat_scope": &scope}),
            )
            .await?;
            threat_scope = Some(scope);
        } else {
            self.transition(
                incident_id,
                IncidentStatus::Planning,
                investigation_metadata(&investigation),
            )
            .await?;
        }

        self.remediation_flow(
            incident_id,
            alert,
            alert.severity_original,
            investigation,
            threat_scope,
        )
        .await
    }

    async fn operational_flow(
        &self,
        incident_id: &str,
        anomaly: &AnomalyReport,
        severity: Severity,
    ) -> Result<CoordinatorResponse, FlowError> {
        self.transition(
            incident_id,
            IncidentStatus::Triaged,
            json!({
                "priority_score": OPERATIONAL_PRIORITY,
                "reason": "synthetic triage for operational anomaly",
            }),
        )
        .await?;
        self.transition(incident_id, IncidentStatus::Investigating, json!({})).await?;

        let alert = operational_alert(anomaly, severity);
        let high_confidence_change = anomaly
            .recent_change
            .as_ref()
            .is_some_and(|c| c.confidence == ConfidenceBand::High);

        let investigation = if high_confidence_change {
            let change_event = json!(anomaly.recent_change);
            self.call_investigator(incident_id, &alert, "operational", Some(change_event))
                .await?
        } else {
            synthesize_operational_report(incident_id, anomaly)
        };

        // Threat hunt is skipped on the operational path.
        self.transition(
            incident_id,
            IncidentStatus::Planning,
            investigation_metadata(&investigation),
        )
        .await?;

        self.remediation_flow(incident_id, &alert, severity, investigation, None)
            .await
    }

    /// Common planning, approval, execution, and verification path.
    async fn remediation_flow(
        &self,
        incident_id: &str,
        alert: &Alert,
        severity: Severity,
        investigation: InvestigationReport,
        threat_scope: Option<ThreatScope>,
    ) -> Result<CoordinatorResponse, FlowError> {
        let plan = self
            .call_commander(incident_id, severity, &investigation, threat_scope.as_ref())
            .await?;

        if plan.any_approval_required() {
            self.transition(
                incident_id,
                IncidentStatus::AwaitingApproval,
                json!({"remediation_plan": &plan, "approval_status": "pending"}),
            )
            .await?;
            self.request_plan_approval(incident_id, &plan).await;

            match self.await_plan_approval(incident_id).await {
                PlanApproval::Approved => {
                    self.transition(
                        incident_id,
                        IncidentStatus::Executing,
                        json!({"approval_status": "approved"}),
                    )
                    .await?;
                }
                PlanApproval::Rejected { user } => {
                    let reason = format!("remediation plan rejected by {user}");
                    self.transition(
                        incident_id,
                        IncidentStatus::Escalated,
                        json!({"approval_status": "rejected", "escalation_reason": reason}),
                    )
                    .await?;
                    self.record_escalation(incident_id, &reason, json!({})).await;
                    self.notify_terminal(incident_id, severity, "escalated").await;
                    return Ok(CoordinatorResponse::escalated(incident_id, reason));
                }
                PlanApproval::TimedOut => {
                    let reason = "approval window expired".to_string();
                    self.transition(
                        incident_id,
                        IncidentStatus::Escalated,
                        json!({"approval_status": "timeout", "escalation_reason": reason}),
                    )
                    .await?;
                    self.record_escalation(incident_id, &reason, json!({})).await;
                    self.notify_terminal(incident_id, severity, "escalated").await;
                    return Ok(CoordinatorResponse::escalated(incident_id, reason));
                }
            }
        } else {
            self.transition(
                incident_id,
                IncidentStatus::Executing,
                json!({"remediation_plan": &plan}),
            )
            .await?;
        }

        let verification = self.execute_and_verify(incident_id, &plan, 0).await?;
        if verification.passed {
            let mut results = self.state_machine.load(incident_id).await?.verification_results;
            results.push(verification);
            return self.resolve_with_results(incident_id, results).await;
        }
        self.reflection_loop(incident_id, alert, severity, verification).await
    }

    /// Run the executor then the verifier, appending the verification
    /// result to the incident. Executor failure becomes a failed
    /// verification so the reflection path engages.
    async fn execute_and_verify(
        &self,
        incident_id: &str,
        plan: &RemediationPlan,
        attempt: u32,
    ) -> Result<VerificationReport, FlowError> {
        let exec_result = self.call_executor(incident_id, plan).await;
        self.transition(incident_id, IncidentStatus::Verifying, json!({})).await?;

        let verification = match exec_result {
            Ok(response) if response["status"] != "failed" => {
                let incident = self.state_machine.load(incident_id).await?;
                self.call_verifier(incident_id, &incident, plan, attempt)
                    .await
                    .unwrap_or_else(|e| failed_verification(incident_id, attempt, &e.to_string()))
            }
            Ok(response) => failed_verification(
                incident_id,
                attempt,
                response["error"].as_str().unwrap_or("execution failed"),
            ),
            Err(e) => failed_verification(incident_id, attempt, &e.to_string()),
        };

        Ok(verification)
    }

    /// Re-investigate, re-plan, re-execute, re-verify, at most
    /// `max_reflection_loops` times; the state machine escalates at the
    /// bound.
    async fn reflection_loop(
        &self,
        incident_id: &str,
        alert: &Alert,
        severity: Severity,
        mut verification: VerificationReport,
    ) -> Result<CoordinatorResponse, FlowError> {
        // Bounded by the state machine; the extra iteration allowance only
        // guards against a misconfigured bound.
        for _ in 0..=self.config.coordinator.max_reflection_loops {
            let mut results = self.state_machine.load(incident_id).await?.verification_results;
            results.push(verification.clone());

            let incident = self
                .transition(
                    incident_id,
                    IncidentStatus::Reflecting,
                    json!({"verification_results": results}),
                )
                .await?;
            if incident.status == IncidentStatus::Escalated {
                let reason = incident
                    .escalation_reason
                    .clone()
                    .unwrap_or_else(|| "reflection limit reached".to_string());
                self.record_escalation(incident_id, &reason, escalation_context(&incident))
                    .await;
                self.notify_terminal(incident_id, severity, "escalated").await;
                return Ok(CoordinatorResponse::escalated(incident_id, reason));
            }
            let attempt = incident.reflection_count;

            self.transition(incident_id, IncidentStatus::Investigating, json!({})).await?;
            let investigation = self
                .call_investigator(
                    incident_id,
                    alert,
                    "security",
                    verification.failure_analysis.clone().map(Value::from),
                )
                .await?;

            // Threat hunt and approval gates are first-pass concerns.
            self.transition(
                incident_id,
                IncidentStatus::Planning,
                investigation_metadata(&investigation),
            )
            .await?;
            let mut plan = self
                .call_commander(incident_id, severity, &investigation, None)
                .await?;
            for action in &mut plan.actions {
                action.approval_required = false;
            }
            plan.requires_approval = false;

            self.transition(
                incident_id,
                IncidentStatus::Executing,
                json!({"remediation_plan": &plan}),
            )
            .await?;

            verification = self.execute_and_verify(incident_id, &plan, attempt).await?;
            if verification.passed {
                let mut results = self.state_machine.load(incident_id).await?.verification_results;
                results.push(verification.clone());
                return self
                    .resolve_with_results(incident_id, results)
                    .await;
            }
        }
        // Unreachable when the state machine bound is intact.
        let reason = "reflection loop exhausted".to_string();
        self.record_escalation(incident_id, &reason, json!({})).await;
        Ok(CoordinatorResponse::escalated(incident_id, reason))
    }

    async fn resolve_with_results(
        &self,
        incident_id: &str,
        results: Vec<VerificationReport>,
    ) -> Result<CoordinatorResponse, FlowError> {
        let incident = self.state_machine.load(incident_id).await?;
        let metrics = timing_metrics(&incident, Utc::now());
        self.transition(
            incident_id,
            IncidentStatus::Resolved,
            json!({
                "verification_results": results,
                "timing_metrics": metrics,
            }),
        )
        .await?;
        tracing::info!(incident_id, "incident resolved");
        Ok(CoordinatorResponse::resolved(incident_id))
    }

    // ------------------------------------------------------------------
    // Worker calls
    // ------------------------------------------------------------------

    async fn run_triage(&self, alert: &Alert) -> TriageReport {
        let payload = json!({"alert": alert});
        let timeout = Duration::from_millis(self.config.triage.deadline_ms) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::TRIAGE, payload);
        match self.bus.send(&envelope, timeout).await {
            Ok(response) => {
                if let Err(e) = contracts::validate("triage_response", &response) {
                    tracing::warn!(alert_id = %alert.alert_id, error = %e, "triage response invalid");
                } else if let Ok(report) = serde_json::from_value::<TriageReport>(response) {
                    return report;
                }
            }
            Err(e) => {
                tracing::warn!(alert_id = %alert.alert_id, error = %e, "triage call failed");
            }
        }
        // Severity-only fallback keeps the pipeline moving.
        let score = alert.severity_original.weight();
        TriageReport {
            alert_id: alert.alert_id.clone(),
            priority_score: score,
            disposition: Disposition::from_score(
                score,
                self.config.triage.investigate_threshold,
                self.config.triage.suppress_threshold,
            ),
            factors: crate::domain::models::TriageFactors {
                severity: score,
                ..Default::default()
            },
            triaged_at: Utc::now(),
        }
    }

    async fn call_investigator(
        &self,
        incident_id: &str,
        alert: &Alert,
        mode: &str,
        context: Option<Value>,
    ) -> Result<InvestigationReport, FlowError> {
        let mut payload = json!({
            "incident_id": incident_id,
            "mode": mode,
            "alert": alert,
        });
        if let Some(context) = context {
            if mode == "operational" {
                payload["change_event"] = context;
            } else {
                payload["previous_failure_analysis"] = context;
            }
        }
        let timeout = Duration::from_millis(self.config.investigation.deadline_ms) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::INVESTIGATOR, payload);
        let response = self
            .bus
            .send(&envelope, timeout)
            .await
            .map_err(|e| FlowError::Bus(e.to_string()))?;
        contracts::validate("investigate_response", &response)
            .map_err(|e| FlowError::Contract(e.to_string()))?;
        serde_json::from_value(response).map_err(|e| FlowError::Contract(e.to_string()))
    }

    async fn call_threat_hunter(
        &self,
        incident_id: &str,
        alert: &Alert,
        investigation: &InvestigationReport,
    ) -> Result<ThreatScope, FlowError> {
        let ips: Vec<String> = alert.source_ip.clone().into_iter().collect();
        let users: Vec<String> = investigation
            .high_confidence_assets()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let payload = json!({
            "incident_id": incident_id,
            "iocs": {
                "ips": ips,
                "domains": intel_field(investigation, "domain"),
                "hashes": intel_field(investigation, "hash"),
                "processes": intel_field(investigation, "process"),
            },
            "compromised_users": users,
        });
        let timeout = Duration::from_millis(self.config.sweep.deadline_ms) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::THREAT_HUNTER, payload);
        let response = self
            .bus
            .send(&envelope, timeout)
            .await
            .map_err(|e| FlowError::Bus(e.to_string()))?;
        contracts::validate("sweep_response", &response)
            .map_err(|e| FlowError::Contract(e.to_string()))?;
        serde_json::from_value(response).map_err(|e| FlowError::Contract(e.to_string()))
    }

    async fn call_commander(
        &self,
        incident_id: &str,
        severity: Severity,
        investigation: &InvestigationReport,
        threat_scope: Option<&ThreatScope>,
    ) -> Result<RemediationPlan, FlowError> {
        let mut payload = json!({
            "incident_id": incident_id,
            "severity": severity.as_str(),
            "investigation": investigation,
        });
        if let Some(scope) = threat_scope {
            payload["threat_scope"] = json!(scope);
        }
        let timeout = Duration::from_millis(self.config.planning.deadline_ms) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::COMMANDER, payload);
        let response = self
            .bus
            .send(&envelope, timeout)
            .await
            .map_err(|e| FlowError::Bus(e.to_string()))?;
        contracts::validate("plan_response", &response)
            .map_err(|e| FlowError::Contract(e.to_string()))?;
        serde_json::from_value(response).map_err(|e| FlowError::Contract(e.to_string()))
    }

    async fn call_executor(
        &self,
        incident_id: &str,
        plan: &RemediationPlan,
    ) -> Result<Value, FlowError> {
        let payload = json!({
            "task": "execute_plan",
            "incident_id": incident_id,
            "actions": plan.actions,
        });
        let timeout = Duration::from_millis(self.config.executor.deadline_ms) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::EXECUTOR, payload);
        let response = self
            .bus
            .send(&envelope, timeout)
            .await
            .map_err(|e| FlowError::Bus(e.to_string()))?;
        contracts::validate("execute_response", &response)
            .map_err(|e| FlowError::Contract(e.to_string()))?;
        Ok(response)
    }

    async fn call_verifier(
        &self,
        incident_id: &str,
        incident: &Incident,
        plan: &RemediationPlan,
        attempt: u32,
    ) -> Result<VerificationReport, FlowError> {
        let payload = json!({
            "incident_id": incident_id,
            "affected_services": incident.affected_services,
            "success_criteria": plan.success_criteria,
            "attempt": attempt,
        });
        let timeout = Duration::from_secs(60) + BUS_MARGIN;
        let envelope = Envelope::request(agents::COORDINATOR, agents::VERIFIER, payload);
        let response = self
            .bus
            .send(&envelope, timeout)
            .await
            .map_err(|e| FlowError::Bus(e.to_string()))?;
        contracts::validate("verify_response", &response)
            .map_err(|e| FlowError::Contract(e.to_string()))?;
        serde_json::from_value(response).map_err(|e| FlowError::Contract(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Approval
    // ------------------------------------------------------------------

    async fn request_plan_approval(&self, incident_id: &str, plan: &RemediationPlan) {
        let gated: Vec<&str> = plan
            .actions
            .iter()
            .filter(|a| a.approval_required)
            .map(|a| a.description.as_str())
            .collect();
        let envelope = Envelope::request(
            agents::COORDINATOR,
            agents::WF_APPROVAL,
            json!({
                "incident_id": incident_id,
                "action_id": "plan",
                "summary": format!("{} action(s) require approval", gated.len()),
                "actions": gated,
            }),
        );
        if let Err(e) = self.bus.send(&envelope, Duration::from_secs(30)).await {
            tracing::warn!(incident_id, error = %e, "plan approval request delivery failed");
        }
    }

    /// Poll the decisions index for any decision on this incident.
    async fn await_plan_approval(&self, incident_id: &str) -> PlanApproval {
        let interval = Duration::from_millis(self.config.coordinator.approval_poll_interval_ms);
        let timeout = Duration::from_secs(self.config.coordinator.approval_timeout_minutes * 60);
        let started = tokio::time::Instant::now();

        loop {
            if started.elapsed() >= timeout {
                return PlanApproval::TimedOut;
            }
            tokio::time::sleep(interval).await;

            let query = Query::Term {
                field: "incident_id".to_string(),
                value: json!(incident_id),
            };
            let request = SearchRequest::new(indices::APPROVAL_RESPONSES, query)
                .with_size(1)
                .with_sort(Sort::desc("@timestamp"));
            match self.store.search(request).await {
                Ok(hits) => {
                    if let Some(hit) = hits.first() {
                        let user = hit.source["user"].as_str().unwrap_or("unknown").to_string();
                        match hit.source["value"].as_str() {
                            Some("approve" | "approved") => return PlanApproval::Approved,
                            Some("reject" | "rejected") => {
                                return PlanApproval::Rejected { user }
                            }
                            // more_info keeps the window open.
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(incident_id, error = %e, "approval poll failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Escalation and notification
    // ------------------------------------------------------------------

    /// Idempotent escalation bookkeeping: set the flag under optimistic
    /// concurrency, then send exactly one notification. A concurrency
    /// conflict means another path already escalated.
    pub async fn record_escalation(&self, incident_id: &str, reason: &str, context: Value) {
        let versioned = match self.store.get(indices::INCIDENTS, incident_id).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(incident_id, error = %e, "escalation read failed");
                return;
            }
        };
        if versioned.doc["escalation_triggered"].as_bool().unwrap_or(false) {
            tracing::debug!(incident_id, "escalation already triggered");
            return;
        }
        let severity = versioned.doc["severity"]
            .as_str()
            .and_then(Severity::from_str)
            .unwrap_or_default();
        let patch = json!({
            "escalation_triggered": true,
            "escalation_reason": reason,
        });
        match self
            .store
            .update(indices::INCIDENTS, incident_id, patch, versioned.token(), Refresh::WaitFor)
            .await
        {
            Ok(()) => {}
            Err(StoreError::ConcurrencyConflict { .. }) => {
                tracing::debug!(incident_id, "escalation raced, another writer won");
                return;
            }
            Err(e) => {
                tracing::error!(incident_id, error = %e, "escalation flag write failed");
                // Notification still goes out: escalation is at least
                // intended, possibly undelivered.
            }
        }

        let envelope = Envelope::request(
            agents::COORDINATOR,
            agents::WF_NOTIFY,
            json!({
                "channel": "pagerduty",
                "incident_id": incident_id,
                "severity": severity.as_str(),
                "reason": reason,
                "context": context,
            }),
        );
        if let Err(e) = self.bus.send(&envelope, Duration::from_secs(30)).await {
            tracing::error!(incident_id, error = %e, "escalation notification failed");
        }
    }

    /// Terminal states other than resolved notify the on-call.
    async fn notify_terminal(&self, incident_id: &str, severity: Severity, outcome: &str) {
        if outcome == "escalated" {
            // record_escalation already paged.
            return;
        }
        let channel = if severity == Severity::Critical {
            "pagerduty"
        } else {
            "slack"
        };
        let envelope = Envelope::request(
            agents::COORDINATOR,
            agents::WF_NOTIFY,
            json!({
                "channel": channel,
                "incident_id": incident_id,
                "severity": severity.as_str(),
                "reason": format!("incident {outcome}"),
            }),
        );
        if let Err(e) = self.bus.send(&envelope, Duration::from_secs(30)).await {
            tracing::warn!(incident_id, error = %e, "terminal notification failed");
        }
    }

    /// Last-resort handling for orchestration errors: flag, page, answer
    /// escalated. The incident may rest in a non-terminal state for the
    /// operator to pick up.
    async fn fail_safe(
        &self,
        incident_id: &str,
        _severity: Severity,
        reason: &str,
    ) -> CoordinatorResponse {
        tracing::error!(incident_id, reason, "orchestration failed, escalating");
        self.record_escalation(incident_id, reason, json!({})).await;
        CoordinatorResponse::escalated(incident_id, reason)
    }

    async fn transition(
        &self,
        incident_id: &str,
        status: IncidentStatus,
        metadata: Value,
    ) -> Result<Incident, TransitionError> {
        self.state_machine.transition(incident_id, status, metadata).await
    }
}

#[async_trait]
impl crate::services::bus::AgentHandler for Coordinator {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        match payload["task"].as_str() {
            Some("security_alert") => {
                let alert: Alert = serde_json::from_value(payload["alert"].clone())
                    .map_err(|e| AgentError::Invalid(e.to_string()))?;
                let response = self.handle_security_alert(alert).await;
                serde_json::to_value(response).map_err(|e| AgentError::Invalid(e.to_string()))
            }
            Some("operational_anomaly") => {
                let anomaly: AnomalyReport = serde_json::from_value(payload["anomaly"].clone())
                    .map_err(|e| AgentError::Invalid(e.to_string()))?;
                let response = self.handle_operational_anomaly(anomaly).await;
                serde_json::to_value(response).map_err(|e| AgentError::Invalid(e.to_string()))
            }
            other => Err(AgentError::Invalid(format!(
                "unknown coordinator task: {other:?}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------

fn investigation_metadata(investigation: &InvestigationReport) -> Value {
    json!({
        "investigation_report": investigation,
        "investigation_summary": investigation.root_cause,
        "affected_services": investigation.affected_services,
    })
}

/// Hunter found at least as many new high-confidence assets as the
/// investigator confirmed: the assessments disagree on scope.
fn conflicting_assessments(
    investigation: &InvestigationReport,
    scope: &ThreatScope,
) -> Option<String> {
    let investigator_confirmed: std::collections::BTreeSet<&str> =
        investigation.high_confidence_assets().into_iter().collect();
    if investigator_confirmed.is_empty() {
        return None;
    }
    let hunter_only: Vec<&str> = scope
        .confirmed_ids()
        .into_iter()
        .filter(|id| !investigator_confirmed.contains(id))
        .collect();
    if hunter_only.is_empty() || hunter_only.len() < investigator_confirmed.len() {
        return None;
    }
    Some(format!(
        "conflicting assessments: hunter confirmed {} asset(s) unknown to investigator ({})",
        hunter_only.len(),
        hunter_only.join(", ")
    ))
}

fn intel_field(investigation: &InvestigationReport, kind: &str) -> Vec<String> {
    investigation
        .threat_intel_matches
        .iter()
        .filter(|m| m.get("indicator_type").and_then(Value::as_str) == Some(kind))
        .filter_map(|m| m.get("indicator").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect()
}

fn operational_severity(anomaly: &AnomalyReport) -> Severity {
    match (anomaly.role, anomaly.tier) {
        (AnomalyRole::RootCause | AnomalyRole::RootCauseBadOutbound, Some(1)) => Severity::High,
        (_, Some(1)) => Severity::High,
        (AnomalyRole::Victim, _) => Severity::Medium,
        _ => Severity::Medium,
    }
}

fn operational_alert(anomaly: &AnomalyReport, severity: Severity) -> Alert {
    Alert::new(anomaly.anomaly_id.clone(), "ops-anomaly", severity)
        .with_asset(anomaly.service.clone())
        .with_description(format!(
            "{} metric(s) deviating on {}",
            anomaly.deviations.len(),
            anomaly.service
        ))
}

/// Minimal investigation synthesized from the sentinel payload when no
/// high-confidence change correlation is attached.
fn synthesize_operational_report(incident_id: &str, anomaly: &AnomalyReport) -> InvestigationReport {
    let worst = anomaly
        .deviations
        .iter()
        .max_by(|a, b| {
            a.z_score
                .abs()
                .partial_cmp(&b.z_score.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|d| format!("{} at {:+.1} stddev", d.metric, d.z_score))
        .unwrap_or_else(|| "metric deviation".to_string());
    InvestigationReport {
        incident_id: incident_id.to_string(),
        root_cause: format!(
            "Operational anomaly on {}: {worst} ({})",
            anomaly.service,
            anomaly.role.as_str()
        ),
        affected_services: vec![anomaly.service.clone()],
        recommended_next: RecommendedNext::PlanRemediation,
        confidence: 0.5,
        ..Default::default()
    }
}

/// Accumulated context handed to the operator on escalation.
fn escalation_context(incident: &Incident) -> Value {
    json!({
        "root_cause": incident
            .investigation_report
            .as_ref()
            .map(|r| r.root_cause.clone()),
        "affected_services": incident.affected_services,
        "verification_results": incident.verification_results,
        "reflection_count": incident.reflection_count,
    })
}

fn failed_verification(incident_id: &str, attempt: u32, reason: &str) -> VerificationReport {
    VerificationReport {
        incident_id: incident_id.to_string(),
        passed: false,
        health_score: 0.0,
        failure_analysis: Some(reason.to_string()),
        attempt,
        ..Default::default()
    }
}

/// Response timings from the first entry into each state.
fn timing_metrics(incident: &Incident, now: chrono::DateTime<Utc>) -> TimingMetrics {
    let entered = |status: IncidentStatus| incident.entered_at(status);
    let span = |from: Option<chrono::DateTime<Utc>>, to: Option<chrono::DateTime<Utc>>| {
        match (from, to) {
            (Some(from), Some(to)) => Some((to - from).num_seconds().max(0)),
            _ => None,
        }
    };
    TimingMetrics {
        ttd_seconds: span(entered(IncidentStatus::Detected), entered(IncidentStatus::Triaged)),
        tti_seconds: span(
            entered(IncidentStatus::Investigating),
            entered(IncidentStatus::Planning),
        ),
        ttr_seconds: span(
            entered(IncidentStatus::Planning),
            entered(IncidentStatus::Verifying),
        ),
        ttv_seconds: span(entered(IncidentStatus::Verifying), Some(now)),
        total_seconds: Some((now - incident.created_at).num_seconds().max(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CompromisedAsset, ConfirmedAsset, MetricDeviation};

    fn investigation_with_assets(assets: &[(&str, f64)]) -> InvestigationReport {
        InvestigationReport {
            incident_id: "INC-2026-ABCDE".to_string(),
            root_cause: "test".to_string(),
            compromised_assets: assets
                .iter()
                .map(|(id, confidence)| CompromisedAsset {
                    asset_id: (*id).to_string(),
                    confidence: *confidence,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn scope_with_confirmed(assets: &[&str]) -> ThreatScope {
        ThreatScope {
            incident_id: "INC-2026-ABCDE".to_string(),
            confirmed_compromised: assets
                .iter()
                .map(|id| ConfirmedAsset {
                    asset_id: (*id).to_string(),
                    hit_count: 5,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_conflict_when_hunter_agrees() {
        let investigation = investigation_with_assets(&[("user-42", 0.9)]);
        let scope = scope_with_confirmed(&["user-42"]);
        assert!(conflicting_assessments(&investigation, &scope).is_none());
    }

    #[test]
    fn test_no_conflict_when_investigator_empty() {
        let investigation = investigation_with_assets(&[("host-1", 0.3)]);
        let scope = scope_with_confirmed(&["web-1", "web-2"]);
        // Investigator has no high-confidence assets: heuristic stands down.
        assert!(conflicting_assessments(&investigation, &scope).is_none());
    }

    #[test]
    fn test_conflict_when_hunter_set_dominates() {
        let investigation = investigation_with_assets(&[("user-42", 0.9)]);
        let scope = scope_with_confirmed(&["user-42", "web-1", "db-1"]);
        let conflict = conflicting_assessments(&investigation, &scope).unwrap();
        assert!(conflict.contains("web-1"));
        assert!(conflict.contains("db-1"));
    }

    #[test]
    fn test_no_conflict_when_hunter_extras_minor() {
        let investigation = investigation_with_assets(&[("a", 0.9), ("b", 0.9), ("c", 0.9)]);
        let scope = scope_with_confirmed(&["a", "b", "c", "d"]);
        // One extra against three confirmed: below the conflict bar.
        assert!(conflicting_assessments(&investigation, &scope).is_none());
    }

    #[test]
    fn test_timing_metrics_from_state_timestamps() {
        let mut incident = Incident::new("A-1", IncidentSource::SecurityAlert, Severity::High);
        let base = incident.created_at;
        for (status, offset) in [
            (IncidentStatus::Triaged, 5),
            (IncidentStatus::Investigating, 10),
            (IncidentStatus::Planning, 40),
            (IncidentStatus::Executing, 50),
            (IncidentStatus::Verifying, 70),
        ] {
            incident
                .state_timestamps
                .insert(status.as_str().to_string(), base + chrono::Duration::seconds(offset));
        }
        let metrics = timing_metrics(&incident, base + chrono::Duration::seconds(90));
        assert_eq!(metrics.ttd_seconds, Some(5));
        assert_eq!(metrics.tti_seconds, Some(30));
        assert_eq!(metrics.ttr_seconds, Some(30));
        assert_eq!(metrics.ttv_seconds, Some(20));
        assert_eq!(metrics.total_seconds, Some(90));
    }

    #[test]
    fn test_operational_severity_tiers() {
        let mut anomaly = AnomalyReport {
            anomaly_id: "ANOM-1".to_string(),
            service: "checkout".to_string(),
            deviations: vec![],
            role: AnomalyRole::RootCause,
            tier: Some(1),
            recent_change: None,
            detected_at: Utc::now(),
        };
        assert_eq!(operational_severity(&anomaly), Severity::High);
        anomaly.tier = Some(3);
        assert_eq!(operational_severity(&anomaly), Severity::Medium);
    }

    #[test]
    fn test_synthesized_operational_report_names_worst_metric() {
        let anomaly = AnomalyReport {
            anomaly_id: "ANOM-1".to_string(),
            service: "checkout".to_string(),
            deviations: vec![
                MetricDeviation {
                    metric: "cpu".to_string(),
                    current: 44.0,
                    baseline_avg: 40.0,
                    baseline_stddev: 5.0,
                    z_score: 0.8,
                },
                MetricDeviation {
                    metric: "latency".to_string(),
                    current: 900.0,
                    baseline_avg: 200.0,
                    baseline_stddev: 100.0,
                    z_score: 7.0,
                },
            ],
            role: AnomalyRole::RootCause,
            tier: None,
            recent_change: None,
            detected_at: Utc::now(),
        };
        let report = synthesize_operational_report("INC-2026-ABCDE", &anomaly);
        assert!(report.root_cause.contains("latency"));
        assert!(report.root_cause.contains("root_cause"));
        assert_eq!(report.affected_services, vec!["checkout".to_string()]);
        let value = serde_json::to_value(&report).unwrap();
        assert!(contracts::validate("investigate_response", &value).is_ok());
    }

    #[test]
    fn test_intel_field_extraction() {
        let mut investigation = investigation_with_assets(&[]);
        investigation.threat_intel_matches = vec![
            json!({"indicator_type": "domain", "indicator": "evil.example"}),
            json!({"indicator_type": "hash", "indicator": "abc123"}),
            json!({"indicator_type": "domain", "indicator": "bad.example"}),
        ];
        assert_eq!(
            intel_field(&investigation, "domain"),
            vec!["evil.example".to_string(), "bad.example".to_string()]
        );
        assert_eq!(intel_field(&investigation, "hash"), vec!["abc123".to_string()]);
        assert!(intel_field(&investigation, "process").is_empty());
    }
}
