//! Incident domain model.
//!
//! Incidents are the central entity: every alert or operational anomaly that
//! survives triage becomes an incident driven through the per-incident state
//! machine until it reaches a terminal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::RemediationPlan;
use super::report::{InvestigationReport, ThreatScope, VerificationReport};

/// Status of an incident in the response pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Alert ingested, incident created.
    Detected,
    /// Triage computed a priority score and disposition.
    Triaged,
    /// Investigator is tracing the attack chain.
    Investigating,
    /// Threat hunter is sweeping for lateral movement.
    ThreatHunting,
    /// Commander is building a remediation plan.
    Planning,
    /// Plan contains destructive actions; waiting for a human decision.
    AwaitingApproval,
    /// Executor is running planned actions.
    Executing,
    /// Verifier is checking success criteria against live health.
    Verifying,
    /// Verification failed; re-entering investigation with failure context.
    Reflecting,
    /// Remediation verified successful.
    Resolved,
    /// Handed to a human operator.
    Escalated,
    /// Below the suppress threshold; closed without action.
    Suppressed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Triaged => "triaged",
            Self::Investigating => "investigating",
            Self::ThreatHunting => "threat_hunting",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Reflecting => "reflecting",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Suppressed => "suppressed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "detected" => Some(Self::Detected),
            "triaged" => Some(Self::Triaged),
            "investigating" => Some(Self::Investigating),
            "threat_hunting" => Some(Self::ThreatHunting),
            "planning" => Some(Self::Planning),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "executing" => Some(Self::Executing),
            "verifying" => Some(Self::Verifying),
            "reflecting" => Some(Self::Reflecting),
            "resolved" => Some(Self::Resolved),
            "escalated" => Some(Self::Escalated),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    ///
    /// `escalated` counts as terminal for bookkeeping (resolved_at, duration,
    /// analyst trigger) even though an operator may later re-open it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Escalated | Self::Suppressed)
    }

    /// Valid successors of this status. No other transitions are allowed.
    pub fn valid_transitions(&self) -> &'static [IncidentStatus] {
        match self {
            Self::Detected => &[Self::Triaged],
            Self::Triaged => &[Self::Investigating, Self::Suppressed],
            Self::Investigating => &[Self::ThreatHunting, Self::Planning],
            Self::ThreatHunting => &[Self::Planning],
            Self::Planning => &[Self::AwaitingApproval, Self::Executing],
            Self::AwaitingApproval => &[Self::Executing, Self::Escalated],
            Self::Executing => &[Self::Verifying],
            Self::Verifying => &[Self::Resolved, Self::Reflecting],
            Self::Reflecting => &[Self::Investigating, Self::Escalated],
            Self::Resolved => &[],
            // Operator may re-open an escalated incident.
            Self::Escalated => &[Self::Investigating],
            Self::Suppressed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Alert severity carried onto the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Weight used by the triage priority formula, in [0, 1].
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

/// How a terminal incident was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    AutoResolved,
    Suppressed,
    Escalated,
}

impl ResolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoResolved => "auto_resolved",
            Self::Suppressed => "suppressed",
            Self::Escalated => "escalated",
        }
    }

    /// The resolution type implied by a terminal status.
    pub fn for_status(status: IncidentStatus) -> Option<Self> {
        match status {
            IncidentStatus::Resolved => Some(Self::AutoResolved),
            IncidentStatus::Suppressed => Some(Self::Suppressed),
            IncidentStatus::Escalated => Some(Self::Escalated),
            _ => None,
        }
    }
}

/// Human approval decision state for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }
}

/// Where the incident came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSource {
    /// Security alert from the detection pipeline.
    SecurityAlert,
    /// Operational anomaly forwarded by the sentinel.
    OperationalAnomaly,
}

impl Default for IncidentSource {
    fn default() -> Self {
        Self::SecurityAlert
    }
}

/// Response-timing metrics computed on resolution from `_state_timestamps`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingMetrics {
    /// Detection to triage (seconds).
    pub ttd_seconds: Option<i64>,
    /// Investigation start to plan start (seconds).
    pub tti_seconds: Option<i64>,
    /// Plan start to verification start (seconds).
    pub ttr_seconds: Option<i64>,
    /// Verification start to resolution (seconds).
    pub ttv_seconds: Option<i64>,
    /// Creation to resolution (seconds).
    pub total_seconds: Option<i64>,
}

/// The central incident document, versioned in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// `INC-<year>-<5-char-slug>`.
    pub incident_id: String,
    /// Originating alert id (or anomaly id for operational incidents).
    pub alert_id: String,
    /// Detection rule that fired, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub source: IncidentSource,
    pub status: IncidentStatus,
    pub severity: Severity,
    /// Triage priority in [0, 1].
    pub priority_score: f64,
    /// Number of reflection iterations performed. Monotonic.
    #[serde(default)]
    pub reflection_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investigation_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investigation_report: Option<InvestigationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_scope: Option<ThreatScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_plan: Option<RemediationPlan>,
    #[serde(default)]
    pub verification_results: Vec<VerificationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(default)]
    pub escalation_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_type: Option<ResolutionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing_metrics: Option<TimingMetrics>,
    /// First entry into each state, keyed by state name. Append-only.
    #[serde(rename = "_state_timestamps", default)]
    pub state_timestamps: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    /// Create a new incident in `detected` for the given alert.
    pub fn new(alert_id: impl Into<String>, source: IncidentSource, severity: Severity) -> Self {
        let now = Utc::now();
        let mut state_timestamps = BTreeMap::new();
        state_timestamps.insert(IncidentStatus::Detected.as_str().to_string(), now);
        Self {
            incident_id: generate_incident_id(now),
            alert_id: alert_id.into(),
            rule_id: None,
            source,
            status: IncidentStatus::Detected,
            severity,
            priority_score: 0.0,
            reflection_count: 0,
            investigation_summary: None,
            investigation_report: None,
            threat_scope: None,
            remediation_plan: None,
            verification_results: Vec::new(),
            approval_status: None,
            affected_services: Vec::new(),
            escalation_triggered: false,
            escalation_reason: None,
            resolution_type: None,
            resolved_at: None,
            total_duration_seconds: None,
            timing_metrics: None,
            state_timestamps,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_priority_score(mut self, score: f64) -> Self {
        self.priority_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: IncidentStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Latest verification result, if any.
    pub fn last_verification(&self) -> Option<&VerificationReport> {
        self.verification_results.last()
    }

    /// First entry timestamp for a state, if the incident has been there.
    pub fn entered_at(&self, status: IncidentStatus) -> Option<DateTime<Utc>> {
        self.state_timestamps.get(status.as_str()).copied()
    }
}

/// `INC-<year>-<5-char-slug>` with an uppercase hex slug.
pub fn generate_incident_id(now: DateTime<Utc>) -> String {
    format!("INC-{}-{}", now.format("%Y"), short_slug(5))
}

/// Uppercase slice of a fresh v4 UUID, used for document id slugs.
pub fn short_slug(len: usize) -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .to_uppercase()
        .chars()
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_id_format() {
        let incident = Incident::new("A-001", IncidentSource::SecurityAlert, Severity::High);
        let parts: Vec<&str> = incident.incident_id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "INC");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 5);
    }

    #[test]
    fn test_new_incident_records_detected_timestamp() {
        let incident = Incident::new("A-001", IncidentSource::SecurityAlert, Severity::High);
        assert_eq!(incident.status, IncidentStatus::Detected);
        assert!(incident.entered_at(IncidentStatus::Detected).is_some());
        assert!(incident.entered_at(IncidentStatus::Triaged).is_none());
    }

    #[test]
    fn test_transition_table_exact() {
        use IncidentStatus::*;
        let cases: &[(IncidentStatus, &[IncidentStatus])] = &[
            (Detected, &[Triaged]),
            (Triaged, &[Investigating, Suppressed]),
            (Investigating, &[ThreatHunting, Planning]),
            (ThreatHunting, &[Planning]),
            (Planning, &[AwaitingApproval, Executing]),
            (AwaitingApproval, &[Executing, Escalated]),
            (Executing, &[Verifying]),
            (Verifying, &[Resolved, Reflecting]),
            (Reflecting, &[Investigating, Escalated]),
            (Resolved, &[]),
            (Escalated, &[Investigating]),
            (Suppressed, &[]),
        ];
        for (from, allowed) in cases {
            assert_eq!(&from.valid_transitions(), allowed, "from {}", from.as_str());
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(IncidentStatus::Resolved.is_terminal());
        assert!(IncidentStatus::Suppressed.is_terminal());
        assert!(IncidentStatus::Escalated.is_terminal());
        assert!(!IncidentStatus::Verifying.is_terminal());
        assert!(!IncidentStatus::Reflecting.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            IncidentStatus::Detected,
            IncidentStatus::Triaged,
            IncidentStatus::Investigating,
            IncidentStatus::ThreatHunting,
            IncidentStatus::Planning,
            IncidentStatus::AwaitingApproval,
            IncidentStatus::Executing,
            IncidentStatus::Verifying,
            IncidentStatus::Reflecting,
            IncidentStatus::Resolved,
            IncidentStatus::Escalated,
            IncidentStatus::Suppressed,
        ] {
            assert_eq!(IncidentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(IncidentStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_resolution_type_for_status() {
        assert_eq!(
            ResolutionType::for_status(IncidentStatus::Resolved),
            Some(ResolutionType::AutoResolved)
        );
        assert_eq!(
            ResolutionType::for_status(IncidentStatus::Suppressed),
            Some(ResolutionType::Suppressed)
        );
        assert_eq!(
            ResolutionType::for_status(IncidentStatus::Escalated),
            Some(ResolutionType::Escalated)
        );
        assert_eq!(ResolutionType::for_status(IncidentStatus::Planning), None);
    }

    #[test]
    fn test_severity_weight_ordering() {
        assert!(Severity::Low.weight() < Severity::Medium.weight());
        assert!(Severity::Medium.weight() < Severity::High.weight());
        assert!(Severity::High.weight() < Severity::Critical.weight());
        assert!((Severity::Critical.weight() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_incident_serde_round_trip() {
        let incident = Incident::new("A-001", IncidentSource::SecurityAlert, Severity::Critical)
            .with_rule("sec-brute-force")
            .with_priority_score(0.87);
        let value = serde_json::to_value(&incident).unwrap();
        assert_eq!(value["status"], "detected");
        assert!(value["_state_timestamps"]["detected"].is_string());
        let back: Incident = serde_json::from_value(value).unwrap();
        assert_eq!(back.incident_id, incident.incident_id);
        assert!((back.priority_score - 0.87).abs() < f64::EPSILON);
        assert_eq!(back.rule_id.as_deref(), Some("sec-brute-force"));
    }

    #[test]
    fn test_priority_score_clamped() {
        let incident =
            Incident::new("A-001", IncidentSource::SecurityAlert, Severity::Low).with_priority_score(1.7);
        assert!((incident.priority_score - 1.0).abs() < f64::EPSILON);
    }
}
