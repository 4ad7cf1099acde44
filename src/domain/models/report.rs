//! Worker report models: investigation, threat scope, verification, and
//! sentinel anomaly reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::plan::CriterionOp;

/// Which agent the Coordinator should call next after investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedNext {
    ThreatHunt,
    PlanRemediation,
    Escalate,
}

impl RecommendedNext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreatHunt => "threat_hunt",
            Self::PlanRemediation => "plan_remediation",
            Self::Escalate => "escalate",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "threat_hunt" => Some(Self::ThreatHunt),
            "plan_remediation" => Some(Self::PlanRemediation),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

/// An asset the Investigator believes is compromised, with confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompromisedAsset {
    pub asset_id: String,
    pub confidence: f64,
}

/// Investigator output embedded on the incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub incident_id: String,
    pub root_cause: String,
    /// Events from the progressive attack-chain trace, oldest first.
    #[serde(default)]
    pub attack_chain: Vec<Value>,
    /// Hosts/users/services the attack reached.
    #[serde(default)]
    pub blast_radius: Value,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    #[serde(default)]
    pub threat_intel_matches: Vec<Value>,
    #[serde(default)]
    pub similar_incidents: Vec<Value>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(default)]
    pub compromised_assets: Vec<CompromisedAsset>,
    pub recommended_next: RecommendedNext,
    /// Overall confidence in the root cause, [0, 1].
    #[serde(default)]
    pub confidence: f64,
    /// Time window (hours) at which the trace yielded enough events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_window_hours: Option<u32>,
}

impl Default for RecommendedNext {
    fn default() -> Self {
        Self::PlanRemediation
    }
}

impl InvestigationReport {
    /// Assets with confidence at or above the high-confidence bar (0.7).
    pub fn high_confidence_assets(&self) -> Vec<&str> {
        self.compromised_assets
            .iter()
            .filter(|a| a.confidence >= 0.7)
            .map(|a| a.asset_id.as_str())
            .collect()
    }
}

/// One asset confirmed compromised by the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedAsset {
    pub asset_id: String,
    pub hit_count: u64,
}

/// One asset suspected from behavioral anomaly scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectedAsset {
    pub asset_id: String,
    pub anomaly_score: f64,
}

/// Behavioral anomaly for a known-compromised user, deduplicated by user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralAnomaly {
    pub user: String,
    pub score: f64,
}

/// Threat Hunter output: the sweep scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatScope {
    pub incident_id: String,
    #[serde(default)]
    pub confirmed_compromised: Vec<ConfirmedAsset>,
    #[serde(default)]
    pub suspected: Vec<SuspectedAsset>,
    #[serde(default)]
    pub behavioral_anomalies: Vec<BehavioralAnomaly>,
    #[serde(default)]
    pub total_assets: u64,
    /// `total - confirmed - suspected`, floored at zero.
    #[serde(default)]
    pub clean_assets: u64,
    /// Labels of sweep tasks that missed the deadline.
    #[serde(default)]
    pub unsettled: Vec<String>,
}

impl ThreatScope {
    pub fn confirmed_ids(&self) -> Vec<&str> {
        self.confirmed_compromised
            .iter()
            .map(|a| a.asset_id.as_str())
            .collect()
    }
}

/// Result of checking one success criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub metric: String,
    pub operator: CriterionOp,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    /// Verdict from the ES|QL baseline column; absent counts as passing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_verdict: Option<bool>,
    pub passed: bool,
}

/// Verifier output appended to the incident per attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub incident_id: String,
    pub passed: bool,
    /// Passed criteria over total criteria, [0, 1].
    pub health_score: f64,
    #[serde(default)]
    pub criteria_results: Vec<CriterionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_analysis: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "Utc::now")]
    pub verified_at: DateTime<Utc>,
}

/// Confidence band for change correlation, from the time gap between the
/// change and the first error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// `< 300s → high`, `≤ 600s → medium`, otherwise low.
    pub fn from_gap_seconds(gap: i64) -> Self {
        if gap < 300 {
            Self::High
        } else if gap <= 600 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A deployment or PR correlated with an operational incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCorrelation {
    /// `deployment` or `pull_request`.
    pub change_type: String,
    /// Deploy id, PR number, or commit sha.
    pub change_ref: String,
    pub service: String,
    /// Seconds between the change and the first error.
    pub gap_seconds: i64,
    pub confidence: ConfidenceBand,
}

/// Root-cause vs victim classification for a service anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyRole {
    /// No failing downstream dependency: the anomaly starts here.
    RootCause,
    /// A failing downstream dependency is itself anomalous.
    Victim,
    /// Downstream failing but not anomalous: bad outbound from here.
    RootCauseBadOutbound,
}

impl AnomalyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootCause => "root_cause",
            Self::Victim => "victim",
            Self::RootCauseBadOutbound => "root_cause_bad_outbound",
        }
    }
}

/// One metric deviation on a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDeviation {
    pub metric: String,
    pub current: f64,
    pub baseline_avg: f64,
    pub baseline_stddev: f64,
    /// Signed standard deviations from the baseline mean.
    pub z_score: f64,
}

/// Structured anomaly report the Sentinel forwards to the Coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomaly_id: String,
    pub service: String,
    pub deviations: Vec<MetricDeviation>,
    pub role: AnomalyRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_change: Option<ChangeCorrelation>,
    pub detected_at: DateTime<Utc>,
}
