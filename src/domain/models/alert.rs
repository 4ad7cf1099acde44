//! Alert and triage domain models.
//!
//! Raw alerts arrive from the detection pipeline; the watcher claims them
//! and the triage agent scores them before an incident is opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::incident::Severity;

/// A raw alert document from the alerts index. Unknown producer fields are
/// preserved in `extra` so enrichment queries can project them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    /// Severity as assigned by the detection rule.
    pub severity_original: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "Utc::now", rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Alert {
    pub fn new(alert_id: impl Into<String>, rule_id: impl Into<String>, severity: Severity) -> Self {
        Self {
            alert_id: alert_id.into(),
            rule_id: rule_id.into(),
            severity_original: severity,
            source_ip: None,
            affected_asset_id: None,
            description: None,
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_asset(mut self, asset_id: impl Into<String>) -> Self {
        self.affected_asset_id = Some(asset_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Triage disposition derived from the priority score thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Score at or above the investigate threshold.
    Investigate,
    /// Between the suppress and investigate thresholds.
    Monitor,
    /// Strictly below the suppress threshold.
    Suppress,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Investigate => "investigate",
            Self::Monitor => "monitor",
            Self::Suppress => "suppress",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "investigate" => Some(Self::Investigate),
            "monitor" => Some(Self::Monitor),
            "suppress" => Some(Self::Suppress),
            _ => None,
        }
    }

    /// Derive the disposition from a score and the two thresholds.
    pub fn from_score(score: f64, investigate_threshold: f64, suppress_threshold: f64) -> Self {
        if score < suppress_threshold {
            Self::Suppress
        } else if score >= investigate_threshold {
            Self::Investigate
        } else {
            Self::Monitor
        }
    }
}

/// The factors feeding the weighted priority score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageFactors {
    /// Severity weight in [0, 1].
    pub severity: f64,
    /// Criticality of the affected asset in [0, 1].
    pub asset_criticality: f64,
    /// Corroborating-signal strength in [0, 1].
    pub corroboration: f64,
    /// Historical false-positive rate of the rule in [0, 1].
    pub fp_rate: f64,
}

/// Output of the triage agent for one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageReport {
    pub alert_id: String,
    pub priority_score: f64,
    pub disposition: Disposition,
    pub factors: TriageFactors,
    pub triaged_at: DateTime<Utc>,
}

/// Create-only claim record giving one watcher ownership of an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertClaim {
    pub alert_id: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AlertClaim {
    pub fn new(alert_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            claimed_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }
}
