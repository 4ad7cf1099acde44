//! Action audit records.
//!
//! One record per state transition and per effector invocation, appended to
//! the actions index. Records are never updated or deleted; retrospectives
//! and reports query them by incident id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::incident::{short_slug, IncidentStatus};

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// An append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// `ACT-<year>-<5-char-slug>` for effector actions,
    /// `AUD-<8-char-slug>` for state transitions.
    pub action_id: String,
    pub incident_id: String,
    /// What kind of action this row describes (e.g. `state_transition`,
    /// `containment`).
    pub action_type: String,
    pub action_detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    pub execution_status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Effector workflow that handled the action, when one was invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub rollback_available: bool,
}

impl ActionRecord {
    /// Audit row for a state transition.
    pub fn state_transition(
        incident_id: impl Into<String>,
        previous: IncidentStatus,
        new: IncidentStatus,
        detail: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            action_id: format!("AUD-{}", short_slug(8)),
            incident_id: incident_id.into(),
            action_type: "state_transition".to_string(),
            action_detail: detail.into(),
            previous_status: Some(previous.as_str().to_string()),
            new_status: Some(new.as_str().to_string()),
            execution_status: ExecutionStatus::Completed,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            approval_required: false,
            approved_by: None,
            approved_at: None,
            workflow_id: None,
            result_summary: None,
            error_message: None,
            rollback_available: false,
        }
    }

    /// Audit row for an effector action attempt.
    pub fn action(
        incident_id: impl Into<String>,
        action_type: impl Into<String>,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
        execution_status: ExecutionStatus,
    ) -> Self {
        let now = Utc::now();
        let started = started_at;
        Self {
            action_id: format!("ACT-{}-{}", now.format("%Y"), short_slug(5)),
            incident_id: incident_id.into(),
            action_type: action_type.into(),
            action_detail: detail.into(),
            previous_status: None,
            new_status: None,
            execution_status,
            started_at: started,
            completed_at: now,
            duration_ms: (now - started).num_milliseconds().max(0),
            approval_required: false,
            approved_by: None,
            approved_at: None,
            workflow_id: None,
            result_summary: None,
            error_message: None,
            rollback_available: false,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_approval(mut self, approved_by: impl Into<String>, approved_at: DateTime<Utc>) -> Self {
        self.approval_required = true;
        self.approved_by = Some(approved_by.into());
        self.approved_at = Some(approved_at);
        self
    }

    pub fn with_approval_required(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_result(mut self, summary: impl Into<String>) -> Self {
        self.result_summary = Some(summary.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_rollback_available(mut self, available: bool) -> Self {
        self.rollback_available = available;
        self
    }
}
