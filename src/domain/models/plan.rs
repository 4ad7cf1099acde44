//! Remediation plan domain model.
//!
//! A plan is an ordered sequence of actions produced by the Commander and
//! executed one at a time by the Executor. Destructive actions carry an
//! approval requirement enforced before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What class of work a planned action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Isolate or block (host isolation, IP block, account disable).
    Containment,
    /// Restore service (rollback, restart, scale, patch).
    Remediation,
    /// Notify people (Slack, PagerDuty).
    Communication,
    /// Record evidence (Jira ticket, runbook note).
    Documentation,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Containment => "containment",
            Self::Remediation => "remediation",
            Self::Communication => "communication",
            Self::Documentation => "documentation",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "containment" => Some(Self::Containment),
            "remediation" => Some(Self::Remediation),
            "communication" => Some(Self::Communication),
            "documentation" => Some(Self::Documentation),
            _ => None,
        }
    }

    /// Fixed routing table from action type to effector workflow id.
    pub fn workflow_id(&self) -> &'static str {
        match self {
            Self::Containment => "vigil-wf-containment",
            Self::Remediation => "vigil-wf-remediation",
            Self::Communication => "vigil-wf-notify",
            Self::Documentation => "vigil-wf-ticketing",
        }
    }

    /// Destructive types require approval when severity is critical.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Containment | Self::Remediation)
    }
}

/// One step of a remediation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Execution order, unique within a plan.
    pub order: u32,
    pub action_type: ActionType,
    pub description: String,
    /// Logical system the action targets (e.g. `kubernetes`, `okta`).
    pub target_system: String,
    /// Concrete asset within the target system.
    pub target_asset: String,
    /// Effector-specific parameters, passed through opaquely.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub approval_required: bool,
    /// Steps to undo the action, when reversal is possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_steps: Option<String>,
}

impl PlannedAction {
    pub fn new(
        order: u32,
        action_type: ActionType,
        description: impl Into<String>,
        target_system: impl Into<String>,
        target_asset: impl Into<String>,
    ) -> Self {
        Self {
            order,
            action_type,
            description: description.into(),
            target_system: target_system.into(),
            target_asset: target_asset.into(),
            params: Value::Object(serde_json::Map::new()),
            approval_required: false,
            rollback_steps: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }

    pub fn with_rollback(mut self, steps: impl Into<String>) -> Self {
        self.rollback_steps = Some(steps.into());
        self
    }
}

/// Comparison operator for a success criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriterionOp {
    #[serde(rename = "lt")]
    Lt,
    #[serde(rename = "lte")]
    Lte,
    #[serde(rename = "gt")]
    Gt,
    #[serde(rename = "gte")]
    Gte,
    #[serde(rename = "eq")]
    Eq,
}

impl CriterionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Eq => "eq",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lt" | "<" => Some(Self::Lt),
            "lte" | "<=" => Some(Self::Lte),
            "gt" | ">" => Some(Self::Gt),
            "gte" | ">=" => Some(Self::Gte),
            "eq" | "==" => Some(Self::Eq),
            _ => None,
        }
    }

    /// Compare an observed value against the criterion threshold.
    pub fn evaluate(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => observed < threshold,
            Self::Lte => observed <= threshold,
            Self::Gt => observed > threshold,
            Self::Gte => observed >= threshold,
            Self::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }
}

/// A `{metric, operator, threshold}` triple the Verifier checks post-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub metric: String,
    pub operator: CriterionOp,
    pub threshold: f64,
}

impl SuccessCriterion {
    pub fn new(metric: impl Into<String>, operator: CriterionOp, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
        }
    }
}

/// An ordered remediation plan with verification criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Id of the runbook the plan was derived from, when one matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runbook_used: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl RemediationPlan {
    pub fn new(actions: Vec<PlannedAction>, success_criteria: Vec<SuccessCriterion>) -> Self {
        let requires_approval = actions.iter().any(|a| a.approval_required);
        Self {
            actions,
            success_criteria,
            runbook_used: None,
            requires_approval,
        }
    }

    pub fn with_runbook(mut self, runbook_id: impl Into<String>) -> Self {
        self.runbook_used = Some(runbook_id.into());
        self
    }

    /// True when at least one action needs a human decision.
    pub fn any_approval_required(&self) -> bool {
        self.actions.iter().any(|a| a.approval_required)
    }

    /// Actions sorted by ascending `order`, duplicates removed (first wins).
    /// Returns the sorted actions and the number of duplicates dropped.
    pub fn ordered_actions(&self) -> (Vec<PlannedAction>, usize) {
        let mut sorted = self.actions.clone();
        sorted.sort_by_key(|a| a.order);
        let before = sorted.len();
        let mut seen = std::collections::HashSet::new();
        sorted.retain(|a| seen.insert(a.order));
        let dropped = before - sorted.len();
        (sorted, dropped)
    }
}
