//! Store index names and logical agent ids.

/// Incident records, versioned with seq/term tokens.
pub const INCIDENTS: &str = "vigil-incidents";
/// Append-only action audit records.
pub const ACTIONS: &str = "vigil-actions";
/// Create-only alert claim records.
pub const ALERT_CLAIMS: &str = "vigil-alert-claims";
/// Raw security alerts.
pub const ALERTS_DEFAULT: &str = "vigil-alerts-default";
/// Operational error/change events.
pub const ALERTS_OPERATIONAL: &str = "vigil-alerts-operational";
/// Human approval decisions.
pub const APPROVAL_RESPONSES: &str = "vigil-approval-responses";
/// Persisted investigation and sweep reports.
pub const INVESTIGATIONS: &str = "vigil-investigations";
pub const RUNBOOKS: &str = "vigil-runbooks";
pub const THREAT_INTEL: &str = "vigil-threat-intel";
pub const ASSETS: &str = "vigil-assets";
/// 7-day rolling service baselines.
pub const BASELINES: &str = "vigil-baselines";
pub const METRICS: &str = "vigil-metrics-default";
/// Analyst calibration and pattern output.
pub const LEARNINGS: &str = "vigil-learnings";
pub const AGENT_TELEMETRY: &str = "vigil-agent-telemetry";
pub const ANALYST_STATUS: &str = "vigil-analyst-status";

/// Logical agent ids addressable on the bus.
pub mod agents {
    pub const COORDINATOR: &str = "vigil-coordinator";
    pub const TRIAGE: &str = "vigil-triage";
    pub const INVESTIGATOR: &str = "vigil-investigator";
    pub const THREAT_HUNTER: &str = "vigil-threat-hunter";
    pub const COMMANDER: &str = "vigil-commander";
    pub const EXECUTOR: &str = "vigil-executor";
    pub const VERIFIER: &str = "vigil-verifier";
    pub const SENTINEL: &str = "vigil-sentinel";
    pub const ANALYST: &str = "vigil-analyst";
    pub const WF_CONTAINMENT: &str = "vigil-wf-containment";
    pub const WF_REMEDIATION: &str = "vigil-wf-remediation";
    pub const WF_NOTIFY: &str = "vigil-wf-notify";
    pub const WF_TICKETING: &str = "vigil-wf-ticketing";
    pub const WF_APPROVAL: &str = "vigil-wf-approval";
    pub const WF_REPORTING: &str = "vigil-wf-reporting";
}
