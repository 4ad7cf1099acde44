//! Vigil - autonomous incident-response orchestrator.
//!
//! Alerts and operational anomalies are driven through a per-incident state
//! machine by a central Coordinator that delegates to specialist worker
//! agents (triage, investigation, threat hunting, planning, execution,
//! verification, monitoring, analysis) over an A2A envelope bus, with:
//! - Guarded transitions under optimistic concurrency with a full audit trail
//! - Human-in-the-loop approval for destructive actions
//! - A bounded reflection loop for failed remediation
//! - JSON-defined ES|QL and search tools shared by every agent

pub mod agents;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{Coordinator, CoordinatorResponse};
pub use infrastructure::config::{ConfigLoader, VigilConfig};
