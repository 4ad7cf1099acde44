//! Worker agents: pure request/response handlers over the A2A bus.

pub mod analyst;
pub mod commander;
pub mod executor;
pub mod investigator;
pub mod sentinel;
pub mod threat_hunter;
pub mod triage;
pub mod verifier;

pub use analyst::{validate_cron, AnalystAgent, ScheduleError};
pub use commander::CommanderAgent;
pub use executor::ExecutorAgent;
pub use investigator::InvestigatorAgent;
pub use sentinel::SentinelAgent;
pub use threat_hunter::ThreatHunterAgent;
pub use triage::TriageAgent;
pub use verifier::VerifierAgent;
