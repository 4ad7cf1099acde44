//! Analyst agent.
//!
//! Per-incident: triggered by terminal-state transitions, guarded by an
//! in-memory TTL dedup map; runs a retrospective and, for cleanly resolved
//! incidents, generates a runbook candidate deduplicated by content-vector
//! similarity. Batch: weight calibration, threshold tuning, and pattern
//! discovery on a cron schedule with a five-minute floor.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::domain::errors::AgentError;
use crate::domain::indices;
use crate::domain::models::{Incident, IncidentStatus};
use crate::domain::ports::store::{Query, Refresh, SearchRequest, Store};
use crate::domain::ports::Embedder;
use crate::infrastructure::config::AnalystConfig;
use crate::services::bus::AgentHandler;
use crate::services::concurrency::partial_race;
use crate::services::state_machine::TerminalEvent;

/// Similarity above which a generated runbook is a duplicate.
const RUNBOOK_DUP_SIMILARITY: f64 = 0.95;

/// Minimum incidents matching a rule to call it a pattern.
const PATTERN_MIN_COUNT: usize = 3;

/// Cron schedule rejection reasons.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    Invalid { expression: String, reason: String },

    #[error("Cron expression '{expression}' fires every {interval_minutes} minutes; floor is 5")]
    TooFrequent {
        expression: String,
        interval_minutes: i64,
    },
}

/// Validate a 5-field cron expression against the five-minute floor.
pub fn validate_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    // The parser wants a seconds field; pin it to zero.
    let with_seconds = format!("0 {expression}");
    let schedule =
        cron::Schedule::from_str(&with_seconds).map_err(|e| ScheduleError::Invalid {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
    let upcoming: Vec<_> = schedule.upcoming(Utc).take(8).collect();
    for pair in upcoming.windows(2) {
        let gap = (pair[1] - pair[0]).num_minutes();
        if gap < 5 {
            return Err(ScheduleError::TooFrequent {
                expression: expression.to_string(),
                interval_minutes: gap,
            });
        }
    }
    Ok(schedule)
}

pub struct AnalystAgent {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    config: AnalystConfig,
    /// Recently analyzed incidents, pruned on every access.
    recently_analyzed: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl AnalystAgent {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, config: AnalystConfig) -> Self {
        Self {
            store,
            embedder,
            config,
            recently_analyzed: Mutex::new(HashMap::new()),
        }
    }

    /// Consume terminal events until the channel closes or stop fires.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TerminalEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        self.process_incident(&event.incident_id).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("analyst listener stopped");
        })
    }

    /// True when the incident was analyzed within the TTL window.
    async fn dedup_hit(&self, incident_id: &str) -> bool {
        let ttl = Duration::from_secs(self.config.dedup_ttl_seconds);
        let now = tokio::time::Instant::now();
        let mut map = self.recently_analyzed.lock().await;
        map.retain(|_, seen| now.duration_since(*seen) < ttl);
        if map.contains_key(incident_id) {
            return true;
        }
        map.insert(incident_id.to_string(), now);
        false
    }

    /// Per-incident post-mortem entry point.
    pub async fn process_incident(&self, incident_id: &str) {
        if self.dedup_hit(incident_id).await {
            tracing::debug!(incident_id, "analysis deduplicated");
            self.write_status(incident_id, "skipped_duplicate").await;
            return;
        }
        let deadline = Duration::from_millis(self.config.deadline_ms);

        let incident = match self.load_incident(incident_id).await {
            Some(incident) => incident,
            None => {
                tracing::warn!(incident_id, "incident missing at analysis time");
                self.write_status(incident_id, "incident_missing").await;
                return;
            }
        };

        let retrospective = {
            let this = self.clone_refs();
            let incident = incident.clone();
            async move { this.retrospective(&incident).await }.boxed()
        };
        let mut tasks = vec![("retrospective".to_string(), retrospective)];

        if Self::runbook_eligible(&incident) {
            let this = self.clone_refs();
            let incident = incident.clone();
            tasks.push((
                "runbook_generation".to_string(),
                async move { this.generate_runbook(&incident).await }.boxed(),
            ));
        }

        let results = partial_race(deadline, tasks).await;
        for (label, outcome) in &results {
            if let Some(reason) = outcome.rejection() {
                tracing::warn!(incident_id, task = %label, reason, "analysis task did not finish");
            }
        }
        self.write_status(incident_id, "analyzed").await;
    }

    async fn load_incident(&self, incident_id: &str) -> Option<Incident> {
        let versioned = self.store.get(indices::INCIDENTS, incident_id).await.ok()?;
        serde_json::from_value(versioned.doc).ok()
    }

    /// Retrospective always runs for terminal incidents.
    async fn retrospective(&self, incident: &Incident) -> Result<(), String> {
        let query = Query::Term {
            field: "incident_id".to_string(),
            value: json!(incident.incident_id),
        };
        let actions = self
            .store
            .search(SearchRequest::new(indices::ACTIONS, query).with_size(500))
            .await
            .map_err(|e| e.to_string())?;

        let failed_actions = actions
            .iter()
            .filter(|a| a.source["execution_status"] == "failed")
            .count();
        let doc = json!({
            "doc_type": "retrospective",
            "incident_id": incident.incident_id,
            "status": incident.status.as_str(),
            "resolution_type": incident.resolution_type,
            "severity": incident.severity.as_str(),
            "reflection_count": incident.reflection_count,
            "total_duration_seconds": incident.total_duration_seconds,
            "timing_metrics": incident.timing_metrics,
            "action_count": actions.len(),
            "failed_action_count": failed_actions,
            "runbook_used": incident
                .remediation_plan
                .as_ref()
                .and_then(|p| p.runbook_used.clone()),
            "root_cause": incident
                .investigation_report
                .as_ref()
                .map(|r| r.root_cause.clone()),
            "@timestamp": Utc::now(),
        });
        self.store
            .index(indices::LEARNINGS, None, doc, Refresh::None)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(incident_id = %incident.incident_id, "retrospective stored");
        Ok(())
    }

    /// Clean first-pass resolutions without a runbook are runbook material.
    fn runbook_eligible(incident: &Incident) -> bool {
        incident.status == IncidentStatus::Resolved
            && incident.reflection_count == 0
            && incident
                .remediation_plan
                .as_ref()
                .is_some_and(|p| p.runbook_used.is_none() && !p.actions.is_empty())
            && incident
                .last_verification()
                .is_some_and(|v| v.health_score >= 0.8)
    }

    async fn generate_runbook(&self, incident: &Incident) -> Result<(), String> {
        let Some(plan) = &incident.remediation_plan else {
            return Ok(());
        };
        let root_cause = incident
            .investigation_report
            .as_ref()
            .map(|r| r.root_cause.clone())
            .unwrap_or_else(|| format!("{} incident", incident.severity.as_str()));

        let steps: Vec<Value> = plan
            .actions
            .iter()
            .map(|a| {
                json!({
                    "action_type": a.action_type.as_str(),
                    "description": a.description,
                    "target_system": a.target_system,
                    "target_asset": a.target_asset,
                    "rollback_steps": a.rollback_steps,
                })
            })
            .collect();
        let content = format!(
            "{root_cause}\n{}",
            plan.actions
                .iter()
                .map(|a| a.description.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        );
        let vector = self.embedder.embed(&content).await.map_err(|e| e.to_string())?;

        // Near-duplicate runbooks are dropped before write.
        let near = self
            .store
            .search(
                SearchRequest::new(
                    indices::RUNBOOKS,
                    Query::Knn {
                        field: "content_vector".to_string(),
                        vector: vector.clone(),
                        k: 1,
                        num_candidates: 10,
                    },
                )
                .with_size(1),
            )
            .await
            .map_err(|e| e.to_string())?;
        if let Some(top) = near.first() {
            if top.score >= RUNBOOK_DUP_SIMILARITY {
                tracing::info!(
                    incident_id = %incident.incident_id,
                    existing = %top.id,
                    similarity = top.score,
                    "runbook duplicate, skipping"
                );
                return Ok(());
            }
        }

        let doc = json!({
            "title": root_cause,
            "description": format!("Generated from {}", incident.incident_id),
            "services": incident.affected_services,
            "steps": steps,
            "success_criteria": plan.success_criteria,
            "success_rate": 0.5,
            "content_vector": vector,
            "generated_from": incident.incident_id,
            "@timestamp": Utc::now(),
        });
        let id = self
            .store
            .index(indices::RUNBOOKS, None, doc, Refresh::None)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(incident_id = %incident.incident_id, runbook = %id, "runbook generated");
        Ok(())
    }

    async fn write_status(&self, incident_id: &str, status: &str) {
        let doc = json!({
            "incident_id": incident_id,
            "status": status,
            "@timestamp": Utc::now(),
        });
        if let Err(e) = self
            .store
            .index(indices::ANALYST_STATUS, None, doc, Refresh::None)
            .await
        {
            tracing::warn!(incident_id, error = %e, "analyst status write failed");
        }
    }

    /// Daily batch: weight calibration, threshold tuning, and pattern
    /// discovery, each raced against the batch deadline.
    pub async fn run_batch(&self) {
        let deadline = Duration::from_millis(self.config.batch_deadline_ms);
        let incidents = match self
            .store
            .search(SearchRequest::new(indices::INCIDENTS, Query::MatchAll).with_size(500))
            .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.source).collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(error = %e, "batch incident load failed");
                return;
            }
        };

        let weights = {
            let this = self.clone_refs();
            let incidents = incidents.clone();
            async move { this.calibrate_weights(&incidents).await }.boxed()
        };
        let thresholds = {
            let this = self.clone_refs();
            let incidents = incidents.clone();
            async move { this.tune_thresholds(&incidents).await }.boxed()
        };
        let patterns = {
            let this = self.clone_refs();
            async move { this.discover_patterns(&incidents).await }.boxed()
        };

        let results = partial_race(
            deadline,
            vec![
                ("weight_calibration".to_string(), weights),
                ("threshold_tuning".to_string(), thresholds),
                ("pattern_discovery".to_string(), patterns),
            ],
        )
        .await;
        for (label, outcome) in &results {
            if let Some(reason) = outcome.rejection() {
                tracing::warn!(task = %label, reason, "batch task did not finish");
            }
        }
        self.write_status("batch", "batch_complete").await;
    }

    async fn calibrate_weights(&self, incidents: &[Value]) -> Result<(), String> {
        let terminal: Vec<&Value> = incidents
            .iter()
            .filter(|i| i["resolution_type"].is_string())
            .collect();
        if terminal.is_empty() {
            return Ok(());
        }
        let escalated = terminal
            .iter()
            .filter(|i| i["resolution_type"] == "escalated")
            .count();
        let escalation_rate = escalated as f64 / terminal.len() as f64;
        let doc = json!({
            "doc_type": "weight_calibration",
            "sample_size": terminal.len(),
            "escalation_rate": escalation_rate,
            "recommendation": if escalation_rate > 0.3 {
                "raise severity weight; too many incidents escape automation"
            } else {
                "weights holding"
            },
            "@timestamp": Utc::now(),
        });
        self.store
            .index(indices::LEARNINGS, None, doc, Refresh::None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn tune_thresholds(&self, incidents: &[Value]) -> Result<(), String> {
        let terminal: Vec<&Value> = incidents
            .iter()
            .filter(|i| i["resolution_type"].is_string())
            .collect();
        if terminal.is_empty() {
            return Ok(());
        }
        let suppressed = terminal
            .iter()
            .filter(|i| i["resolution_type"] == "suppressed")
            .count();
        let suppression_rate = suppressed as f64 / terminal.len() as f64;
        let doc = json!({
            "doc_type": "threshold_tuning",
            "sample_size": terminal.len(),
            "suppression_rate": suppression_rate,
            "recommendation": if suppression_rate < 0.05 {
                "suppress threshold may be too low; noisy alerts reach investigation"
            } else if suppression_rate > 0.5 {
                "suppress threshold may be too high; real incidents could be dropped"
            } else {
                "thresholds holding"
            },
            "@timestamp": Utc::now(),
        });
        self.store
            .index(indices::LEARNINGS, None, doc, Refresh::None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn discover_patterns(&self, incidents: &[Value]) -> Result<(), String> {
        let mut by_rule: HashMap<&str, usize> = HashMap::new();
        for incident in incidents {
            if let Some(rule) = incident["rule_id"].as_str() {
                *by_rule.entry(rule).or_default() += 1;
            }
        }
        for (rule_id, count) in by_rule {
            if count < PATTERN_MIN_COUNT {
                continue;
            }
            let doc = json!({
                "doc_type": "pattern",
                "rule_id": rule_id,
                "incident_count": count,
                "@timestamp": Utc::now(),
            });
            self.store
                .index(indices::LEARNINGS, None, doc, Refresh::None)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Spawn the cron batch loop. Refuses schedules firing more often than
    /// every five minutes.
    pub fn spawn_batch_schedule(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ScheduleError> {
        let schedule = validate_cron(&self.config.batch_cron)?;
        Ok(tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now()).num_milliseconds().max(0) as u64;
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(wait)) => {
                        self.run_batch().await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("analyst batch schedule stopped");
        }))
    }

    fn clone_refs(&self) -> AnalystAgent {
        AnalystAgent {
            store: Arc::clone(&self.store),
            embedder: Arc::clone(&self.embedder),
            config: self.config.clone(),
            recently_analyzed: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentHandler for AnalystAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        match payload["task"].as_str() {
            Some("analyze_incident") => {
                let incident_id = payload["incident_id"]
                    .as_str()
                    .ok_or_else(|| AgentError::Invalid("incident_id is required".to_string()))?;
                self.process_incident(incident_id).await;
                Ok(json!({"incident_id": incident_id, "status": "analyzed"}))
            }
            Some("run_batch") => {
                self.run_batch().await;
                Ok(json!({"status": "batch_complete"}))
            }
            other => Err(AgentError::Invalid(format!("unknown analyst task: {other:?}"))),
        }
    }
}
