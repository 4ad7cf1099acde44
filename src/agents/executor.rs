//! Executor agent.
//!
//! Runs a remediation plan action by action, strictly in ascending order,
//! stopping at the first failure. Approval-gated actions poll the decisions
//! index before dispatch. Every attempt writes an audit row; audit write
//! failures never unwind the pipeline. An overall deadline marks unreached
//! actions as skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::domain::errors::{AgentError, BusError};
use crate::domain::indices::{self, agents};
use crate::domain::models::{
    ActionRecord, ActionType, Envelope, ExecutionStatus, PlannedAction,
};
use crate::domain::ports::store::{Query, Refresh, SearchRequest, Sort, Store};
use crate::infrastructure::config::ExecutorConfig;
use crate::services::bus::{AgentBus, AgentHandler};
use crate::services::contracts;

/// Outcome of one approval gate.
enum ApprovalOutcome {
    Approved { user: String },
    Rejected { user: String },
    TimedOut,
    PollFailed,
}

#[derive(Debug, Clone)]
struct ActionOutcome {
    action_id: String,
    order: u32,
    status: ExecutionStatus,
    result_summary: Option<String>,
    error: Option<String>,
}

pub struct ExecutorAgent {
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
    config: ExecutorConfig,
}

impl ExecutorAgent {
    pub fn new(store: Arc<dyn Store>, bus: Arc<AgentBus>, config: ExecutorConfig) -> Self {
        Self { store, bus, config }
    }

    /// Structured failure response; the executor reports plan-shape problems
    /// instead of throwing.
    fn failed_response(incident_id: &str, error: impl Into<String>) -> Value {
        json!({
            "incident_id": incident_id,
            "status": "failed",
            "action_results": [],
            "error": error.into(),
        })
    }

    fn parse_actions(incident_id: &str, raw: &[Value]) -> Result<Vec<PlannedAction>, String> {
        let mut actions = Vec::with_capacity(raw.len());
        for (i, value) in raw.iter().enumerate() {
            let obj = value
                .as_object()
                .ok_or_else(|| format!("actions[{i}] is not an object"))?;
            let type_str = obj
                .get("action_type")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("actions[{i}] has no action_type"))?;
            if ActionType::from_str(type_str).is_none() {
                return Err(format!("actions[{i}] has unknown action_type '{type_str}'"));
            }
            for field in ["order", "description", "target_system", "target_asset"] {
                if obj.get(field).is_none() {
                    return Err(format!("actions[{i}] is missing {field}"));
                }
            }
            let action: PlannedAction = serde_json::from_value(value.clone())
                .map_err(|e| format!("actions[{i}] is malformed: {e}"))?;
            actions.push(action);
        }
        tracing::debug!(incident_id, count = actions.len(), "plan actions parsed");
        Ok(actions)
    }

    /// Idempotency guard: any prior effector audit row for this incident
    /// means the plan already ran.
    async fn already_executed(&self, incident_id: &str) -> bool {
        let query = Query::And(vec![
            Query::Term {
                field: "incident_id".to_string(),
                value: json!(incident_id),
            },
            Query::Not(Box::new(Query::Term {
                field: "action_type".to_string(),
                value: json!("state_transition"),
            })),
        ]);
        match self
            .store
            .search(SearchRequest::new(indices::ACTIONS, query).with_size(1))
            .await
        {
            Ok(hits) => !hits.is_empty(),
            Err(e) => {
                tracing::warn!(incident_id, error = %e, "idempotency check failed, assuming fresh");
                false
            }
        }
    }

    async fn execute_plan(&self, incident_id: &str, actions: Vec<PlannedAction>) -> Value {
        let overall = Duration::from_millis(self.config.deadline_ms);
        let started = tokio::time::Instant::now();

        let mut outcomes: Vec<ActionOutcome> = Vec::with_capacity(actions.len());
        let mut halted: Option<&'static str> = None;

        let mut iter = actions.iter();
        while let Some(action) = iter.next() {
            if started.elapsed() >= overall {
                halted = Some("deadline exceeded");
                self.record_skipped(incident_id, action, "deadline exceeded", &mut outcomes)
                    .await;
                break;
            }
            let action_id = format!("{incident_id}-a{}", action.order);
            let action_started = Utc::now();

            let mut approval: Option<(String, chrono::DateTime<Utc>)> = None;
            if action.approval_required {
                match self.approval_gate(incident_id, &action_id, action).await {
                    ApprovalOutcome::Approved { user } => {
                        approval = Some((user, Utc::now()));
                    }
                    ApprovalOutcome::Rejected { user } => {
                        let error = format!("approval rejected by {user}");
                        self.record_failure(incident_id, action, &action_id, action_started, &error, &mut outcomes)
                            .await;
                        halted = Some("approval rejected");
                        break;
                    }
                    ApprovalOutcome::TimedOut => {
                        self.record_failure(
                            incident_id,
                            action,
                            &action_id,
                            action_started,
                            "approval timed out",
                            &mut outcomes,
                        )
                        .await;
                        halted = Some("approval timeout");
                        break;
                    }
                    ApprovalOutcome::PollFailed => {
                        self.record_failure(
                            incident_id,
                            action,
                            &action_id,
                            action_started,
                            "approval polling failed",
                            &mut outcomes,
                        )
                        .await;
                        halted = Some("approval polling failed");
                        break;
                    }
                }
            }

            let workflow_id = action.action_type.workflow_id();
            let remaining = overall.saturating_sub(started.elapsed());
            let timeout = Duration::from_millis(self.config.workflow_timeout_ms).min(remaining);
            let envelope = Envelope::request(
                agents::EXECUTOR,
                workflow_id,
                json!({
                    "incident_id": incident_id,
                    "action_id": action_id,
                    "action": action,
                }),
            );

            let dispatch = self.bus.send(&envelope, timeout).await;
            let (status, result_summary, error) = match dispatch {
                Ok(response) if response["status"] == "failed" => {
                    let error = response["error"]
                        .as_str()
                        .unwrap_or("workflow reported failure")
                        .to_string();
                    (ExecutionStatus::Failed, None, Some(error))
                }
                Ok(response) => {
                    let summary = response["summary"]
                        .as_str()
                        .map_or_else(|| response.to_string(), ToString::to_string);
                    (ExecutionStatus::Completed, Some(summary), None)
                }
                Err(BusError::DeadlineExceeded { timeout_ms, .. }) => (
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("workflow timed out after {timeout_ms}ms")),
                ),
                Err(e) => (ExecutionStatus::Failed, None, Some(e.to_string())),
            };

            let mut record = ActionRecord::action(
                incident_id,
                action.action_type.as_str(),
                &action.description,
                action_started,
                status,
            )
            .with_workflow(workflow_id)
            .with_rollback_available(action.rollback_steps.is_some());
            if let Some((user, at)) = &approval {
                record = record.with_approval(user.clone(), *at);
            } else if action.approval_required {
                record = record.with_approval_required();
            }
            if let Some(summary) = &result_summary {
                record = record.with_result(summary.clone());
            }
            if let Some(err) = &error {
                record = record.with_error(err.clone());
            }
            self.write_audit(record).await;

            tracing::info!(
                incident_id,
                order = action.order,
                workflow = workflow_id,
                status = status.as_str(),
                "action dispatched"
            );
            outcomes.push(ActionOutcome {
                action_id,
                order: action.order,
                status,
                result_summary,
                error,
            });

            if status == ExecutionStatus::Failed {
                halted = Some("action failed");
                break;
            }
        }

        // Unreached actions: skipped, with the halt reason.
        if let Some(reason) = halted {
            let remaining: Vec<&PlannedAction> = iter.collect();
            for action in remaining {
                self.record_skipped(incident_id, action, reason, &mut outcomes).await;
            }
        }

        let completed = outcomes
            .iter()
            .filter(|o| o.status == ExecutionStatus::Completed)
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| o.status == ExecutionStatus::Failed)
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| o.status == ExecutionStatus::Skipped)
            .count();
        let status = if completed == outcomes.len() && skipped == 0 && failed == 0 {
            "completed"
        } else if completed > 0 {
            "partial_failure"
        } else {
            "failed"
        };

        let action_results: Vec<Value> = outcomes
            .iter()
            .map(|o| {
                let mut entry = json!({
                    "action_id": o.action_id,
                    "order": o.order,
                    "status": o.status.as_str(),
                });
                if let Some(summary) = &o.result_summary {
                    entry["result_summary"] = json!(summary);
                }
                if let Some(error) = &o.error {
                    entry["error"] = json!(error);
                }
                entry
            })
            .collect();

        let mut response = json!({
            "incident_id": incident_id,
            "status": status,
            "action_results": action_results,
        });
        if let Some(first_error) = outcomes.iter().find_map(|o| o.error.clone()) {
            response["error"] = json!(first_error);
        }
        response
    }

    async fn record_skipped(
        &self,
        incident_id: &str,
        action: &PlannedAction,
        reason: &str,
        outcomes: &mut Vec<ActionOutcome>,
    ) {
        let record = ActionRecord::action(
            incident_id,
            action.action_type.as_str(),
            &action.description,
            Utc::now(),
            ExecutionStatus::Skipped,
        )
        .with_error(reason.to_string());
        self.write_audit(record).await;
        outcomes.push(ActionOutcome {
            action_id: format!("{incident_id}-a{}", action.order),
            order: action.order,
            status: ExecutionStatus::Skipped,
            result_summary: None,
            error: Some(reason.to_string()),
        });
    }

    async fn record_failure(
        &self,
        incident_id: &str,
        action: &PlannedAction,
        action_id: &str,
        started_at: chrono::DateTime<Utc>,
        error: &str,
        outcomes: &mut Vec<ActionOutcome>,
    ) {
        let record = ActionRecord::action(
            incident_id,
            action.action_type.as_str(),
            &action.description,
            started_at,
            ExecutionStatus::Failed,
        )
        .with_approval_required()
        .with_error(error.to_string());
        self.write_audit(record).await;
        outcomes.push(ActionOutcome {
            action_id: action_id.to_string(),
            order: action.order,
            status: ExecutionStatus::Failed,
            result_summary: None,
            error: Some(error.to_string()),
        });
    }

    /// Audit writes never unwind the pipeline.
    async fn write_audit(&self, record: ActionRecord) {
        let doc = match serde_json::to_value(&record) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(error = %e, "audit serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .store
            .index(indices::ACTIONS, Some(&record.action_id), doc, Refresh::WaitFor)
            .await
        {
            tracing::error!(action_id = %record.action_id, error = %e, "audit write failed");
        }
    }

    /// Send the approval request, then poll the decisions index until a
    /// matching decision lands or the gate times out. Up to
    /// `max_poll_errors` consecutive poll failures are tolerated.
    async fn approval_gate(
        &self,
        incident_id: &str,
        action_id: &str,
        action: &PlannedAction,
    ) -> ApprovalOutcome {
        let request = Envelope::request(
            agents::EXECUTOR,
            agents::WF_APPROVAL,
            json!({
                "incident_id": incident_id,
                "action_id": action_id,
                "description": action.description,
                "action_type": action.action_type.as_str(),
                "target_asset": action.target_asset,
            }),
        );
        if let Err(e) = self
            .bus
            .send(&request, Duration::from_millis(self.config.workflow_timeout_ms))
            .await
        {
            // The decision may still arrive out of band; keep polling.
            tracing::warn!(incident_id, action_id, error = %e, "approval request delivery failed");
        }

        let interval = Duration::from_millis(self.config.approval_poll_interval_ms);
        let timeout = Duration::from_secs(self.config.approval_timeout_minutes * 60);
        let started = tokio::time::Instant::now();
        let mut consecutive_errors = 0u32;

        loop {
            if started.elapsed() >= timeout {
                return ApprovalOutcome::TimedOut;
            }
            let query = Query::And(vec![
                Query::Term {
                    field: "incident_id".to_string(),
                    value: json!(incident_id),
                },
                Query::Term {
                    field: "action_id".to_string(),
                    value: json!(action_id),
                },
            ]);
            let request = SearchRequest::new(indices::APPROVAL_RESPONSES, query)
                .with_size(1)
                .with_sort(Sort::desc("@timestamp"));
            match self.store.search(request).await {
                Ok(hits) => {
                    consecutive_errors = 0;
                    if let Some(hit) = hits.first() {
                        let user = hit.source["user"]
                            .as_str()
                            .unwrap_or("unknown")
                            .to_string();
                        match hit.source["value"].as_str() {
                            Some("approve" | "approved") => {
                                return ApprovalOutcome::Approved { user }
                            }
                            Some("reject" | "rejected") => {
                                return ApprovalOutcome::Rejected { user }
                            }
                            // more_info keeps the gate open.
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        incident_id,
                        action_id,
                        consecutive_errors,
                        error = %e,
                        "approval poll failed"
                    );
                    if consecutive_errors > self.config.max_poll_errors {
                        return ApprovalOutcome::PollFailed;
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl AgentHandler for ExecutorAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        let Some(incident_id) = payload["incident_id"].as_str().filter(|s| !s.is_empty()) else {
            return Err(AgentError::Validation(vec![
                "missing field: incident_id (string)".to_string(),
            ]));
        };
        let incident_id = incident_id.to_string();

        if payload["task"].as_str() != Some("execute_plan") {
            return Ok(Self::failed_response(&incident_id, "task must be 'execute_plan'"));
        }
        let raw_actions = match payload["actions"].as_array() {
            Some(actions) if !actions.is_empty() => actions.clone(),
            _ => return Ok(Self::failed_response(&incident_id, "actions must be non-empty")),
        };
        let actions = match Self::parse_actions(&incident_id, &raw_actions) {
            Ok(actions) => actions,
            Err(reason) => return Ok(Self::failed_response(&incident_id, reason)),
        };

        // Ascending order, duplicates dropped (first wins).
        let plan = crate::domain::models::RemediationPlan::new(actions, vec![]);
        let (ordered, dropped) = plan.ordered_actions();
        if dropped > 0 {
            tracing::warn!(incident_id = %incident_id, dropped, "duplicate action orders dropped");
        }

        if self.already_executed(&incident_id).await {
            tracing::info!(incident_id = %incident_id, "plan already executed, returning no-op");
            let response = json!({
                "incident_id": incident_id,
                "status": "completed",
                "action_results": [],
            });
            return Ok(response);
        }

        let response = self.execute_plan(&incident_id, ordered).await;
        contracts::validate("execute_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::MemoryStore;
    use crate::services::bus::FnHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan_actions() -> Value {
        json!([
            {
                "order": 1,
                "action_type": "containment",
                "description": "Block source IP",
                "target_system": "cloudflare",
                "target_asset": "api-gateway",
                "approval_required": false
            },
            {
                "order": 2,
                "action_type": "communication",
                "description": "Notify on-call",
                "target_system": "slack",
                "target_asset": "#incidents",
                "approval_required": false
            }
        ])
    }

    async fn wired(store: Arc<MemoryStore>) -> (ExecutorAgent, Arc<AgentBus>) {
        let bus = Arc::new(AgentBus::new());
        for wf in [
            agents::WF_CONTAINMENT,
            agents::WF_REMEDIATION,
            agents::WF_NOTIFY,
            agents::WF_TICKETING,
            agents::WF_APPROVAL,
        ] {
            bus.register(
                wf,
                Arc::new(FnHandler(|_| async {
                    Ok(json!({"status": "ok", "summary": "done"}))
                })),
            )
            .await;
        }
        let config = ExecutorConfig {
            approval_poll_interval_ms: 10,
            approval_timeout_minutes: 1,
            ..Default::default()
        };
        (
            ExecutorAgent::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&bus), config),
            bus,
        )
    }

    fn request(actions: Value) -> Value {
        json!({
            "task": "execute_plan",
            "incident_id": "INC-2026-ABCDE",
            "actions": actions,
        })
    }

    #[tokio::test]
    async fn test_all_actions_complete() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        let response = executor.handle(request(plan_actions())).await.unwrap();
        assert_eq!(response["status"], "completed");
        assert_eq!(response["action_results"].as_array().unwrap().len(), 2);
        assert_eq!(store.count(indices::ACTIONS).await, 2);
    }

    #[tokio::test]
    async fn test_unknown_action_type_is_structured_failure() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(store).await;
        let response = executor
            .handle(request(json!([{
                "order": 1,
                "action_type": "reboot_the_world",
                "description": "x",
                "target_system": "y",
                "target_asset": "z"
            }])))
            .await
            .unwrap();
        assert_eq!(response["status"], "failed");
        assert!(response["error"].as_str().unwrap().contains("reboot_the_world"));
    }

    #[tokio::test]
    async fn test_empty_actions_is_structured_failure() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(store).await;
        let response = executor.handle(request(json!([]))).await.unwrap();
        assert_eq!(response["status"], "failed");
    }

    #[tokio::test]
    async fn test_missing_incident_id_is_thrown() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(store).await;
        let err = executor
            .handle(json!({"task": "execute_plan", "actions": plan_actions()}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failure_stops_loop_and_skips_rest() {
        let store = Arc::new(MemoryStore::new());
        let (executor, bus) = wired(Arc::clone(&store)).await;
        bus.register(
            agents::WF_CONTAINMENT,
            Arc::new(FnHandler(|_| async {
                Ok(json!({"status": "failed", "error": "effector unavailable"}))
            })),
        )
        .await;

        let response = executor.handle(request(plan_actions())).await.unwrap();
        assert_eq!(response["status"], "failed");
        let results = response["action_results"].as_array().unwrap();
        assert_eq!(results[0]["status"], "failed");
        assert_eq!(results[1]["status"], "skipped");

        // Invariant: failed action k means no later action executed.
        let audits = store.all_docs(indices::ACTIONS).await;
        assert!(audits
            .iter()
            .all(|a| a["execution_status"] != "completed"));
    }

    #[tokio::test]
    async fn test_idempotency_guard_returns_noop() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;

        let first = executor.handle(request(plan_actions())).await.unwrap();
        assert_eq!(first["status"], "completed");
        assert_eq!(store.count(indices::ACTIONS).await, 2);

        let second = executor.handle(request(plan_actions())).await.unwrap();
        assert_eq!(second["status"], "completed");
        assert_eq!(second["action_results"].as_array().unwrap().len(), 0);
        // No new audit rows.
        assert_eq!(store.count(indices::ACTIONS).await, 2);
    }

    #[tokio::test]
    async fn test_transition_audits_do_not_trip_idempotency() {
        let store = Arc::new(MemoryStore::new());
        let record = ActionRecord::state_transition(
            "INC-2026-ABCDE",
            crate::domain::models::IncidentStatus::Detected,
            crate::domain::models::IncidentStatus::Triaged,
            "triage",
        );
        store
            .index(
                indices::ACTIONS,
                Some(&record.action_id),
                serde_json::to_value(&record).unwrap(),
                Refresh::WaitFor,
            )
            .await
            .unwrap();
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        let response = executor.handle(request(plan_actions())).await.unwrap();
        // The transition audit alone must not suppress execution.
        assert_eq!(response["action_results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_orders_deduplicated_first_wins() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        let response = executor
            .handle(request(json!([
                {"order": 1, "action_type": "communication", "description": "first", "target_system": "slack", "target_asset": "#a"},
                {"order": 1, "action_type": "communication", "description": "dup", "target_system": "slack", "target_asset": "#b"}
            ])))
            .await
            .unwrap();
        let results = response["action_results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(response["status"], "completed");
    }

    #[tokio::test]
    async fn test_approval_approved_then_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        // Pre-seed the decision so poll #1 finds it.
        store
            .index(
                indices::APPROVAL_RESPONSES,
                None,
                json!({
                    "incident_id": "INC-2026-ABCDE",
                    "action_id": "INC-2026-ABCDE-a1",
                    "value": "approve",
                    "user": "oncall",
                    "@timestamp": "2026-01-01T00:00:00Z"
                }),
                Refresh::WaitFor,
            )
            .await
            .unwrap();

        let mut actions = plan_actions();
        actions[0]["approval_required"] = json!(true);
        let response = executor.handle(request(actions)).await.unwrap();
        assert_eq!(response["status"], "completed");

        let audits = store.all_docs(indices::ACTIONS).await;
        let gated = audits
            .iter()
            .find(|a| a["action_type"] == "containment")
            .unwrap();
        assert_eq!(gated["approved_by"], "oncall");
        assert_eq!(gated["approval_required"], true);
    }

    #[tokio::test]
    async fn test_approval_rejected_stops_loop() {
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        store
            .index(
                indices::APPROVAL_RESPONSES,
                None,
                json!({
                    "incident_id": "INC-2026-ABCDE",
                    "action_id": "INC-2026-ABCDE-a1",
                    "value": "reject",
                    "user": "oncall",
                    "@timestamp": "2026-01-01T00:00:00Z"
                }),
                Refresh::WaitFor,
            )
            .await
            .unwrap();

        let mut actions = plan_actions();
        actions[0]["approval_required"] = json!(true);
        let response = executor.handle(request(actions)).await.unwrap();
        assert_eq!(response["status"], "failed");
        let results = response["action_results"].as_array().unwrap();
        assert!(results[0]["error"].as_str().unwrap().contains("rejected"));
        assert_eq!(results[1]["status"], "skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout(){
        let store = Arc::new(MemoryStore::new());
        let (executor, _bus) = wired(Arc::clone(&store)).await;
        let mut actions = plan_actions();
        actions[0]["approval_required"] = json!(true);
        // No decision ever lands; paused time fast-forwards the polls.
        let response = executor.handle(request(actions)).await.unwrap();
        let results = response["action_results"].as_array().unwrap();
        assert!(results[0]["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(response["status"], "failed");
    }

    #[tokio::test]
    async fn test_approval_poll_counts_approvals_per_action() {
        let store = Arc::new(MemoryStore::new());
        let (executor, bus) = wired(Arc::clone(&store)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        // Approval workflow receives exactly one request per gated action.
        bus.register(
            agents::WF_APPROVAL,
            Arc::new(FnHandler(move |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"status": "sent"}))
                }
            })),
        )
        .await;
        store
            .index(
                indices::APPROVAL_RESPONSES,
                None,
                json!({
                    "incident_id": "INC-2026-ABCDE",
                    "action_id": "INC-2026-ABCDE-a1",
                    "value": "approved",
                    "user": "oncall",
                    "@timestamp": "2026-01-01T00:00:00Z"
                }),
                Refresh::WaitFor,
            )
            .await
            .unwrap();
        let mut actions = plan_actions();
        actions[0]["approval_required"] = json!(true);
        executor.handle(request(actions)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
