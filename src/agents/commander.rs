//! Commander agent.
//!
//! Builds the remediation plan: ranks candidate runbooks by a composite of
//! service overlap, historical success rate, and search score; assesses
//! per-service impact with bounded concurrency; tags approval requirements
//! from the tier-1 asset set and severity. Any error degrades to a fallback
//! plan with a single notify action.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::domain::errors::AgentError;
use crate::domain::models::{
    ActionType, CriterionOp, PlannedAction, RemediationPlan, Severity, SuccessCriterion,
};
use crate::infrastructure::config::PlanningConfig;
use crate::services::bus::AgentHandler;
use crate::services::concurrency::{bounded_parallel, partial_race};
use crate::services::contracts;
use crate::services::tools::ToolRegistry;

const RUNBOOK_TOOL: &str = "runbook-search";
const IMPACT_TOOL: &str = "service-impact";
const TIER1_TOOL: &str = "tier1-assets";

/// Static fallback when the tier-1 asset load fails or returns nothing.
const TIER1_FALLBACK: [&str; 4] = ["api-gateway", "auth-service", "payments", "primary-db"];

/// Composite runbook score weights.
const W_OVERLAP: f64 = 0.4;
const W_SUCCESS: f64 = 0.4;
const W_SEARCH: f64 = 0.2;

#[derive(Debug, Clone)]
struct RankedRunbook {
    id: String,
    score: f64,
    steps: Vec<Value>,
    success_criteria: Vec<Value>,
}

pub struct CommanderAgent {
    tools: Arc<ToolRegistry>,
    config: PlanningConfig,
}

impl CommanderAgent {
    pub fn new(tools: Arc<ToolRegistry>, config: PlanningConfig) -> Self {
        Self { tools, config }
    }

    async fn plan(
        &self,
        incident_id: &str,
        severity: Severity,
        investigation: &Value,
        threat_scope: Option<&Value>,
    ) -> RemediationPlan {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let affected_services: Vec<String> = investigation["affected_services"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let root_cause = investigation["root_cause"].as_str().unwrap_or_default().to_string();

        let runbooks = {
            let tools = Arc::clone(&self.tools);
            let query = root_cause.clone();
            async move {
                let mut params = Map::new();
                params.insert("query".to_string(), json!(query));
                let out = tools.execute(RUNBOOK_TOOL, &params).await?;
                Ok::<Value, crate::domain::errors::ToolError>(json!(out.hits().unwrap_or_default()))
            }
            .boxed()
        };
        let impact = {
            let tools = Arc::clone(&self.tools);
            let services = affected_services.clone();
            let limit = self.config.impact_concurrency;
            async move {
                let assessments: Vec<_> = services
                    .iter()
                    .map(|service| {
                        let tools = Arc::clone(&tools);
                        let mut params = Map::new();
                        params.insert("service".to_string(), json!(service));
                        let service = service.clone();
                        async move {
                            let out = tools.execute(IMPACT_TOOL, &params).await?;
                            let impacted = out
                                .esql()
                                .and_then(|r| r.value(0, "dependent_count").cloned())
                                .unwrap_or(json!(0));
                            Ok::<Value, crate::domain::errors::ToolError>(
                                json!({"service": service, "dependent_count": impacted}),
                            )
                        }
                    })
                    .collect();
                let settled = bounded_parallel(limit, assessments).await;
                Ok::<Value, crate::domain::errors::ToolError>(json!(settled
                    .into_iter()
                    .filter_map(crate::services::concurrency::Settled::into_value)
                    .collect::<Vec<_>>()))
            }
            .boxed()
        };
        let tier1 = {
            let tools = Arc::clone(&self.tools);
            async move {
                let mut params = Map::new();
                params.insert("query".to_string(), json!("tier 1"));
                let out = tools.execute(TIER1_TOOL, &params).await?;
                let names: Vec<String> = out
                    .hits()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|h| h.get("name").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect();
                Ok::<Value, crate::domain::errors::ToolError>(json!(names))
            }
            .boxed()
        };

        let results = partial_race(
            deadline,
            vec![
                ("runbooks".to_string(), runbooks),
                ("impact".to_string(), impact),
                ("tier1".to_string(), tier1),
            ],
        )
        .await;
        let section = |name: &str| -> Option<Value> {
            results
                .iter()
                .find(|(label, _)| label == name)
                .and_then(|(_, settled)| settled.value().cloned())
        };

        let tier1_assets: BTreeSet<String> = section("tier1")
            .and_then(|v| v.as_array().cloned())
            .filter(|names| !names.is_empty())
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_else(|| TIER1_FALLBACK.iter().map(ToString::to_string).collect());

        let best_runbook = section("runbooks")
            .and_then(|hits| self.rank_runbooks(hits.as_array()?, &affected_services));

        let mut plan = match best_runbook {
            Some(runbook) if runbook.score >= self.config.runbook_match_threshold => {
                tracing::info!(
                    incident_id,
                    runbook = %runbook.id,
                    score = runbook.score,
                    "plan derived from runbook"
                );
                plan_from_runbook(&runbook, investigation)
            }
            _ => {
                tracing::info!(incident_id, "no runbook matched, synthesizing minimal plan");
                synthesize_plan(investigation, threat_scope, &affected_services)
            }
        };

        for action in &mut plan.actions {
            let gated = tier1_assets.contains(&action.target_asset)
                || (action.action_type.is_destructive() && severity == Severity::Critical);
            if gated {
                action.approval_required = true;
            }
        }
        plan.requires_approval = plan.any_approval_required();
        plan
    }

    /// `0.4·service_overlap + 0.4·success_rate + 0.2·normalized_search_score`.
    fn rank_runbooks(&self, hits: &[Value], affected: &[String]) -> Option<RankedRunbook> {
        let max_search = hits
            .iter()
            .filter_map(|h| h.get("_score").and_then(Value::as_f64))
            .fold(0.0f64, f64::max)
            .max(f64::EPSILON);
        hits.iter()
            .map(|hit| {
                let services: BTreeSet<&str> = hit
                    .get("services")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let overlap = if affected.is_empty() {
                    0.0
                } else {
                    affected
                        .iter()
                        .filter(|s| services.contains(s.as_str()))
                        .count() as f64
                        / affected.len() as f64
                };
                let success_rate = hit
                    .get("success_rate")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                let search = hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0) / max_search;
                let score = W_OVERLAP * overlap + W_SUCCESS * success_rate + W_SEARCH * search;
                RankedRunbook {
                    id: hit
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    score,
                    steps: hit
                        .get("steps")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    success_criteria: hit
                        .get("success_criteria")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                }
            })
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Plan used when planning itself fails: one no-op notify action.
    fn fallback_plan(incident_id: &str, reason: &str) -> RemediationPlan {
        tracing::error!(incident_id, reason, "planning failed, emitting fallback plan");
        RemediationPlan::new(
            vec![PlannedAction::new(
                1,
                ActionType::Communication,
                format!("Automated planning failed ({reason}); notify on-call for manual remediation"),
                "slack",
                "#incidents",
            )],
            default_criteria(),
        )
    }
}

fn default_criteria() -> Vec<SuccessCriterion> {
    vec![
        SuccessCriterion::new("error_rate", CriterionOp::Lt, 0.05),
        SuccessCriterion::new("availability", CriterionOp::Gte, 0.99),
    ]
}

fn criteria_from_values(raw: &[Value]) -> Vec<SuccessCriterion> {
    let parsed: Vec<SuccessCriterion> = raw
        .iter()
        .filter_map(|c| serde_json::from_value(c.clone()).ok())
        .collect();
    if parsed.is_empty() {
        default_criteria()
    } else {
        parsed
    }
}

/// Take the runbook's ordered steps as the plan.
fn plan_from_runbook(runbook: &RankedRunbook, investigation: &Value) -> RemediationPlan {
    let default_asset = investigation["affected_services"][0]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let actions: Vec<PlannedAction> = runbook
        .steps
        .iter()
        .enumerate()
        .filter_map(|(i, step)| {
            let action_type = ActionType::from_str(step.get("action_type")?.as_str()?)?;
            let mut action = PlannedAction::new(
                (i + 1) as u32,
                action_type,
                step.get("description").and_then(Value::as_str).unwrap_or(""),
                step.get("target_system").and_then(Value::as_str).unwrap_or("manual"),
                step.get("target_asset")
                    .and_then(Value::as_str)
                    .unwrap_or(&default_asset),
            );
            if let Some(params) = step.get("params") {
                action = action.with_params(params.clone());
            }
            if let Some(rollback) = step.get("rollback_steps").and_then(Value::as_str) {
                action = action.with_rollback(rollback);
            }
            Some(action)
        })
        .collect();
    RemediationPlan::new(actions, criteria_from_values(&runbook.success_criteria))
        .with_runbook(runbook.id.clone())
}

/// Minimal plan when no runbook matches: contain the primary asset, tell
/// the on-call, record a ticket.
fn synthesize_plan(
    investigation: &Value,
    threat_scope: Option<&Value>,
    affected_services: &[String],
) -> RemediationPlan {
    let mut actions = Vec::new();
    let mut order = 1u32;

    let compromised: Vec<&str> = threat_scope
        .and_then(|s| s.get("confirmed_compromised"))
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|c| c.get("asset_id").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let primary_asset = compromised
        .first()
        .copied()
        .or_else(|| {
            investigation["compromised_assets"][0]["asset_id"].as_str()
        })
        .or_else(|| affected_services.first().map(String::as_str));

    if let Some(asset) = primary_asset {
        actions.push(
            PlannedAction::new(
                order,
                ActionType::Containment,
                format!("Isolate {asset} pending investigation"),
                "kubernetes",
                asset,
            )
            .with_rollback(format!("Restore {asset} network policy")),
        );
        order += 1;
    }
    actions.push(PlannedAction::new(
        order,
        ActionType::Communication,
        "Notify on-call with incident summary".to_string(),
        "slack",
        "#incidents",
    ));
    order += 1;
    actions.push(PlannedAction::new(
        order,
        ActionType::Documentation,
        "Open tracking ticket with findings".to_string(),
        "jira",
        "SEC",
    ));

    RemediationPlan::new(actions, default_criteria())
}

#[async_trait]
impl AgentHandler for CommanderAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        contracts::validate("plan_request", &payload)
            .map_err(|v| AgentError::Validation(v.issues))?;
        let incident_id = payload["incident_id"].as_str().unwrap_or_default().to_string();
        let severity = payload["severity"]
            .as_str()
            .and_then(Severity::from_str)
            .unwrap_or_default();
        let investigation = payload["investigation"].clone();
        let threat_scope = payload.get("threat_scope").cloned().filter(Value::is_object);

        let plan = self
            .plan(&incident_id, severity, &investigation, threat_scope.as_ref())
            .await;
        let plan = if plan.actions.is_empty() {
            Self::fallback_plan(&incident_id, "empty plan")
        } else {
            plan
        };

        let mut response =
            serde_json::to_value(&plan).map_err(|e| AgentError::Invalid(e.to_string()))?;
        response["incident_id"] = json!(incident_id);
        contracts::validate("plan_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}
