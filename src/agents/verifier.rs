//! Verifier agent.
//!
//! Checks the plan's success criteria against live health metrics fetched
//! from the Sentinel, with a dual comparison per criterion: the threshold
//! and, when the baseline verdict column is present, the ES|QL baseline
//! verdict must both pass. An absent verdict column counts as passing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::domain::errors::AgentError;
use crate::domain::indices::agents;
use crate::domain::models::{CriterionResult, Envelope, SuccessCriterion, VerificationReport};
use crate::infrastructure::config::VerifierConfig;
use crate::services::bus::{AgentBus, AgentHandler};
use crate::services::concurrency::bounded_parallel;
use crate::services::contracts;
use crate::services::tools::ToolRegistry;

const BASELINE_TOOL: &str = "verification-baseline";
const METRICS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct VerifierAgent {
    bus: Arc<AgentBus>,
    tools: Arc<ToolRegistry>,
    config: VerifierConfig,
}

impl VerifierAgent {
    pub fn new(bus: Arc<AgentBus>, tools: Arc<ToolRegistry>, config: VerifierConfig) -> Self {
        Self { bus, tools, config }
    }

    /// One health-metrics call per affected service.
    async fn gather_metrics(&self, services: &[String]) -> Vec<HashMap<String, f64>> {
        let calls: Vec<_> = services
            .iter()
            .map(|service| {
                let bus = Arc::clone(&self.bus);
                let service = service.clone();
                async move {
                    let envelope = Envelope::request(
                        agents::VERIFIER,
                        agents::SENTINEL,
                        json!({"task": "get_health_metrics", "service": service}),
                    );
                    let response = bus.send(&envelope, METRICS_TIMEOUT).await?;
                    let metrics: HashMap<String, f64> = response["metrics"]
                        .as_object()
                        .map(|m| {
                            m.iter()
                                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok::<_, crate::domain::errors::BusError>(metrics)
                }
            })
            .collect();
        bounded_parallel(5, calls)
            .await
            .into_iter()
            .filter_map(crate::services::concurrency::Settled::into_value)
            .collect()
    }

    /// Baseline verdicts by metric name, when the tool and column exist.
    async fn baseline_verdicts(&self, services: &[String]) -> HashMap<String, bool> {
        let mut params = Map::new();
        params.insert("services".to_string(), json!(services));
        let output = match self.tools.execute(BASELINE_TOOL, &params).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(error = %e, "baseline verdict query unavailable");
                return HashMap::new();
            }
        };
        let Some(result) = output.esql() else {
            return HashMap::new();
        };
        // Absent column: every criterion passes the baseline check.
        if result.column_index("baseline_verdict").is_none() {
            return HashMap::new();
        }
        let mut verdicts = HashMap::new();
        for row in result.as_objects() {
            let Some(metric) = row.get("metric").and_then(Value::as_str) else {
                continue;
            };
            if let Some(verdict) = row.get("baseline_verdict").and_then(Value::as_bool) {
                // A single failing service fails the metric's baseline.
                let entry = verdicts.entry(metric.to_string()).or_insert(true);
                *entry = *entry && verdict;
            }
        }
        verdicts
    }

    fn evaluate(
        criteria: &[SuccessCriterion],
        metrics: &[HashMap<String, f64>],
        verdicts: &HashMap<String, bool>,
    ) -> Vec<CriterionResult> {
        criteria
            .iter()
            .map(|criterion| {
                let samples: Vec<f64> = metrics
                    .iter()
                    .filter_map(|m| m.get(&criterion.metric).copied())
                    .collect();
                let observed = if samples.is_empty() {
                    None
                } else {
                    Some(samples.iter().sum::<f64>() / samples.len() as f64)
                };
                let threshold_passed = observed
                    .map(|o| criterion.operator.evaluate(o, criterion.threshold))
                    .unwrap_or(false);
                let baseline_verdict = verdicts.get(&criterion.metric).copied();
                let passed = threshold_passed && baseline_verdict.unwrap_or(true);
                CriterionResult {
                    metric: criterion.metric.clone(),
                    operator: criterion.operator,
                    threshold: criterion.threshold,
                    observed,
                    baseline_verdict,
                    passed,
                }
            })
            .collect()
    }
}

#[async_trait]
impl AgentHandler for VerifierAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        contracts::validate("verify_request", &payload)
            .map_err(|v| AgentError::Validation(v.issues))?;
        let incident_id = payload["incident_id"].as_str().unwrap_or_default().to_string();
        let services: Vec<String> = payload["affected_services"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let criteria: Vec<SuccessCriterion> = payload["success_criteria"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let attempt = payload["attempt"].as_u64().unwrap_or(0) as u32;

        let metrics = self.gather_metrics(&services).await;
        let verdicts = self.baseline_verdicts(&services).await;
        let criteria_results = Self::evaluate(&criteria, &metrics, &verdicts);

        let total = criteria_results.len();
        let passed_count = criteria_results.iter().filter(|c| c.passed).count();
        let health_score = if total == 0 {
            1.0
        } else {
            passed_count as f64 / total as f64
        };
        let passed = health_score >= self.config.health_score_threshold;
        let failure_analysis = (!passed).then(|| {
            let failing: Vec<String> = criteria_results
                .iter()
                .filter(|c| !c.passed)
                .map(|c| match c.observed {
                    Some(o) => format!(
                        "{} observed {o:.4}, wanted {} {}",
                        c.metric,
                        c.operator.as_str(),
                        c.threshold
                    ),
                    None => format!("{} unobserved", c.metric),
                })
                .collect();
            format!("criteria failing: {}", failing.join(", "))
        });

        tracing::info!(
            incident_id = %incident_id,
            health_score,
            passed,
            attempt,
            "verification complete"
        );

        let report = VerificationReport {
            incident_id,
            passed,
            health_score,
            criteria_results,
            failure_analysis,
            attempt,
            verified_at: Utc::now(),
        };
        let response =
            serde_json::to_value(&report).map_err(|e| AgentError::Invalid(e.to_string()))?;
        contracts::validate("verify_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}
