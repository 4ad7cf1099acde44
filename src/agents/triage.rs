//! Triage agent.
//!
//! Scores an alert with a weighted sum over severity, asset criticality,
//! corroboration signal, and inverse false-positive rate. The three tool
//! calls run in parallel against the triage deadline; whatever settled in
//! time feeds the score, defaults cover the rest.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::domain::errors::AgentError;
use crate::domain::indices;
use crate::domain::models::{Alert, Disposition, TriageFactors, TriageReport};
use crate::domain::ports::store::{Query, Store};
use crate::infrastructure::config::TriageConfig;
use crate::services::bus::AgentHandler;
use crate::services::concurrency::partial_race;
use crate::services::contracts;
use crate::services::tools::{ToolOutput, ToolRegistry};

const ENRICHMENT_TOOL: &str = "alert-enrichment";
const FP_RATE_TOOL: &str = "alert-fp-rate";
const CRITICALITY_TOOL: &str = "asset-criticality";

/// Defaults used when a tool result did not settle before the deadline.
const DEFAULT_CRITICALITY: f64 = 0.5;
const DEFAULT_FP_RATE: f64 = 0.5;

pub struct TriageAgent {
    tools: Arc<ToolRegistry>,
    store: Arc<dyn Store>,
    config: TriageConfig,
}

impl TriageAgent {
    pub fn new(tools: Arc<ToolRegistry>, store: Arc<dyn Store>, config: TriageConfig) -> Self {
        Self {
            tools,
            store,
            config,
        }
    }

    /// Score one alert.
    pub async fn triage(&self, alert: &Alert) -> TriageReport {
        let deadline = std::time::Duration::from_millis(self.config.deadline_ms);

        let enrichment = {
            let tools = Arc::clone(&self.tools);
            let mut params = Map::new();
            params.insert("alert_id".to_string(), json!(alert.alert_id));
            if let Some(ip) = &alert.source_ip {
                params.insert("source_ip".to_string(), json!(ip));
            }
            async move { tools.execute(ENRICHMENT_TOOL, &params).await }.boxed()
        };
        let fp_rate = {
            let tools = Arc::clone(&self.tools);
            let mut params = Map::new();
            params.insert("rule_id".to_string(), json!(alert.rule_id));
            async move { tools.execute(FP_RATE_TOOL, &params).await }.boxed()
        };
        let criticality = {
            let tools = Arc::clone(&self.tools);
            let asset = alert.affected_asset_id.clone().unwrap_or_default();
            let mut params = Map::new();
            params.insert("query".to_string(), json!(asset));
            async move { tools.execute(CRITICALITY_TOOL, &params).await }.boxed()
        };

        let results = partial_race(
            deadline,
            vec![
                ("enrichment".to_string(), enrichment),
                ("fp_rate".to_string(), fp_rate),
                ("criticality".to_string(), criticality),
            ],
        )
        .await;

        let mut corroboration = 0.0;
        let mut fp = DEFAULT_FP_RATE;
        let mut asset_criticality = DEFAULT_CRITICALITY;
        for (label, settled) in &results {
            let Some(output) = settled.value() else {
                tracing::debug!(alert_id = %alert.alert_id, task = %label, "triage tool did not settle, using default");
                continue;
            };
            match (label.as_str(), output) {
                ("enrichment", ToolOutput::Esql(result)) => {
                    // Corroboration saturates at five corroborating events.
                    if let Some(count) = result
                        .value(0, "corroborating_events")
                        .and_then(Value::as_f64)
                    {
                        corroboration = (count / 5.0).clamp(0.0, 1.0);
                    }
                }
                ("fp_rate", ToolOutput::Esql(result)) => {
                    if let Some(rate) = result.value(0, "fp_rate").and_then(Value::as_f64) {
                        fp = rate.clamp(0.0, 1.0);
                    }
                }
                ("criticality", ToolOutput::Hits(hits)) => {
                    if let Some(c) = hits
                        .first()
                        .and_then(|h| h.get("criticality"))
                        .and_then(Value::as_f64)
                    {
                        asset_criticality = c.clamp(0.0, 1.0);
                    }
                }
                _ => {}
            }
        }

        let factors = TriageFactors {
            severity: alert.severity_original.weight(),
            asset_criticality,
            corroboration,
            fp_rate: fp,
        };
        let w = &self.config.weights;
        let priority_score = (w.severity * factors.severity
            + w.asset_criticality * factors.asset_criticality
            + w.corroboration * factors.corroboration
            + w.false_positive * (1.0 - factors.fp_rate))
            .clamp(0.0, 1.0);
        let disposition = Disposition::from_score(
            priority_score,
            self.config.investigate_threshold,
            self.config.suppress_threshold,
        );

        tracing::info!(
            alert_id = %alert.alert_id,
            priority_score,
            disposition = disposition.as_str(),
            "alert triaged"
        );

        TriageReport {
            alert_id: alert.alert_id.clone(),
            priority_score,
            disposition,
            factors,
            triaged_at: Utc::now(),
        }
    }

    /// Write triage fields back onto the alert document. Failures are
    /// logged only.
    fn write_back(&self, report: &TriageReport) {
        let store = Arc::clone(&self.store);
        let alert_id = report.alert_id.clone();
        let patch = json!({
            "triage": {"factors": report.factors},
            "priority_score": report.priority_score,
            "disposition": report.disposition.as_str(),
            "triaged_at": report.triaged_at,
        });
        tokio::spawn(async move {
            let query = Query::Term {
                field: "alert_id".to_string(),
                value: json!(alert_id),
            };
            if let Err(e) = store
                .update_by_query(indices::ALERTS_DEFAULT, query, patch)
                .await
            {
                tracing::warn!(error = %e, "triage write-back failed");
            }
        });
    }
}

#[async_trait]
impl AgentHandler for TriageAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        contracts::validate("triage_request", &payload)
            .map_err(|v| AgentError::Validation(v.issues))?;
        let alert: Alert = serde_json::from_value(payload["alert"].clone())
            .map_err(|e| AgentError::Invalid(e.to_string()))?;

        let report = self.triage(&alert).await;
        self.write_back(&report);

        let response = serde_json::to_value(&report)
            .map_err(|e| AgentError::Invalid(e.to_string()))?;
        contracts::validate("triage_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Severity;
    use crate::domain::ports::store::{EsqlResult, Refresh};
    use crate::domain::ports::NullEmbedder;
    use crate::infrastructure::store::MemoryStore;
    use crate::services::concurrency::RetryPolicy;
    use crate::services::tools::ToolRegistryConfig;
    use std::time::Duration;

    fn tool_defs() -> Vec<crate::domain::models::ToolDefinition> {
        vec![
            serde_json::from_value(json!({
                "id": ENRICHMENT_TOOL,
                "retrieval_strategy": "esql",
                "configuration": {
                    "query": "FROM vigil-alerts-default | WHERE alert_id == ?alert_id | STATS corroborating_events = COUNT(*)",
                    "params": {"alert_id": {"type": "keyword", "required": true}}
                }
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": FP_RATE_TOOL,
                "retrieval_strategy": "esql",
                "configuration": {
                    "query": "FROM vigil-alerts-default | WHERE rule_id == ?rule_id | STATS fp_rate = AVG(was_fp)",
                    "params": {"rule_id": {"type": "keyword", "required": true}}
                }
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": CRITICALITY_TOOL,
                "retrieval_strategy": "keyword",
                "index": indices::ASSETS,
                "query_fields": ["name"],
                "result_fields": ["name", "criticality", "tier"],
                "max_results": 1
            }))
            .unwrap(),
        ]
    }

    async fn agent(store: Arc<MemoryStore>) -> TriageAgent {
        let tools = Arc::new(ToolRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(NullEmbedder::default()),
            tool_defs(),
            ToolRegistryConfig {
                timeout: Duration::from_secs(2),
                retry: RetryPolicy::new(0, Duration::from_millis(1)),
            },
        ));
        TriageAgent::new(tools, store, TriageConfig::default())
    }

    fn alert() -> Alert {
        Alert::new("A-001", "sec-brute-force", Severity::High)
            .with_source_ip("10.0.0.5")
            .with_asset("api-gateway")
    }

    async fn seed_signals(store: &MemoryStore) {
        store
            .register_esql(
                "STATS corroborating_events",
                EsqlResult::new(vec!["corroborating_events".to_string()], vec![vec![json!(5)]]),
            )
            .await;
        store
            .register_esql(
                "STATS fp_rate",
                EsqlResult::new(vec!["fp_rate".to_string()], vec![vec![json!(0.1)]]),
            )
            .await;
        store
            .index(
                indices::ASSETS,
                Some("api-gateway"),
                json!({"name": "api-gateway", "criticality": 0.95, "tier": 1}),
                Refresh::None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_high_signal_alert_scores_investigate() {
        let store = Arc::new(MemoryStore::new());
        seed_signals(&store).await;
        let agent = agent(Arc::clone(&store)).await;

        let report = agent.triage(&alert()).await;
        // 0.4*0.75 + 0.3*0.95 + 0.2*1.0 + 0.1*0.9 = 0.875
        assert!((report.priority_score - 0.875).abs() < 1e-9);
        assert_eq!(report.disposition, Disposition::Investigate);
    }

    #[tokio::test]
    async fn test_missing_signals_fall_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        let agent = agent(Arc::clone(&store)).await;

        let report = agent.triage(&alert()).await;
        // 0.4*0.75 + 0.3*0.5 + 0.2*0.0 + 0.1*0.5 = 0.5
        assert!((report.priority_score - 0.5).abs() < 1e-9);
        assert_eq!(report.disposition, Disposition::Monitor);
        assert!((report.factors.fp_rate - DEFAULT_FP_RATE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_handle_validates_and_returns_contract_response() {
        let store = Arc::new(MemoryStore::new());
        seed_signals(&store).await;
        let agent = agent(Arc::clone(&store)).await;

        let payload = json!({"alert": {
            "alert_id": "A-001",
            "rule_id": "sec-brute-force",
            "severity_original": "high",
            "source_ip": "10.0.0.5",
            "affected_asset_id": "api-gateway"
        }});
        let response = agent.handle(payload).await.unwrap();
        assert!(contracts::validate("triage_response", &response).is_ok());
        assert_eq!(response["disposition"], "investigate");
    }

    #[tokio::test]
    async fn test_handle_rejects_malformed_request() {
        let store = Arc::new(MemoryStore::new());
        let agent = agent(store).await;
        let err = agent.handle(json!({"nope": true})).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_write_back_updates_alert_doc() {
        let store = Arc::new(MemoryStore::new());
        seed_signals(&store).await;
        store
            .index(
                indices::ALERTS_DEFAULT,
                Some("A-001"),
                json!({"alert_id": "A-001", "rule_id": "sec-brute-force"}),
                Refresh::None,
            )
            .await
            .unwrap();
        let agent = agent(Arc::clone(&store)).await;
        let payload = json!({"alert": {
            "alert_id": "A-001",
            "rule_id": "sec-brute-force",
            "severity_original": "high"
        }});
        agent.handle(payload).await.unwrap();

        // The write-back is spawned; give it a chance to land.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            let docs = store.all_docs(indices::ALERTS_DEFAULT).await;
            if docs[0].get("disposition").is_some() {
                return;
            }
        }
        panic!("triage write-back never landed");
    }
}
