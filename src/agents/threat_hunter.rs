//! Threat hunter agent.
//!
//! Sweeps for lateral movement: one dynamic IoC query whose clauses cover
//! only the non-empty indicator arrays, one behavioral-anomaly query per
//! known compromised user, and a total-assets count. Everything races a
//! single deadline; labels identify tasks that did not settle. Read-only:
//! the hunter writes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::domain::errors::AgentError;
use crate::domain::models::{
    BehavioralAnomaly, ConfirmedAsset, SuspectedAsset, ThreatScope,
};
use crate::domain::ports::store::EsqlParam;
use crate::infrastructure::config::SweepConfig;
use crate::services::bus::AgentHandler;
use crate::services::concurrency::partial_race;
use crate::services::contracts;
use crate::services::tools::{ToolOutput, ToolRegistry};

const BEHAVIOR_TOOL: &str = "behavioral-anomaly";
const TOTAL_ASSETS_TOOL: &str = "total-assets-count";

/// Anomaly score at or above which an asset is suspected.
const SUSPECT_SCORE: f64 = 0.7;

/// Indicator arrays for the sweep.
#[derive(Debug, Default, Clone)]
struct IocSet {
    ips: Vec<String>,
    domains: Vec<String>,
    hashes: Vec<String>,
    processes: Vec<String>,
}

impl IocSet {
    fn from_payload(payload: &Value) -> Self {
        let pick = |kind: &str| -> Vec<String> {
            payload["iocs"][kind]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            ips: pick("ips"),
            domains: pick("domains"),
            hashes: pick("hashes"),
            processes: pick("processes"),
        }
    }

    fn is_empty(&self) -> bool {
        self.ips.is_empty()
            && self.domains.is_empty()
            && self.hashes.is_empty()
            && self.processes.is_empty()
    }

    /// Compose the sweep query with one clause per non-empty indicator
    /// array. Values travel as named parameters, never in the query text.
    fn sweep_query(&self) -> Option<(String, Vec<EsqlParam>)> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if !self.ips.is_empty() {
            clauses.push("source.ip IN (?ips) OR destination.ip IN (?ips)");
            params.push(EsqlParam::new("ips", json!(self.ips)));
        }
        if !self.domains.is_empty() {
            clauses.push("dns.question.name IN (?domains)");
            params.push(EsqlParam::new("domains", json!(self.domains)));
        }
        if !self.hashes.is_empty() {
            clauses.push("file.hash.sha256 IN (?hashes)");
            params.push(EsqlParam::new("hashes", json!(self.hashes)));
        }
        if !self.processes.is_empty() {
            clauses.push("process.name IN (?processes)");
            params.push(EsqlParam::new("processes", json!(self.processes)));
        }
        if clauses.is_empty() {
            return None;
        }
        let query = format!(
            "FROM logs-* | WHERE {} | STATS hits = COUNT(*) BY host.name | SORT hits DESC | LIMIT 100",
            clauses
                .iter()
                .map(|c| format!("({c})"))
                .collect::<Vec<_>>()
                .join(" OR ")
        );
        Some((query, params))
    }
}

pub struct ThreatHunterAgent {
    tools: Arc<ToolRegistry>,
    config: SweepConfig,
}

impl ThreatHunterAgent {
    pub fn new(tools: Arc<ToolRegistry>, config: SweepConfig) -> Self {
        Self { tools, config }
    }

    async fn sweep(&self, incident_id: &str, iocs: IocSet, users: Vec<String>) -> ThreatScope {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let mut tasks = Vec::new();

        if let Some((query, params)) = iocs.sweep_query() {
            let tools = Arc::clone(&self.tools);
            tasks.push((
                "ioc_sweep".to_string(),
                async move {
                    let result = tools
                        .execute_dynamic_esql("ioc-sweep", &query, params)
                        .await?;
                    Ok::<Value, crate::domain::errors::ToolError>(json!(result.as_objects()))
                }
                .boxed(),
            ));
        }

        for user in &users {
            let tools = Arc::clone(&self.tools);
            let user = user.clone();
            tasks.push((
                format!("behavior:{user}"),
                async move {
                    let mut params = Map::new();
                    params.insert("user".to_string(), json!(user));
                    let out = tools.execute(BEHAVIOR_TOOL, &params).await?;
                    Ok(esql_rows(&out))
                }
                .boxed(),
            ));
        }

        {
            let tools = Arc::clone(&self.tools);
            tasks.push((
                "total_assets".to_string(),
                async move {
                    let out = tools.execute(TOTAL_ASSETS_TOOL, &Map::new()).await?;
                    let total = out
                        .esql()
                        .and_then(|r| r.value(0, "total").cloned())
                        .unwrap_or(json!(0));
                    Ok(total)
                }
                .boxed(),
            ));
        }

        let results = partial_race(deadline, tasks).await;

        let mut confirmed: Vec<ConfirmedAsset> = Vec::new();
        let mut anomalies_by_user: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_assets = 0u64;
        let mut unsettled = Vec::new();

        for (label, settled) in results {
            let Some(value) = settled.into_value() else {
                tracing::warn!(incident_id, task = %label, "sweep task did not settle");
                unsettled.push(label);
                continue;
            };
            if label == "ioc_sweep" {
                for row in value.as_array().into_iter().flatten() {
                    let Some(asset) = row.get("host.name").and_then(Value::as_str) else {
                        continue;
                    };
                    let hits = row.get("hits").and_then(Value::as_u64).unwrap_or(0);
                    if hits > 0 {
                        confirmed.push(ConfirmedAsset {
                            asset_id: asset.to_string(),
                            hit_count: hits,
                        });
                    }
                }
            } else if label.starts_with("behavior:") {
                // Dedup by user, max score wins.
                for row in value.as_array().into_iter().flatten() {
                    let Some(user) = row.get("user.name").and_then(Value::as_str) else {
                        continue;
                    };
                    let score = row
                        .get("anomaly_score")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let entry = anomalies_by_user.entry(user.to_string()).or_insert(score);
                    if score > *entry {
                        *entry = score;
                    }
                }
            } else if label == "total_assets" {
                total_assets = value.as_u64().unwrap_or(0);
            }
        }

        let behavioral_anomalies: Vec<BehavioralAnomaly> = anomalies_by_user
            .iter()
            .map(|(user, score)| BehavioralAnomaly {
                user: user.clone(),
                score: *score,
            })
            .collect();

        let confirmed_ids: std::collections::BTreeSet<&str> =
            confirmed.iter().map(|c| c.asset_id.as_str()).collect();
        let suspected: Vec<SuspectedAsset> = anomalies_by_user
            .iter()
            .filter(|(user, score)| {
                **score >= SUSPECT_SCORE && !confirmed_ids.contains(user.as_str())
            })
            .map(|(user, score)| SuspectedAsset {
                asset_id: user.clone(),
                anomaly_score: *score,
            })
            .collect();

        let clean_assets = total_assets
            .saturating_sub(confirmed.len() as u64)
            .saturating_sub(suspected.len() as u64);

        tracing::info!(
            incident_id,
            confirmed = confirmed.len(),
            suspected = suspected.len(),
            total_assets,
            unsettled = unsettled.len(),
            "sweep complete"
        );

        ThreatScope {
            incident_id: incident_id.to_string(),
            confirmed_compromised: confirmed,
            suspected,
            behavioral_anomalies,
            total_assets,
            clean_assets,
            unsettled,
        }
    }
}

#[async_trait]
impl AgentHandler for ThreatHunterAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        contracts::validate("sweep_request", &payload)
            .map_err(|v| AgentError::Validation(v.issues))?;
        let incident_id = payload["incident_id"].as_str().unwrap_or_default().to_string();
        let iocs = IocSet::from_payload(&payload);
        let users: Vec<String> = payload["compromised_users"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if iocs.is_empty() && users.is_empty() {
            tracing::debug!(incident_id = %incident_id, "nothing to sweep");
        }
        let scope = self.sweep(&incident_id, iocs, users).await;

        let response =
            serde_json::to_value(&scope).map_err(|e| AgentError::Invalid(e.to_string()))?;
        contracts::validate("sweep_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}

fn esql_rows(output: &ToolOutput) -> Value {
    match output.esql() {
        Some(result) => json!(result.as_objects()),
        None => json!([]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::StoreError;
    use crate::domain::ports::store::{EsqlResult, Store};
    use crate::domain::ports::NullEmbedder;
    use crate::infrastructure::store::MemoryStore;
    use crate::services::concurrency::RetryPolicy;
    use crate::services::tools::{ToolRegistry, ToolRegistryConfig};

    fn tool_defs() -> Vec<crate::domain::models::ToolDefinition> {
        vec![
            serde_json::from_value(json!({
                "id": BEHAVIOR_TOOL,
                "retrieval_strategy": "esql",
                "configuration": {
                    "query": "FROM logs-auth | WHERE user.name == ?user | STATS anomaly_score = MAX(risk) BY user.name",
                    "params": {"user": {"type": "keyword", "required": true}}
                }
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": TOTAL_ASSETS_TOOL,
                "retrieval_strategy": "esql",
                "configuration": {"query": "FROM vigil-assets | STATS total = COUNT(*)"}
            }))
            .unwrap(),
        ]
    }

    fn hunter(store: Arc<MemoryStore>) -> ThreatHunterAgent {
        let tools = Arc::new(ToolRegistry::new(
            store as Arc<dyn Store>,
            Arc::new(NullEmbedder::default()),
            tool_defs(),
            ToolRegistryConfig {
                timeout: Duration::from_secs(2),
                retry: RetryPolicy::new(0, Duration::from_millis(1)),
            },
        ));
        ThreatHunterAgent::new(tools, SweepConfig::default())
    }

    #[test]
    fn test_sweep_query_includes_only_non_empty_clauses() {
        let iocs = IocSet {
            ips: vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()],
            processes: vec!["mimikatz.exe".to_string()],
            ..Default::default()
        };
        let (query, params) = iocs.sweep_query().unwrap();
        assert!(query.contains("source.ip IN (?ips)"));
        assert!(query.contains("process.name IN (?processes)"));
        assert!(!query.contains("dns.question.name"));
        assert!(!query.contains("file.hash"));
        // Values never appear in the query text.
        assert!(!query.contains("10.0.0.5"));
        assert!(!query.contains("mimikatz"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_empty_iocs_produce_no_query() {
        assert!(IocSet::default().sweep_query().is_none());
    }

    fn sweep_payload() -> Value {
        json!({
            "incident_id": "INC-2026-ABCDE",
            "iocs": {
                "ips": ["10.0.0.5"],
                "domains": [],
                "hashes": [],
                "processes": []
            },
            "compromised_users": ["user-42", "user-7"]
        })
    }

    #[tokio::test]
    async fn test_sweep_assembles_scope() {
        let store = Arc::new(MemoryStore::new());
        store
            .register_esql(
                "STATS hits = COUNT(*) BY host.name",
                EsqlResult::new(
                    vec!["host.name".to_string(), "hits".to_string()],
                    vec![
                        vec![json!("web-1"), json!(12)],
                        vec![json!("web-2"), json!(2)],
                    ],
                ),
            )
            .await;
        store
            .register_esql(
                "FROM logs-auth",
                EsqlResult::new(
                    vec!["user.name".to_string(), "anomaly_score".to_string()],
                    vec![
                        vec![json!("user-42"), json!(0.9)],
                        vec![json!("user-42"), json!(0.4)],
                        vec![json!("user-7"), json!(0.2)],
                    ],
                ),
            )
            .await;
        store
            .register_esql(
                "STATS total = COUNT(*)",
                EsqlResult::new(vec!["total".to_string()], vec![vec![json!(50)]]),
            )
            .await;

        let hunter = hunter(Arc::clone(&store));
        let response = hunter.handle(sweep_payload()).await.unwrap();
        assert!(contracts::validate("sweep_response", &response).is_ok());

        let scope: ThreatScope = serde_json::from_value(response).unwrap();
        assert_eq!(scope.confirmed_compromised.len(), 2);
        assert_eq!(scope.confirmed_compromised[0].asset_id, "web-1");
        // Max score wins the per-user dedup.
        let user42 = scope
            .behavioral_anomalies
            .iter()
            .find(|a| a.user == "user-42")
            .unwrap();
        assert!((user42.score - 0.9).abs() < f64::EPSILON);
        assert_eq!(scope.suspected.len(), 1);
        assert_eq!(scope.suspected[0].asset_id, "user-42");
        assert_eq!(scope.total_assets, 50);
        // 50 - 2 confirmed - 1 suspected.
        assert_eq!(scope.clean_assets, 47);
        assert!(scope.unsettled.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_array_params_expanded() {
        let store = Arc::new(MemoryStore::new());
        let hunter = hunter(Arc::clone(&store));
        hunter.handle(sweep_payload()).await.unwrap();
        let queries = store.esql_queries().await;
        let sweep = queries.iter().find(|q| q.contains("BY host.name")).unwrap();
        assert!(sweep.contains("?ips_0"));
        assert!(!sweep.contains("(?ips)"));
    }

    #[tokio::test]
    async fn test_failed_task_marked_unsettled_others_kept() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_esql(
                "FROM logs-auth",
                StoreError::Query("shard failure".to_string()),
                10,
            )
            .await;
        store
            .register_esql(
                "STATS total = COUNT(*)",
                EsqlResult::new(vec!["total".to_string()], vec![vec![json!(10)]]),
            )
            .await;
        let hunter = hunter(Arc::clone(&store));
        let response = hunter.handle(sweep_payload()).await.unwrap();
        let scope: ThreatScope = serde_json::from_value(response).unwrap();
        assert_eq!(scope.total_assets, 10);
        assert!(scope.behavioral_anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_clean_assets_floored_at_zero() {
        let store = Arc::new(MemoryStore::new());
        store
            .register_esql(
                "STATS hits = COUNT(*) BY host.name",
                EsqlResult::new(
                    vec!["host.name".to_string(), "hits".to_string()],
                    vec![
                        vec![json!("web-1"), json!(4)],
                        vec![json!("web-2"), json!(3)],
                        vec![json!("web-3"), json!(2)],
                    ],
                ),
            )
            .await;
        store
            .register_esql(
                "STATS total = COUNT(*)",
                EsqlResult::new(vec!["total".to_string()], vec![vec![json!(2)]]),
            )
            .await;
        let hunter = hunter(Arc::clone(&store));
        let response = hunter.handle(sweep_payload()).await.unwrap();
        let scope: ThreatScope = serde_json::from_value(response).unwrap();
        assert_eq!(scope.clean_assets, 0);
    }
}
