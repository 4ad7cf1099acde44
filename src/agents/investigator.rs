//! Investigator agent.
//!
//! Security mode traces the attack chain progressively over widening time
//! windows, then enriches in parallel: blast radius, MITRE mapping, threat
//! intel, similar incidents. Operational mode correlates a change event
//! with the error onset. A deadline miss produces a minimal valid response
//! that recommends escalation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::domain::errors::{AgentError, StoreError, ToolError};
use crate::domain::indices;
use crate::domain::models::{
    Alert, ChangeCorrelation, CompromisedAsset, ConfidenceBand, InvestigationReport,
    RecommendedNext,
};
use crate::domain::ports::store::Store;
use crate::infrastructure::config::InvestigationConfig;
use crate::services::bus::AgentHandler;
use crate::services::concurrency::{bounded_parallel, partial_race, with_deadline};
use crate::services::contracts;
use crate::services::tools::{ToolOutput, ToolRegistry};

const TRACE_TOOL: &str = "attack-chain-trace";
const NETWORK_TRACE_TOOL: &str = "attack-chain-network";
const BLAST_RADIUS_TOOL: &str = "blast-radius";
const MITRE_TOOL: &str = "mitre-mapping";
const THREAT_INTEL_TOOL: &str = "threat-intel-search";
const SIMILAR_TOOL: &str = "similar-incidents";
const CHANGE_CORRELATION_TOOL: &str = "operational-change-correlation";

/// Progressive trace windows, hours.
const TRACE_WINDOWS_HOURS: [u32; 3] = [1, 6, 24];

pub struct InvestigatorAgent {
    tools: Arc<ToolRegistry>,
    store: Arc<dyn Store>,
    config: InvestigationConfig,
}

impl InvestigatorAgent {
    pub fn new(
        tools: Arc<ToolRegistry>,
        store: Arc<dyn Store>,
        config: InvestigationConfig,
    ) -> Self {
        Self {
            tools,
            store,
            config,
        }
    }

    async fn investigate_security(
        &self,
        incident_id: &str,
        alert: &Alert,
        previous_failure: Option<&str>,
    ) -> InvestigationReport {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let (attack_chain, window_used) = self.trace_attack_chain(alert).await;

        let behaviors: Vec<String> = {
            let mut seen = std::collections::BTreeSet::new();
            attack_chain
                .iter()
                .filter_map(|e| e.get("event.action").and_then(Value::as_str))
                .filter(|b| seen.insert((*b).to_string()))
                .map(ToString::to_string)
                .collect()
        };

        let blast = {
            let tools = Arc::clone(&self.tools);
            let mut params = Map::new();
            if let Some(asset) = &alert.affected_asset_id {
                params.insert("asset".to_string(), json!(asset));
            }
            if let Some(ip) = &alert.source_ip {
                params.insert("source_ip".to_string(), json!(ip));
            }
            async move {
                let out = tools.execute(BLAST_RADIUS_TOOL, &params).await?;
                Ok::<Value, ToolError>(esql_objects(&out))
            }
            .boxed()
        };
        let mitre = {
            let tools = Arc::clone(&self.tools);
            let behaviors = behaviors.clone();
            async move {
                // One search per observed behavior, in parallel.
                let searches: Vec<_> = behaviors
                    .iter()
                    .map(|behavior| {
                        let tools = Arc::clone(&tools);
                        let mut params = Map::new();
                        params.insert("query".to_string(), json!(behavior));
                        async move { tools.execute(MITRE_TOOL, &params).await }
                    })
                    .collect();
                let settled = bounded_parallel(4, searches).await;
                let mut techniques = std::collections::BTreeSet::new();
                for outcome in settled {
                    if let Some(output) = outcome.into_value() {
                        for hit in output.hits().unwrap_or_default() {
                            if let Some(t) = hit.get("technique_id").and_then(Value::as_str) {
                                techniques.insert(t.to_string());
                            }
                        }
                    }
                }
                Ok::<Value, ToolError>(json!(techniques.into_iter().collect::<Vec<_>>()))
            }
            .boxed()
        };
        let intel = {
            let tools = Arc::clone(&self.tools);
            let needle = alert
                .source_ip
                .clone()
                .or_else(|| alert.affected_asset_id.clone())
                .unwrap_or_else(|| alert.rule_id.clone());
            let mut params = Map::new();
            params.insert("query".to_string(), json!(needle));
            async move {
                let out = tools.execute(THREAT_INTEL_TOOL, &params).await?;
                Ok::<Value, ToolError>(json!(out.hits().unwrap_or_default()))
            }
            .boxed()
        };
        let similar = {
            let tools = Arc::clone(&self.tools);
            let description = alert
                .description
                .clone()
                .unwrap_or_else(|| alert.rule_id.clone());
            let mut params = Map::new();
            params.insert("query".to_string(), json!(description));
            async move {
                let out = tools.execute(SIMILAR_TOOL, &params).await?;
                Ok::<Value, ToolError>(json!(out.hits().unwrap_or_default()))
            }
            .boxed()
        };

        let results = partial_race(
            deadline,
            vec![
                ("blast_radius".to_string(), blast),
                ("mitre".to_string(), mitre),
                ("threat_intel".to_string(), intel),
                ("similar".to_string(), similar),
            ],
        )
        .await;
        let section = |name: &str| -> Value {
            results
                .iter()
                .find(|(label, _)| label == name)
                .and_then(|(_, settled)| settled.value().cloned())
                .unwrap_or(Value::Null)
        };

        let blast_radius = section("blast_radius");
        let mitre_techniques: Vec<String> = section("mitre")
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let threat_intel_matches: Vec<Value> = section("threat_intel")
            .as_array()
            .cloned()
            .unwrap_or_default();
        let similar_incidents: Vec<Value> =
            section("similar").as_array().cloned().unwrap_or_default();

        let affected_services = extract_services(&blast_radius, alert);
        let compromised_assets = score_compromised_assets(&attack_chain, alert);
        let recommended_next = if threat_intel_matches.is_empty() {
            RecommendedNext::PlanRemediation
        } else {
            RecommendedNext::ThreatHunt
        };

        let root_cause = synthesize_root_cause(
            alert,
            &attack_chain,
            window_used,
            &blast_radius,
            &threat_intel_matches,
            previous_failure,
        );
        let confidence = if attack_chain.len() >= self.config.sparse_result_threshold {
            0.8
        } else if attack_chain.is_empty() {
            0.3
        } else {
            0.6
        };

        InvestigationReport {
            incident_id: incident_id.to_string(),
            root_cause,
            attack_chain: attack_chain.into_iter().map(Value::Object).collect(),
            blast_radius,
            mitre_techniques,
            threat_intel_matches,
            similar_incidents,
            affected_services,
            compromised_assets,
            recommended_next,
            confidence,
            trace_window_hours: window_used,
        }
    }

    /// Widen the trace window until it yields enough events. An
    /// unknown-column rejection switches to the network-only query once.
    async fn trace_attack_chain(
        &self,
        alert: &Alert,
    ) -> (Vec<Map<String, Value>>, Option<u32>) {
        let mut network_fallback = false;
        let mut best: Vec<Map<String, Value>> = Vec::new();
        let mut window_used = None;
        let mut i = 0;
        while i < TRACE_WINDOWS_HOURS.len() {
            let window = TRACE_WINDOWS_HOURS[i];
            let tool = if network_fallback {
                NETWORK_TRACE_TOOL
            } else {
                TRACE_TOOL
            };
            let mut params = Map::new();
            params.insert("window_hours".to_string(), json!(window));
            if let Some(asset) = &alert.affected_asset_id {
                params.insert("asset".to_string(), json!(asset));
            }
            if let Some(ip) = &alert.source_ip {
                params.insert("source_ip".to_string(), json!(ip));
            }
            match self.tools.execute(tool, &params).await {
                Ok(output) => {
                    let rows = output.esql().map(|r| r.as_objects()).unwrap_or_default();
                    let enough = rows.len() >= self.config.sparse_result_threshold;
                    best = rows;
                    window_used = Some(window);
                    if enough {
                        break;
                    }
                    i += 1;
                }
                Err(ToolError::Query { source, .. })
                    if !network_fallback && is_unknown_column(&source) =>
                {
                    tracing::warn!(tool, window, "endpoint fields unavailable, retrying network-only");
                    network_fallback = true;
                }
                Err(e) => {
                    tracing::warn!(tool, window, error = %e, "attack-chain trace window failed");
                    i += 1;
                }
            }
        }
        (best, window_used)
    }

    /// Correlate a change event with the error onset. The gap maps to a
    /// confidence band and must stay under `max_gap_seconds` to count.
    async fn investigate_operational(
        &self,
        incident_id: &str,
        alert: &Alert,
        change_event: Option<&Value>,
    ) -> InvestigationReport {
        let service = alert
            .affected_asset_id
            .clone()
            .unwrap_or_else(|| "unknown-service".to_string());

        let correlation = match change_event {
            Some(event) => correlation_from_event(event, &service),
            None => self.correlate_change(&service).await,
        };

        let root_cause = match &correlation {
            Some(c) => format!(
                "{} {} on {} correlated with error onset ({}s gap, {} confidence)",
                c.change_type, c.change_ref, c.service, c.gap_seconds,
                c.confidence.as_str()
            ),
            None => format!(
                "Operational degradation on {service} with no correlated change; likely environmental"
            ),
        };

        let mut report = InvestigationReport {
            incident_id: incident_id.to_string(),
            root_cause,
            affected_services: vec![service],
            recommended_next: RecommendedNext::PlanRemediation,
            confidence: match correlation.as_ref().map(|c| c.confidence) {
                Some(ConfidenceBand::High) => 0.9,
                Some(ConfidenceBand::Medium) => 0.7,
                Some(ConfidenceBand::Low) => 0.5,
                None => 0.4,
            },
            ..Default::default()
        };
        if let Some(c) = correlation {
            report.attack_chain = vec![json!({
                "event.kind": "change",
                "change_type": c.change_type,
                "change_ref": c.change_ref,
                "gap_seconds": c.gap_seconds,
            })];
        }
        report
    }

    async fn correlate_change(&self, service: &str) -> Option<ChangeCorrelation> {
        let mut params = Map::new();
        params.insert("service".to_string(), json!(service));
        let output = match self.tools.execute(CHANGE_CORRELATION_TOOL, &params).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(service, error = %e, "change correlation failed");
                return None;
            }
        };
        let result = output.esql()?;
        // Smallest gap wins.
        let mut best: Option<ChangeCorrelation> = None;
        for row in result.as_objects() {
            let gap = row.get("gap_seconds").and_then(Value::as_i64)?;
            if gap > self.config.max_gap_seconds {
                continue;
            }
            let candidate = ChangeCorrelation {
                change_type: row
                    .get("change_type")
                    .and_then(Value::as_str)
                    .unwrap_or("deployment")
                    .to_string(),
                change_ref: row
                    .get("change_ref")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                service: service.to_string(),
                gap_seconds: gap,
                confidence: ConfidenceBand::from_gap_seconds(gap),
            };
            if best.as_ref().is_none_or(|b| gap < b.gap_seconds) {
                best = Some(candidate);
            }
        }
        best
    }

    fn minimal_report(incident_id: &str, reason: &str) -> InvestigationReport {
        InvestigationReport {
            incident_id: incident_id.to_string(),
            root_cause: format!("Investigation failed: {reason}"),
            recommended_next: RecommendedNext::Escalate,
            ..Default::default()
        }
    }

    fn persist_report(&self, report: &InvestigationReport) {
        let store = Arc::clone(&self.store);
        let doc = json!({
            "doc_type": "investigation",
            "report": report,
            "@timestamp": chrono::Utc::now(),
        });
        tokio::spawn(async move {
            if let Err(e) = store
                .index(indices::INVESTIGATIONS, None, doc, crate::domain::ports::Refresh::None)
                .await
            {
                tracing::warn!(error = %e, "investigation report persist failed");
            }
        });
    }
}

#[async_trait]
impl AgentHandler for InvestigatorAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        contracts::validate("investigate_request", &payload)
            .map_err(|v| AgentError::Validation(v.issues))?;
        let incident_id = payload["incident_id"].as_str().unwrap_or_default().to_string();
        let alert: Alert = serde_json::from_value(payload["alert"].clone())
            .map_err(|e| AgentError::Invalid(e.to_string()))?;
        let mode = payload["mode"].as_str().unwrap_or("security").to_string();
        let previous_failure = payload
            .get("previous_failure_analysis")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let change_event = payload.get("change_event").cloned().filter(Value::is_object);

        let deadline = Duration::from_millis(self.config.deadline_ms);
        let report = match with_deadline(deadline, async {
            if mode == "operational" {
                self.investigate_operational(&incident_id, &alert, change_event.as_ref())
                    .await
            } else {
                self.investigate_security(&incident_id, &alert, previous_failure.as_deref())
                    .await
            }
        })
        .await
        {
            Ok(report) => report,
            Err(_) => Self::minimal_report(&incident_id, "deadline exceeded"),
        };

        self.persist_report(&report);

        let response =
            serde_json::to_value(&report).map_err(|e| AgentError::Invalid(e.to_string()))?;
        contracts::validate("investigate_response", &response)
            .map_err(|v| AgentError::Validation(v.issues))?;
        Ok(response)
    }
}

/// Correlation already attached to the request (sentinel-observed change).
fn correlation_from_event(event: &Value, service: &str) -> Option<ChangeCorrelation> {
    let gap = event.get("gap_seconds").and_then(Value::as_i64)?;
    Some(ChangeCorrelation {
        change_type: event
            .get("change_type")
            .and_then(Value::as_str)
            .unwrap_or("deployment")
            .to_string(),
        change_ref: event
            .get("change_ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        service: service.to_string(),
        gap_seconds: gap,
        confidence: ConfidenceBand::from_gap_seconds(gap),
    })
}

fn esql_objects(output: &ToolOutput) -> Value {
    match output.esql() {
        Some(result) => json!(result.as_objects()),
        None => Value::Null,
    }
}

fn is_unknown_column(error: &StoreError) -> bool {
    error.to_string().to_lowercase().contains("unknown column")
}

fn extract_services(blast_radius: &Value, alert: &Alert) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    if let Some(rows) = blast_radius.as_array() {
        for row in rows {
            if let Some(s) = row.get("service.name").and_then(Value::as_str) {
                seen.insert(s.to_string());
            }
        }
    }
    if seen.is_empty() {
        if let Some(asset) = &alert.affected_asset_id {
            seen.insert(asset.clone());
        }
    }
    seen.into_iter().collect()
}

/// Confidence grows with the number of chain events touching the asset.
fn score_compromised_assets(
    attack_chain: &[Map<String, Value>],
    alert: &Alert,
) -> Vec<CompromisedAsset> {
    let mut counts: std::collections::BTreeMap<String, u32> = std::collections::BTreeMap::new();
    for event in attack_chain {
        for key in ["host.name", "user.name", "asset_id"] {
            if let Some(asset) = event.get(key).and_then(Value::as_str) {
                *counts.entry(asset.to_string()).or_default() += 1;
            }
        }
    }
    if counts.is_empty() {
        if let Some(asset) = &alert.affected_asset_id {
            counts.insert(asset.clone(), 1);
        }
    }
    counts
        .into_iter()
        .map(|(asset_id, events)| CompromisedAsset {
            asset_id,
            confidence: (0.4 + 0.15 * f64::from(events)).min(1.0),
        })
        .collect()
}

/// Prose summary assembled from per-section fragments.
fn synthesize_root_cause(
    alert: &Alert,
    attack_chain: &[Map<String, Value>],
    window_used: Option<u32>,
    blast_radius: &Value,
    threat_intel: &[Value],
    previous_failure: Option<&str>,
) -> String {
    let mut sections = Vec::new();
    let primary_behavior = attack_chain
        .first()
        .and_then(|e| e.get("event.action").and_then(Value::as_str))
        .unwrap_or("suspicious activity");
    match &alert.source_ip {
        Some(ip) => sections.push(format!("{primary_behavior} from {ip}")),
        None => sections.push(format!(
            "{primary_behavior} matching rule {}",
            alert.rule_id
        )),
    }
    if let Some(window) = window_used {
        sections.push(format!(
            "{} related events within a {window}h window",
            attack_chain.len()
        ));
    }
    if let Some(rows) = blast_radius.as_array() {
        if !rows.is_empty() {
            sections.push(format!("blast radius spans {} entities", rows.len()));
        }
    }
    if !threat_intel.is_empty() {
        sections.push(format!(
            "{} threat-intel indicator(s) matched",
            threat_intel.len()
        ));
    }
    if let Some(failure) = previous_failure {
        sections.push(format!("previous remediation attempt failed: {failure}"));
    }
    let mut out = sections.join("; ");
    if let Some(first) = out.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    out
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

    fn tool_defs() -> Vec<crate::domain::models::ToolDefinition> {
        let mut defs = Vec::new();
        for (id, query) in [
            (TRACE_TOOL, "FROM logs-endpoint | WHERE host.name == ?asset AND window == ?window_hours"),
            (NETWORK_TRACE_TOOL, "FROM logs-network | WHERE source.ip == ?source_ip AND window == ?window_hours"),
            (BLAST_RADIUS_TOOL, "FROM logs-* | blast WHERE host.name == ?asset"),
        ] {
            defs.push(
                serde_json::from_value(json!({
                    "id": id,
                    "retrieval_strategy": "esql",
                    "configuration": {
                        "query": query,
                        "params": {
                            "asset": {"type": "keyword"},
                            "source_ip": {"type": "keyword"},
                            "window_hours": {"type": "integer", "default": 1}
                        }
                    }
                }))
                .unwrap(),
            );
        }
        for (id, index) in [
            (MITRE_TOOL, indices::THREAT_INTEL),
            (THREAT_INTEL_TOOL, indices::THREAT_INTEL),
        ] {
            defs.push(
                serde_json::from_value(json!({
                    "id": id,
                    "retrieval_strategy": "keyword",
                    "index": index,
                    "query_fields": ["behavior", "indicator"],
                    "result_fields": ["technique_id", "indicator", "source"],
                    "max_results": 5
                }))
                .unwrap(),
            );
        }
        defs.push(
            serde_json::from_value(json!({
                "id": SIMILAR_TOOL,
                "retrieval_strategy": "knn",
                "index": indices::INVESTIGATIONS,
                "vector_field": "content_vector",
                "result_fields": ["incident_id", "root_cause"],
                "max_results": 3
            }))
            .unwrap(),
        );
        defs.push(
            serde_json::from_value(json!({
                "id": CHANGE_CORRELATION_TOOL,
                "retrieval_strategy": "esql",
                "configuration": {
                    "query": "FROM vigil-alerts-operational | LOOKUP JOIN changes ON service.name | WHERE service.name == ?service",
                    "params": {"service": {"type": "keyword", "required": true}}
                },
                "lookupJoinTechPreview": true
            }))
            .unwrap(),
        );
        defs
    }

    fn agent(store: Arc<MemoryStore>) -> InvestigatorAgent {
        let tools = Arc::new(ToolRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(NullEmbedder::default()),
            tool_defs(),
            ToolRegistryConfig {
                timeout: Duration::from_secs(2),
                retry: RetryPolicy::new(0, Duration::from_millis(1)),
            },
        ));
        InvestigatorAgent::new(tools, store, InvestigationConfig::default())
    }

    fn alert() -> Alert {
        Alert::new("A-001", "sec-brute-force", Severity::High)
            .with_source_ip("10.0.0.5")
            .with_asset("api-gateway")
            .with_description("30 failed logins then success")
    }

    fn chain_rows(n: usize) -> EsqlResult {
        EsqlResult::new(
            vec![
                "event.action".to_string(),
                "host.name".to_string(),
                "user.name".to_string(),
            ],
            (0..n)
                .map(|i| {
                    vec![
                        json!("credential_stuffing"),
                        json!("api-gateway"),
                        json!(format!("user-{i}")),
                    ]
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_progressive_trace_stops_at_first_populated_window() {
        let store = Arc::new(MemoryStore::new());
        store.register_esql("logs-endpoint", chain_rows(4)).await;
        let agent = agent(Arc::clone(&store));

        let (chain, window) = agent.trace_attack_chain(&alert()).await;
        assert_eq!(chain.len(), 4);
        assert_eq!(window, Some(1));
        // Only one trace query issued.
        let queries = store.esql_queries().await;
        assert_eq!(queries.iter().filter(|q| q.contains("logs-endpoint")).count(), 1);
    }

    #[tokio::test]
    async fn test_sparse_windows_widen_to_24h() {
        let store = Arc::new(MemoryStore::new());
        store.register_esql("logs-endpoint", chain_rows(1)).await;
        let agent = agent(Arc::clone(&store));

        let (chain, window) = agent.trace_attack_chain(&alert()).await;
        assert_eq!(chain.len(), 1);
        assert_eq!(window, Some(24));
        let queries = store.esql_queries().await;
        assert_eq!(queries.iter().filter(|q| q.contains("logs-endpoint")).count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_column_falls_back_to_network_query_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_esql(
                "logs-endpoint",
                StoreError::Query("Unknown column [process.entity_id]".to_string()),
                10,
            )
            .await;
        store.register_esql("logs-network", chain_rows(3)).await;
        let agent = agent(Arc::clone(&store));

        let (chain, window) = agent.trace_attack_chain(&alert()).await;
        assert_eq!(chain.len(), 3);
        assert_eq!(window, Some(1));
        let queries = store.esql_queries().await;
        assert_eq!(queries.iter().filter(|q| q.contains("logs-endpoint")).count(), 1);
        assert_eq!(queries.iter().filter(|q| q.contains("logs-network")).count(), 1);
    }

    #[tokio::test]
    async fn test_threat_intel_match_recommends_threat_hunt() {
        let store = Arc::new(MemoryStore::new());
        store.register_esql("logs-endpoint", chain_rows(3)).await;
        store
            .index(
                indices::THREAT_INTEL,
                Some("ioc-1"),
                json!({"indicator": "10.0.0.5", "source": "feed-a", "behavior": "credential_stuffing", "technique_id": "T1110"}),
                Refresh::None,
            )
            .await
            .unwrap();
        let agent = agent(Arc::clone(&store));

        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "mode": "security",
            "alert": serde_json::to_value(alert()).unwrap()
        });
        let response = agent.handle(payload).await.unwrap();
        assert!(contracts::validate("investigate_response", &response).is_ok());
        assert_eq!(response["recommended_next"], "threat_hunt");
        assert!(!response["threat_intel_matches"].as_array().unwrap().is_empty());
        assert!(response["root_cause"].as_str().unwrap().starts_with("Credential_stuffing"));
    }

    #[tokio::test]
    async fn test_no_intel_recommends_plan_remediation() {
        let store = Arc::new(MemoryStore::new());
        store.register_esql("logs-endpoint", chain_rows(3)).await;
        let agent = agent(Arc::clone(&store));
        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "mode": "security",
            "alert": serde_json::to_value(alert()).unwrap()
        });
        let response = agent.handle(payload).await.unwrap();
        assert_eq!(response["recommended_next"], "plan_remediation");
    }

    #[tokio::test]
    async fn test_operational_mode_correlates_change_via_fallback() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_esql(
                "LOOKUP JOIN",
                StoreError::Query("LOOKUP JOIN is in technical preview".to_string()),
                10,
            )
            .await;
        store
            .register_esql(
                "event.kind == \"change\"",
                EsqlResult::new(
                    vec![
                        "change_type".to_string(),
                        "change_ref".to_string(),
                        "service.name".to_string(),
                        "@timestamp".to_string(),
                    ],
                    vec![vec![
                        json!("deployment"),
                        json!("deploy-42"),
                        json!("checkout"),
                        json!("2026-01-01T00:00:00Z"),
                    ]],
                ),
            )
            .await;
        store
            .register_esql(
                "event.kind == \"error\"",
                EsqlResult::new(
                    vec!["service.name".to_string(), "@timestamp".to_string()],
                    vec![vec![json!("checkout"), json!("2026-01-01T00:01:00Z")]],
                ),
            )
            .await;
        let agent = agent(Arc::clone(&store));

        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "mode": "operational",
            "alert": {
                "alert_id": "OP-1",
                "rule_id": "ops-error-spike",
                "severity_original": "medium",
                "affected_asset_id": "checkout"
            }
        });
        let response = agent.handle(payload).await.unwrap();
        let root_cause = response["root_cause"].as_str().unwrap();
        assert!(root_cause.contains("deploy-42"));
        assert!(root_cause.contains("high confidence"));
        assert_eq!(response["affected_services"][0], "checkout");
    }

    #[tokio::test]
    async fn test_gap_bands_in_operational_root_cause() {
        let agent_store = Arc::new(MemoryStore::new());
        let agent = agent(Arc::clone(&agent_store));
        let report = agent
            .investigate_operational(
                "INC-2026-ABCDE",
                &Alert::new("OP-1", "ops-error-spike", Severity::Medium).with_asset("checkout"),
                Some(&json!({
                    "change_type": "pull_request",
                    "change_ref": "PR-99",
                    "gap_seconds": 450
                })),
            )
            .await;
        assert!(report.root_cause.contains("medium confidence"));
        assert!(report.root_cause.contains("PR-99"));
    }

    #[tokio::test]
    async fn test_trace_errors_degrade_gracefully() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_esql(
                "logs-endpoint",
                StoreError::Query("syntax error near pipe".to_string()),
                100,
            )
            .await;
        let agent = agent(Arc::clone(&store));

        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "mode": "security",
            "alert": serde_json::to_value(alert()).unwrap()
        });
        let response = agent.handle(payload).await.unwrap();
        assert!(contracts::validate("investigate_response", &response).is_ok());
        // No chain events: the alert's own asset is the only candidate.
        assert_eq!(response["compromised_assets"][0]["asset_id"], "api-gateway");
        assert_eq!(response["recommended_next"], "plan_remediation");
    }

    #[tokio::test]
    async fn test_minimal_report_validates_against_contract() {
        let report = InvestigatorAgent::minimal_report("INC-2026-ABCDE", "deadline exceeded");
        let value = serde_json::to_value(&report).unwrap();
        assert!(contracts::validate("investigate_response", &value).is_ok());
        assert_eq!(value["recommended_next"], "escalate");
        assert!(value["root_cause"].as_str().unwrap().contains("Investigation failed"));
    }
}
