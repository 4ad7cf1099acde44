//! Sentinel agent.
//!
//! Watches service health: compares current metrics against 7-day rolling
//! baselines, flags services deviating beyond the stddev threshold, then
//! enriches each anomaly in parallel (dependency trace for root-cause vs
//! victim classification, recent-change detection, tier lookup) and
//! forwards structured reports to the Coordinator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::domain::errors::AgentError;
use crate::domain::indices::{self, agents};
use crate::domain::models::{
    incident::short_slug, AnomalyReport, AnomalyRole, ChangeCorrelation, ConfidenceBand, Envelope,
    MetricDeviation,
};
use crate::domain::ports::store::{Query, SearchRequest, Store};
use crate::infrastructure::config::SentinelConfig;
use crate::services::bus::{AgentBus, AgentHandler};
use crate::services::concurrency::partial_race;
use crate::services::tools::ToolRegistry;

const CURRENT_METRICS_TOOL: &str = "current-metrics";
const DEPENDENCY_TOOL: &str = "dependency-trace";
const RECENT_CHANGES_TOOL: &str = "recent-changes";
const TIER_TOOL: &str = "asset-criticality";

/// Metrics the query returns pre-normalized (`<name>_z` columns).
const INLINE_NORMALIZED: [&str; 2] = ["latency", "error_rate"];
/// Metrics normalized locally against the stored baseline.
const LOCALLY_NORMALIZED: [&str; 3] = ["cpu", "memory", "throughput"];

/// Forward timeout for anomaly reports; the coordinator may run a full
/// response flow, so delivery is detached from the monitoring pass.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default)]
struct Baseline {
    avg: f64,
    stddev: f64,
}

pub struct SentinelAgent {
    tools: Arc<ToolRegistry>,
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
    config: SentinelConfig,
}

impl SentinelAgent {
    pub fn new(
        tools: Arc<ToolRegistry>,
        store: Arc<dyn Store>,
        bus: Arc<AgentBus>,
        config: SentinelConfig,
    ) -> Self {
        Self {
            tools,
            store,
            bus,
            config,
        }
    }

    /// Services with stored baselines, with their per-metric stats.
    async fn load_baselines(&self) -> HashMap<String, HashMap<String, Baseline>> {
        let request = SearchRequest::new(indices::BASELINES, Query::MatchAll).with_size(500);
        let hits = match self.store.search(request).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "baseline load failed");
                return HashMap::new();
            }
        };
        let mut out = HashMap::new();
        for hit in hits {
            let Some(service) = hit.source["service.name"].as_str() else {
                continue;
            };
            let mut metrics = HashMap::new();
            if let Some(obj) = hit.source["metrics"].as_object() {
                for (metric, stats) in obj {
                    metrics.insert(
                        metric.clone(),
                        Baseline {
                            avg: stats["avg"].as_f64().unwrap_or(0.0),
                            stddev: stats["stddev"].as_f64().unwrap_or(0.0),
                        },
                    );
                }
            }
            out.insert(service.to_string(), metrics);
        }
        out
    }

    /// Current metric values and z-scores for one service.
    async fn service_deviations(
        &self,
        service: &str,
        baselines: &HashMap<String, Baseline>,
    ) -> Result<Vec<MetricDeviation>, AgentError> {
        let mut params = Map::new();
        params.insert("service".to_string(), json!(service));
        let output = self.tools.execute(CURRENT_METRICS_TOOL, &params).await?;
        let Some(result) = output.esql() else {
            return Ok(Vec::new());
        };
        if result.is_empty() {
            return Ok(Vec::new());
        }

        let mut deviations = Vec::new();
        for metric in INLINE_NORMALIZED {
            let z = result
                .value(0, &format!("{metric}_z"))
                .and_then(Value::as_f64);
            let current = result.value(0, metric).and_then(Value::as_f64);
            if let (Some(z), Some(current)) = (z, current) {
                let baseline = baselines.get(metric).cloned().unwrap_or_default();
                deviations.push(MetricDeviation {
                    metric: metric.to_string(),
                    current,
                    baseline_avg: baseline.avg,
                    baseline_stddev: baseline.stddev,
                    z_score: z,
                });
            }
        }
        for metric in LOCALLY_NORMALIZED {
            let Some(current) = result.value(0, metric).and_then(Value::as_f64) else {
                continue;
            };
            let baseline = baselines.get(metric).cloned().unwrap_or_default();
            let z = (current - baseline.avg) / baseline.stddev.max(1.0);
            deviations.push(MetricDeviation {
                metric: metric.to_string(),
                current,
                baseline_avg: baseline.avg,
                baseline_stddev: baseline.stddev,
                z_score: z,
            });
        }
        Ok(deviations)
    }

    fn is_anomalous(&self, deviations: &[MetricDeviation]) -> bool {
        deviations
            .iter()
            .any(|d| d.z_score.abs() > self.config.anomaly_stddev_threshold)
    }

    /// Root-cause vs victim classification from the dependency trace.
    async fn classify(&self, service: &str, anomalous: &BTreeSet<String>) -> AnomalyRole {
        let mut params = Map::new();
        params.insert("service".to_string(), json!(service));
        let output = match self.tools.execute(DEPENDENCY_TOOL, &params).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(service, error = %e, "dependency trace unavailable");
                return AnomalyRole::RootCause;
            }
        };
        let rows = output.esql().map(|r| r.as_objects()).unwrap_or_default();
        let failing: Vec<&str> = rows
            .iter()
            .filter(|r| r.get("failing").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|r| r.get("downstream").and_then(Value::as_str))
            .collect();
        if failing.is_empty() {
            return AnomalyRole::RootCause;
        }
        if failing.iter().any(|d| anomalous.contains(*d)) {
            AnomalyRole::Victim
        } else {
            AnomalyRole::RootCauseBadOutbound
        }
    }

    /// Most recent change within 30 minutes, banded 5/15/30.
    async fn recent_change(&self, service: &str, now: DateTime<Utc>) -> Option<ChangeCorrelation> {
        let mut params = Map::new();
        params.insert("service".to_string(), json!(service));
        let output = self.tools.execute(RECENT_CHANGES_TOOL, &params).await.ok()?;
        let result = output.esql()?;
        let mut best: Option<(i64, ChangeCorrelation)> = None;
        for row in result.as_objects() {
            let Some(at) = row
                .get("@timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            else {
                continue;
            };
            let at = at.with_timezone(&Utc);
            let age_minutes = (now - at).num_minutes();
            if !(0..30).contains(&age_minutes) {
                continue;
            }
            let confidence = if age_minutes < 5 {
                ConfidenceBand::High
            } else if age_minutes < 15 {
                ConfidenceBand::Medium
            } else {
                ConfidenceBand::Low
            };
            let correlation = ChangeCorrelation {
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
                gap_seconds: (now - at).num_seconds(),
                confidence,
            };
            if best.as_ref().is_none_or(|(age, _)| age_minutes < *age) {
                best = Some((age_minutes, correlation));
            }
        }
        best.map(|(_, c)| c)
    }

    async fn lookup_tier(&self, service: &str) -> Option<u32> {
        let mut params = Map::new();
        params.insert("query".to_string(), json!(service));
        let output = self.tools.execute(TIER_TOOL, &params).await.ok()?;
        output
            .hits()?
            .first()?
            .get("tier")
            .and_then(Value::as_u64)
            .map(|t| t as u32)
    }

    /// Full monitoring pass over every baselined service.
    pub async fn monitor_health(&self) -> Vec<AnomalyReport> {
        let deadline = Duration::from_millis(self.config.monitoring_deadline_ms);
        let baselines = self.load_baselines().await;
        let services: Vec<String> = baselines.keys().cloned().collect();
        tracing::info!(services = services.len(), "sentinel monitoring pass");

        // Stage one: deviations per service, racing the pipeline deadline.
        let tasks: Vec<_> = services
            .iter()
            .map(|service| {
                let this = self.clone_refs();
                let service = service.clone();
                let service_baselines = baselines.get(&service).cloned().unwrap_or_default();
                (
                    service.clone(),
                    async move {
                        this.service_deviations(&service, &service_baselines).await
                    }
                    .boxed(),
                )
            })
            .collect();
        let settled = partial_race(deadline, tasks).await;

        let mut deviations_by_service: BTreeMap<String, Vec<MetricDeviation>> = BTreeMap::new();
        for (service, outcome) in settled {
            match outcome.into_value() {
                Some(deviations) => {
                    deviations_by_service.insert(service, deviations);
                }
                None => tracing::warn!(service = %service, "metrics fetch did not settle"),
            }
        }
        let anomalous: BTreeSet<String> = deviations_by_service
            .iter()
            .filter(|(_, d)| self.is_anomalous(d))
            .map(|(s, _)| s.clone())
            .collect();

        // Stage two: enrich each anomaly in parallel.
        let now = Utc::now();
        let enrich_tasks: Vec<_> = anomalous
            .iter()
            .map(|service| {
                let this = self.clone_refs();
                let service = service.clone();
                let anomalous = anomalous.clone();
                let deviations = deviations_by_service
                    .get(&service)
                    .cloned()
                    .unwrap_or_default();
                (
                    service.clone(),
                    async move {
                        let (role, change, tier) = tokio::join!(
                            this.classify(&service, &anomalous),
                            this.recent_change(&service, now),
                            this.lookup_tier(&service),
                        );
                        Ok::<AnomalyReport, AgentError>(AnomalyReport {
                            anomaly_id: format!("ANOM-{}", short_slug(8)),
                            service,
                            deviations,
                            role,
                            tier,
                            recent_change: change,
                            detected_at: now,
                        })
                    }
                    .boxed(),
                )
            })
            .collect();
        let enriched = partial_race(deadline, enrich_tasks).await;

        let reports: Vec<AnomalyReport> = enriched
            .into_iter()
            .filter_map(|(_, outcome)| outcome.into_value())
            .collect();

        for report in &reports {
            self.forward(report);
        }
        reports
    }

    /// Forward one anomaly to the coordinator, detached: the response flow
    /// may run for minutes and must not block monitoring.
    fn forward(&self, report: &AnomalyReport) {
        let bus = Arc::clone(&self.bus);
        let envelope = Envelope::request(
            agents::SENTINEL,
            agents::COORDINATOR,
            json!({"task": "operational_anomaly", "anomaly": report}),
        );
        let service = report.service.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.send(&envelope, FORWARD_TIMEOUT).await {
                tracing::warn!(service = %service, error = %e, "anomaly forward failed");
            }
        });
    }

    /// Health metrics for one service, consumed by the Verifier.
    pub async fn health_metrics(&self, service: &str) -> Result<Value, AgentError> {
        let baselines = self.load_baselines().await;
        let service_baselines = baselines.get(service).cloned().unwrap_or_default();
        let deviations = self.service_deviations(service, &service_baselines).await?;

        let mut metrics = Map::new();
        let mut z_scores = Map::new();
        for d in &deviations {
            metrics.insert(d.metric.clone(), json!(d.current));
            z_scores.insert(d.metric.clone(), json!(d.z_score));
        }
        // Availability derived from the error rate when present.
        if let Some(error_rate) = deviations
            .iter()
            .find(|d| d.metric == "error_rate")
            .map(|d| d.current)
        {
            metrics.insert("availability".to_string(), json!(1.0 - error_rate));
        }
        Ok(json!({
            "service": service,
            "metrics": metrics,
            "z_scores": z_scores,
            "healthy": !self.is_anomalous(&deviations),
        }))
    }

    fn clone_refs(&self) -> SentinelAgent {
        SentinelAgent {
            tools: Arc::clone(&self.tools),
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }
}

#[async_trait]
impl AgentHandler for SentinelAgent {
    async fn handle(&self, payload: Value) -> Result<Value, AgentError> {
        match payload["task"].as_str() {
            Some("monitor_health") => {
                let reports = self.monitor_health().await;
                let count = reports.len();
                Ok(json!({
                    "anomalies": reports,
                    "anomaly_count": count,
                }))
            }
            Some("get_health_metrics") => {
                let service = payload["service"]
                    .as_str()
                    .ok_or_else(|| AgentError::Invalid("service is required".to_string()))?;
                self.health_metrics(service).await
            }
            other => Err(AgentError::Invalid(format!(
                "unknown sentinel task: {other:?}"
            ))),
        }
    }
}
