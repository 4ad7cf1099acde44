//! Configuration loading and validation.
//!
//! Hierarchical merge: programmatic defaults, then `vigil.yaml`, then
//! `VIGIL_*` environment variables (highest priority, nested keys split on
//! `__`, e.g. `VIGIL_COORDINATOR__MAX_REFLECTION_LOOPS=5`).

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid threshold {field}: {value}. Must be within [0, 1]")]
    InvalidThreshold { field: &'static str, value: f64 },

    #[error("suppress_threshold ({suppress}) must be below investigate_threshold ({investigate})")]
    ThresholdOrder { suppress: f64, investigate: f64 },

    #[error("Triage weights must sum to 1.0, got {0}")]
    WeightSum(f64),

    #[error("Invalid {field}: {value}. Must be positive")]
    NonPositive { field: &'static str, value: u64 },

    #[error("max_reflection_loops must be at least 1")]
    ReflectionBound,

    #[error("Invalid backoff: initial_backoff_ms ({0}) must not exceed max_backoff_ms ({1})")]
    InvalidBackoff(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Alert watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Consecutive poll failures before the circuit breaker stops the
    /// watcher.
    #[serde(default = "default_watcher_max_poll_errors")]
    pub max_poll_errors: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_poll_interval_ms() -> u64 {
    5000
}
const fn default_batch_size() -> usize {
    10
}
const fn default_watcher_max_poll_errors() -> u32 {
    5
}
const fn default_initial_backoff_ms() -> u64 {
    1000
}
const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_poll_errors: default_watcher_max_poll_errors(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Coordinator orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoordinatorConfig {
    #[serde(default = "default_max_reflection_loops")]
    pub max_reflection_loops: u32,
    #[serde(default = "default_approval_timeout_minutes")]
    pub approval_timeout_minutes: u64,
    #[serde(default = "default_approval_poll_interval_ms")]
    pub approval_poll_interval_ms: u64,
}

const fn default_max_reflection_loops() -> u32 {
    3
}
const fn default_approval_timeout_minutes() -> u64 {
    15
}
const fn default_approval_poll_interval_ms() -> u64 {
    15_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_reflection_loops: default_max_reflection_loops(),
            approval_timeout_minutes: default_approval_timeout_minutes(),
            approval_poll_interval_ms: default_approval_poll_interval_ms(),
        }
    }
}

/// Named triage score weights. Must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriageWeights {
    #[serde(default = "default_weight_severity")]
    pub severity: f64,
    #[serde(default = "default_weight_asset_criticality")]
    pub asset_criticality: f64,
    #[serde(default = "default_weight_corroboration")]
    pub corroboration: f64,
    /// Weight of `1 - historical false-positive rate`.
    #[serde(default = "default_weight_false_positive")]
    pub false_positive: f64,
}

const fn default_weight_severity() -> f64 {
    0.4
}
const fn default_weight_asset_criticality() -> f64 {
    0.3
}
const fn default_weight_corroboration() -> f64 {
    0.2
}
const fn default_weight_false_positive() -> f64 {
    0.1
}

impl Default for TriageWeights {
    fn default() -> Self {
        Self {
            severity: default_weight_severity(),
            asset_criticality: default_weight_asset_criticality(),
            corroboration: default_weight_corroboration(),
            false_positive: default_weight_false_positive(),
        }
    }
}

impl TriageWeights {
    pub fn sum(&self) -> f64 {
        self.severity + self.asset_criticality + self.corroboration + self.false_positive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriageConfig {
    #[serde(default = "default_investigate_threshold")]
    pub investigate_threshold: f64,
    #[serde(default = "default_suppress_threshold")]
    pub suppress_threshold: f64,
    #[serde(default = "default_triage_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default)]
    pub weights: TriageWeights,
}

const fn default_investigate_threshold() -> f64 {
    0.7
}
const fn default_suppress_threshold() -> f64 {
    0.4
}
const fn default_triage_deadline_ms() -> u64 {
    5000
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            investigate_threshold: default_investigate_threshold(),
            suppress_threshold: default_suppress_threshold(),
            deadline_ms: default_triage_deadline_ms(),
            weights: TriageWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InvestigationConfig {
    #[serde(default = "default_investigation_deadline_ms")]
    pub deadline_ms: u64,
    /// Minimum events for an attack-chain window to count as populated.
    #[serde(default = "default_sparse_result_threshold")]
    pub sparse_result_threshold: usize,
    /// Maximum change-to-error gap considered a correlation.
    #[serde(default = "default_max_gap_seconds")]
    pub max_gap_seconds: i64,
    #[serde(default = "default_high_confidence_window_minutes")]
    pub high_confidence_window_minutes: i64,
}

const fn default_investigation_deadline_ms() -> u64 {
    55_000
}
const fn default_sparse_result_threshold() -> usize {
    3
}
const fn default_max_gap_seconds() -> i64 {
    900
}
const fn default_high_confidence_window_minutes() -> i64 {
    5
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_investigation_deadline_ms(),
            sparse_result_threshold: default_sparse_result_threshold(),
            max_gap_seconds: default_max_gap_seconds(),
            high_confidence_window_minutes: default_high_confidence_window_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SweepConfig {
    #[serde(default = "default_sweep_deadline_ms")]
    pub deadline_ms: u64,
}

const fn default_sweep_deadline_ms() -> u64 {
    45_000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_sweep_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlanningConfig {
    #[serde(default = "default_planning_deadline_ms")]
    pub deadline_ms: u64,
    /// Minimum composite score for a runbook to drive the plan.
    #[serde(default = "default_runbook_match_threshold")]
    pub runbook_match_threshold: f64,
    /// Concurrency limit for per-service impact assessment.
    #[serde(default = "default_impact_concurrency")]
    pub impact_concurrency: usize,
}

const fn default_planning_deadline_ms() -> u64 {
    40_000
}
const fn default_runbook_match_threshold() -> f64 {
    0.6
}
const fn default_impact_concurrency() -> usize {
    10
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_planning_deadline_ms(),
            runbook_match_threshold: default_runbook_match_threshold(),
            impact_concurrency: default_impact_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,
    #[serde(default = "default_approval_poll_interval_ms")]
    pub approval_poll_interval_ms: u64,
    #[serde(default = "default_approval_timeout_minutes")]
    pub approval_timeout_minutes: u64,
    /// Consecutive transient approval-poll errors tolerated per gate.
    #[serde(default = "default_executor_max_poll_errors")]
    pub max_poll_errors: u32,
}

const fn default_executor_deadline_ms() -> u64 {
    280_000
}
const fn default_workflow_timeout_ms() -> u64 {
    120_000
}
const fn default_executor_max_poll_errors() -> u32 {
    3
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_executor_deadline_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            approval_poll_interval_ms: default_approval_poll_interval_ms(),
            approval_timeout_minutes: default_approval_timeout_minutes(),
            max_poll_errors: default_executor_max_poll_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VerifierConfig {
    #[serde(default = "default_health_score_threshold")]
    pub health_score_threshold: f64,
}

const fn default_health_score_threshold() -> f64 {
    0.8
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            health_score_threshold: default_health_score_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SentinelConfig {
    #[serde(default = "default_monitoring_deadline_ms")]
    pub monitoring_deadline_ms: u64,
    #[serde(default = "default_anomaly_stddev_threshold")]
    pub anomaly_stddev_threshold: f64,
}

const fn default_monitoring_deadline_ms() -> u64 {
    120_000
}
const fn default_anomaly_stddev_threshold() -> f64 {
    2.0
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            monitoring_deadline_ms: default_monitoring_deadline_ms(),
            anomaly_stddev_threshold: default_anomaly_stddev_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnalystConfig {
    #[serde(default = "default_analyst_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_batch_deadline_ms")]
    pub batch_deadline_ms: u64,
    /// TTL of the per-incident dedup guard.
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
    /// Cron expression for the daily batch (5-field).
    #[serde(default = "default_batch_cron")]
    pub batch_cron: String,
}

const fn default_analyst_deadline_ms() -> u64 {
    120_000
}
const fn default_batch_deadline_ms() -> u64 {
    300_000
}
const fn default_dedup_ttl_seconds() -> u64 {
    60
}
fn default_batch_cron() -> String {
    "0 2 * * *".to_string()
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_analyst_deadline_ms(),
            batch_deadline_ms: default_batch_deadline_ms(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            batch_cron: default_batch_cron(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolsConfig {
    #[serde(default = "default_tools_dir")]
    pub dir: String,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tools_dir() -> String {
    "tools".to_string()
}
const fn default_tool_timeout_ms() -> u64 {
    10_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dir: default_tools_dir(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
}

const fn default_max_retries() -> u32 {
    2
}
const fn default_retry_base_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_ms: default_retry_base_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crate::services::concurrency::RetryPolicy {
        crate::services::concurrency::RetryPolicy::new(
            self.max_retries,
            std::time::Duration::from_millis(self.base_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level Vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VigilConfig {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub sentinel: SentinelConfig,
    #[serde(default)]
    pub analyst: AnalystConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration: defaults, `vigil.yaml`, then `VIGIL_*` env vars.
    pub fn load() -> Result<VigilConfig> {
        let config: VigilConfig = Figment::new()
            .merge(Serialized::defaults(VigilConfig::default()))
            .merge(Yaml::file("vigil.yaml"))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit file, still honoring defaults.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<VigilConfig> {
        let config: VigilConfig = Figment::new()
            .merge(Serialized::defaults(VigilConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &VigilConfig) -> Result<(), ConfigError> {
        for (field, value) in [
            ("investigate_threshold", config.triage.investigate_threshold),
            ("suppress_threshold", config.triage.suppress_threshold),
            ("health_score_threshold", config.verifier.health_score_threshold),
            ("runbook_match_threshold", config.planning.runbook_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { field, value });
            }
        }
        if config.triage.suppress_threshold >= config.triage.investigate_threshold {
            return Err(ConfigError::ThresholdOrder {
                suppress: config.triage.suppress_threshold,
                investigate: config.triage.investigate_threshold,
            });
        }
        if (config.triage.weights.sum() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::WeightSum(config.triage.weights.sum()));
        }
        if config.coordinator.max_reflection_loops == 0 {
            return Err(ConfigError::ReflectionBound);
        }
        for (field, value) in [
            ("watcher.poll_interval_ms", config.watcher.poll_interval_ms),
            ("watcher.batch_size", config.watcher.batch_size as u64),
            ("coordinator.approval_poll_interval_ms", config.coordinator.approval_poll_interval_ms),
            ("coordinator.approval_timeout_minutes", config.coordinator.approval_timeout_minutes),
            ("triage.deadline_ms", config.triage.deadline_ms),
            ("investigation.deadline_ms", config.investigation.deadline_ms),
            ("sweep.deadline_ms", config.sweep.deadline_ms),
            ("planning.deadline_ms", config.planning.deadline_ms),
            ("executor.deadline_ms", config.executor.deadline_ms),
            ("executor.workflow_timeout_ms", config.executor.workflow_timeout_ms),
            ("sentinel.monitoring_deadline_ms", config.sentinel.monitoring_deadline_ms),
            ("analyst.deadline_ms", config.analyst.deadline_ms),
            ("analyst.batch_deadline_ms", config.analyst.batch_deadline_ms),
            ("tools.timeout_ms", config.tools.timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive { field, value });
            }
        }
        if config.watcher.initial_backoff_ms > config.watcher.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.watcher.initial_backoff_ms,
                config.watcher.max_backoff_ms,
            ));
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        Ok(())
    }
}
