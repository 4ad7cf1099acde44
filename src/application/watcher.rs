//! Alert watcher: single-writer polling loop over the alerts index.
//!
//! Each poll reads the newest unclaimed alerts, claims each with a
//! create-only write (the claim contract: first writer wins), and hands
//! claimed alerts to the processor. Consecutive poll failures back off
//! exponentially and eventually trip a circuit breaker that stops the
//! watcher until an explicit restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::coordinator::{Coordinator, CoordinatorResponse};
use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::indices;
use crate::domain::models::{Alert, AlertClaim};
use crate::domain::ports::store::{ConcurrencyToken, Query, Refresh, SearchRequest, Sort, Store};
use crate::infrastructure::config::WatcherConfig;

/// Consumes claimed alerts. The Coordinator is the production processor.
#[async_trait]
pub trait AlertProcessor: Send + Sync {
    async fn process(&self, alert: Alert) -> CoordinatorResponse;
}

#[async_trait]
impl AlertProcessor for Coordinator {
    async fn process(&self, alert: Alert) -> CoordinatorResponse {
        self.handle_security_alert(alert).await
    }
}

/// Per-poll telemetry counters.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub polled: usize,
    pub claimed: usize,
    pub already_claimed: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

pub struct AlertWatcher {
    store: Arc<dyn Store>,
    processor: Arc<dyn AlertProcessor>,
    config: WatcherConfig,
    stop_tx: watch::Sender<bool>,
}

impl AlertWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        processor: Arc<dyn AlertProcessor>,
        config: WatcherConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            processor,
            config,
            stop_tx,
        }
    }

    /// Start the polling loop. The returned handle completes when the
    /// watcher stops, either by request or by the circuit breaker.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        // A fresh start clears a previous stop request.
        let _ = self.stop_tx.send(false);
        tokio::spawn(async move { self.run().await })
    }

    /// Request a stop. The in-flight poll completes; no new poll is
    /// scheduled.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut consecutive_failures = 0u32;

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "alert watcher started"
        );
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let delay = match self.poll_once().await {
                Ok(stats) => {
                    consecutive_failures = 0;
                    backoff = Duration::from_millis(self.config.initial_backoff_ms);
                    self.emit_telemetry(&stats).await;
                    poll_interval
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        consecutive_failures,
                        error = %e,
                        "alert poll failed"
                    );
                    if consecutive_failures >= self.config.max_poll_errors {
                        tracing::error!(
                            consecutive_failures,
                            "watcher circuit breaker open, stopping; restart required"
                        );
                        break;
                    }
                    let delay = backoff;
                    backoff = (backoff * 2).min(max_backoff);
                    delay
                }
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("alert watcher stopped");
    }

    /// One poll: newest alerts, claim, process.
    pub async fn poll_once(&self) -> StoreResult<PollStats> {
        let started = tokio::time::Instant::now();
        let mut stats = PollStats::default();

        let request = SearchRequest::new(indices::ALERTS_DEFAULT, Query::MatchAll)
            .with_size(self.config.batch_size)
            .with_sort(Sort::desc("@timestamp"));
        let hits = self.store.search(request).await?;
        stats.polled = hits.len();

        for hit in hits {
            let alert: Alert = match serde_json::from_value(hit.source.clone()) {
                Ok(alert) => alert,
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(doc_id = %hit.id, error = %e, "malformed alert skipped");
                    continue;
                }
            };

            // Cheap exclusion before the authoritative claim write.
            if self
                .store
                .get(indices::ALERT_CLAIMS, &alert.alert_id)
                .await
                .is_ok()
            {
                stats.already_claimed += 1;
                continue;
            }

            let claim = AlertClaim::new(&alert.alert_id);
            let claim_doc = match serde_json::to_value(&claim) {
                Ok(doc) => doc,
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(alert_id = %alert.alert_id, error = %e, "claim serialization failed");
                    continue;
                }
            };
            match self
                .store
                .create(indices::ALERT_CLAIMS, &alert.alert_id, claim_doc, Refresh::WaitFor)
                .await
            {
                Ok(()) => {
                    stats.claimed += 1;
                    let alert_id = alert.alert_id.clone();
                    let response = self.processor.process(alert).await;
                    tracing::info!(
                        alert_id = %alert_id,
                        incident_id = %response.incident_id,
                        outcome = %response.status,
                        "alert processed"
                    );
                    self.mark_processed(&alert_id).await;
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    // Another watcher won the claim.
                    stats.already_claimed += 1;
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(alert_id = %alert.alert_id, error = %e, "claim write failed");
                }
            }
        }

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            polled = stats.polled,
            claimed = stats.claimed,
            already_claimed = stats.already_claimed,
            errors = stats.errors,
            elapsed_ms = stats.elapsed_ms,
            "poll complete"
        );
        Ok(stats)
    }

    async fn mark_processed(&self, alert_id: &str) {
        let versioned = match self.store.get(indices::ALERT_CLAIMS, alert_id).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(alert_id, error = %e, "claim re-read failed");
                return;
            }
        };
        let token = ConcurrencyToken {
            seq_no: versioned.seq_no,
            primary_term: versioned.primary_term,
        };
        if let Err(e) = self
            .store
            .update(
                indices::ALERT_CLAIMS,
                alert_id,
                json!({"processed_at": Utc::now()}),
                token,
                Refresh::None,
            )
            .await
        {
            tracing::warn!(alert_id, error = %e, "claim processed-at update failed");
        }
    }

    /// Telemetry failures are logged only.
    async fn emit_telemetry(&self, stats: &PollStats) {
        let doc = json!({
            "component": "alert-watcher",
            "polled": stats.polled,
            "claimed": stats.claimed,
            "already_claimed": stats.already_claimed,
            "errors": stats.errors,
            "elapsed_ms": stats.elapsed_ms,
            "@timestamp": Utc::now(),
        });
        if let Err(e) = self
            .store
            .index(indices::AGENT_TELEMETRY, None, doc, Refresh::None)
            .await
        {
            tracing::debug!(error = %e, "telemetry write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Severity;
    use crate::infrastructure::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct RecordingProcessor {
        seen: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl RecordingProcessor {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AlertProcessor for RecordingProcessor {
        async fn process(&self, alert: Alert) -> CoordinatorResponse {
            self.seen.lock().await.push(alert.alert_id.clone());
            self.count.fetch_add(1, Ordering::SeqCst);
            CoordinatorResponse {
                incident_id: format!("INC-2026-{}", alert.alert_id),
                status: "resolved".to_string(),
                reason: None,
            }
        }
    }

    async fn seed_alert(store: &MemoryStore, id: &str, ts: &str) {
        store
            .index(
                indices::ALERTS_DEFAULT,
                Some(id),
                json!({
                    "alert_id": id,
                    "rule_id": "sec-brute-force",
                    "severity_original": Severity::High,
                    "@timestamp": ts
                }),
                Refresh::None,
            )
            .await
            .unwrap();
    }

    fn watcher(
        store: Arc<MemoryStore>,
        processor: Arc<RecordingProcessor>,
        config: WatcherConfig,
    ) -> Arc<AlertWatcher> {
        Arc::new(AlertWatcher::new(
            store as Arc<dyn Store>,
            processor as Arc<dyn AlertProcessor>,
            config,
        ))
    }

    #[tokio::test]
    async fn test_poll_claims_and_processes_new_alerts() {
        let store = Arc::new(MemoryStore::new());
        seed_alert(&store, "A-001", "2026-01-01T00:00:01Z").await;
        seed_alert(&store, "A-002", "2026-01-01T00:00:02Z").await;
        let processor = Arc::new(RecordingProcessor::new());
        let watcher = watcher(Arc::clone(&store), Arc::clone(&processor), WatcherConfig::default());

        let stats = watcher.poll_once().await.unwrap();
        assert_eq!(stats.polled, 2);
        assert_eq!(stats.claimed, 2);
        assert_eq!(processor.count.load(Ordering::SeqCst), 2);
        assert_eq!(store.count(indices::ALERT_CLAIMS).await, 2);

        // Claims carry processed_at after processing.
        let claims = store.all_docs(indices::ALERT_CLAIMS).await;
        assert!(claims.iter().all(|c| c["processed_at"].is_string()));
        // Telemetry row per poll.
        assert_eq!(store.count(indices::AGENT_TELEMETRY).await, 1);
    }

    #[tokio::test]
    async fn test_second_poll_skips_claimed_alerts() {
        let store = Arc::new(MemoryStore::new());
        seed_alert(&store, "A-001", "2026-01-01T00:00:01Z").await;
        let processor = Arc::new(RecordingProcessor::new());
        let watcher = watcher(Arc::clone(&store), Arc::clone(&processor), WatcherConfig::default());

        watcher.poll_once().await.unwrap();
        let stats = watcher.poll_once().await.unwrap();
        assert_eq!(stats.claimed, 0);
        assert_eq!(stats.already_claimed, 1);
        assert_eq!(processor.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_competing_watchers_share_nothing() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..6 {
            seed_alert(&store, &format!("A-{i:03}"), &format!("2026-01-01T00:00:0{i}Z")).await;
        }
        let p1 = Arc::new(RecordingProcessor::new());
        let p2 = Arc::new(RecordingProcessor::new());
        let w1 = watcher(Arc::clone(&store), Arc::clone(&p1), WatcherConfig::default());
        let w2 = watcher(Arc::clone(&store), Arc::clone(&p2), WatcherConfig::default());

        let (r1, r2) = tokio::join!(w1.poll_once(), w2.poll_once());
        r1.unwrap();
        r2.unwrap();

        let mut all: Vec<String> = p1.seen.lock().await.clone();
        all.extend(p2.seen.lock().await.clone());
        all.sort();
        let before = all.len();
        all.dedup();
        // No alert processed by both watchers.
        assert_eq!(before, all.len());
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn test_batch_size_limits_poll() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..15 {
            seed_alert(&store, &format!("A-{i:03}"), &format!("2026-01-01T00:00:{i:02}Z")).await;
        }
        let processor = Arc::new(RecordingProcessor::new());
        let config = WatcherConfig {
            batch_size: 10,
            ..Default::default()
        };
        let watcher = watcher(Arc::clone(&store), Arc::clone(&processor), config);
        let stats = watcher.poll_once().await.unwrap();
        assert_eq!(stats.polled, 10);
        // Newest first.
        assert!(processor.seen.lock().await.contains(&"A-014".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_loop_stops_on_request() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(RecordingProcessor::new());
        let config = WatcherConfig {
            poll_interval_ms: 50,
            ..Default::default()
        };
        let watcher = watcher(Arc::clone(&store), processor, config);
        let handle = Arc::clone(&watcher).start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_stops_after_consecutive_failures() {
        // An empty store errors on nothing, so point the watcher at a store
        // whose search always fails.
        struct FailingStore(MemoryStore);
        #[async_trait]
        impl Store for FailingStore {
            async fn get(
                &self,
                index: &str,
                id: &str,
            ) -> StoreResult<crate::domain::ports::store::Versioned<serde_json::Value>> {
                self.0.get(index, id).await
            }
            async fn create(
                &self,
                index: &str,
                id: &str,
                doc: serde_json::Value,
                refresh: Refresh,
            ) -> StoreResult<()> {
                self.0.create(index, id, doc, refresh).await
            }
            async fn update(
                &self,
                index: &str,
                id: &str,
                patch: serde_json::Value,
                token: ConcurrencyToken,
                refresh: Refresh,
            ) -> StoreResult<()> {
                self.0.update(index, id, patch, token, refresh).await
            }
            async fn index(
                &self,
                index: &str,
                id: Option<&str>,
                doc: serde_json::Value,
                refresh: Refresh,
            ) -> StoreResult<String> {
                self.0.index(index, id, doc, refresh).await
            }
            async fn search(
                &self,
                _request: SearchRequest,
            ) -> StoreResult<Vec<crate::domain::ports::store::SearchHit>> {
                Err(StoreError::Transport {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }
            async fn update_by_query(
                &self,
                index: &str,
                query: Query,
                patch: serde_json::Value,
            ) -> StoreResult<u64> {
                self.0.update_by_query(index, query, patch).await
            }
            async fn bulk(
                &self,
                ops: Vec<crate::domain::ports::store::BulkOp>,
            ) -> StoreResult<()> {
                self.0.bulk(ops).await
            }
            async fn esql(
                &self,
                query: &str,
                params: Vec<crate::domain::ports::store::EsqlParam>,
            ) -> StoreResult<crate::domain::ports::store::EsqlResult> {
                self.0.esql(query, params).await
            }
        }

        let store: Arc<dyn Store> = Arc::new(FailingStore(MemoryStore::new()));
        let processor = Arc::new(RecordingProcessor::new());
        let config = WatcherConfig {
            poll_interval_ms: 50,
            max_poll_errors: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 400,
            ..Default::default()
        };
        let watcher = Arc::new(AlertWatcher::new(
            store,
            processor as Arc<dyn AlertProcessor>,
            config,
        ));
        let handle = Arc::clone(&watcher).start();
        // Three failed polls trip the breaker without any stop request.
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("circuit breaker never tripped")
            .unwrap();
    }
}
