//! Concurrency primitives shared by every agent.
//!
//! Four building blocks: deadline racing, retry with exponential backoff,
//! bounded-concurrency parallel execution, and the partial-result race that
//! lets workers keep whatever finished before a deadline fired.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;

/// A deadline fired before the raced operation settled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Race a future against a deadline. The timer is released on every exit
/// path; on expiry the future is dropped, which cancels in-flight I/O at
/// its next suspension point.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, DeadlineExceeded>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| DeadlineExceeded(deadline))
}

/// Retry policy: `base * 2^attempt + uniform jitter up to base` between
/// attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    /// Backoff duration before retrying `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = if self.base.as_millis() == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.base.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` until it succeeds, the error is classified non-retryable, or
/// retries are exhausted. The original error is surfaced unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let backoff = policy.backoff(attempt);
                tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Per-task outcome of a parallel settle-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(String),
}

impl<T> Settled<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fulfilled(v) => Some(v),
            Self::Rejected(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Fulfilled(v) => Some(v),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&str> {
        match self {
            Self::Fulfilled(_) => None,
            Self::Rejected(reason) => Some(reason),
        }
    }

    fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Fulfilled(v),
            Err(e) => Self::Rejected(e.to_string()),
        }
    }
}

/// Run `tasks` with at most `limit` in flight at any time. Results are
/// returned per input index, in input order, as settled slots.
pub async fn bounded_parallel<T, E, F>(limit: usize, tasks: Vec<F>) -> Vec<Settled<T>>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let count = tasks.len();
    let settled: Vec<(usize, Settled<T>)> = stream::iter(
        tasks
            .into_iter()
            .enumerate()
            .map(|(i, fut)| async move { (i, Settled::from_result(fut.await)) }),
    )
    .buffer_unordered(limit.max(1))
    .collect()
    .await;

    let mut slots: Vec<Option<Settled<T>>> = (0..count).map(|_| None).collect();
    for (i, outcome) in settled {
        slots[i] = Some(outcome);
    }
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Settled::Rejected("task vanished".to_string())))
        .collect()
}

/// Reason recorded in slots whose task missed the deadline.
pub const DEADLINE_REASON: &str = "deadline exceeded";

/// Run labeled tasks in parallel against one deadline. Each task settles
/// into its own slot as it completes; when the deadline fires, pending
/// slots are marked rejected while completed slots keep their values.
/// Unfinished tasks are detached, not aborted: background fire-and-forget
/// writes may still land without unwinding the caller.
pub async fn partial_race<T, E>(
    deadline: Duration,
    tasks: Vec<(String, BoxFuture<'static, Result<T, E>>)>,
) -> Vec<(String, Settled<T>)>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let count = tasks.len();
    let slots: Arc<Mutex<Vec<Option<Settled<T>>>>> =
        Arc::new(Mutex::new((0..count).map(|_| None).collect()));

    let mut labels = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);
    for (i, (label, fut)) in tasks.into_iter().enumerate() {
        labels.push(label);
        let slots = Arc::clone(&slots);
        handles.push(tokio::spawn(async move {
            let settled = Settled::from_result(fut.await);
            let mut guard = slots.lock().await;
            guard[i] = Some(settled);
        }));
    }

    // Join handles under the deadline; handles that miss it keep running
    // detached and fill their slot after we have already read it.
    let _ = tokio::time::timeout(deadline, futures::future::join_all(handles)).await;

    let mut guard = slots.lock().await;
    labels
        .into_iter()
        .zip(guard.iter_mut())
        .map(|(label, slot)| {
            let settled = slot
                .take()
                .unwrap_or_else(|| Settled::Rejected(DEADLINE_REASON.to_string()));
            (label, settled)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_deadline_passes_fast_future() {
        let result = with_deadline(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_fires() {
        let result = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        })
        .await;
        assert_eq!(result, Err(DeadlineExceeded(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            RetryPolicy::default(),
            |_| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("503".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_surfaces_non_retryable_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            RetryPolicy::default(),
            |_| false,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("400".to_string()) }
            },
        )
        .await;
        assert_eq!(result, Err("400".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_original_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            RetryPolicy::new(2, Duration::from_millis(10)),
            |_| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("502 bad gateway".to_string()) }
            },
        )
        .await;
        assert_eq!(result, Err("502 bad gateway".to_string()));
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_exponential_with_bounded_jitter() {
        let policy = RetryPolicy::new(2, Duration::from_millis(500));
        for attempt in 0..3 {
            let backoff = policy.backoff(attempt);
            let floor = Duration::from_millis(500 * 2u64.pow(attempt));
            let ceiling = floor + Duration::from_millis(500);
            assert!(backoff >= floor, "attempt {attempt}: {backoff:?} < {floor:?}");
            assert!(backoff < ceiling, "attempt {attempt}: {backoff:?} >= {ceiling:?}");
        }
    }

    #[tokio::test]
    async fn test_bounded_parallel_preserves_order_and_errors() {
        let tasks: Vec<_> = (0..5)
            .map(|i| async move {
                if i == 2 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i * 10)
                }
            })
            .collect();
        let results = bounded_parallel(2, tasks).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results[0], Settled::Fulfilled(0));
        assert_eq!(results[1], Settled::Fulfilled(10));
        assert_eq!(results[2], Settled::Rejected("task 2 failed".to_string()));
        assert_eq!(results[4], Settled::Fulfilled(40));
    }

    #[tokio::test]
    async fn test_bounded_parallel_respects_limit() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(())
                }
            })
            .collect();
        bounded_parallel(3, tasks).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_race_keeps_completed_slots() {
        let tasks: Vec<(String, BoxFuture<'static, Result<u32, String>>)> = vec![
            ("fast".to_string(), async { Ok(1) }.boxed()),
            (
                "slow".to_string(),
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(2)
                }
                .boxed(),
            ),
            ("failing".to_string(), async { Err("boom".to_string()) }.boxed()),
        ];
        let results = partial_race(Duration::from_millis(100), tasks).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "fast");
        assert_eq!(results[0].1, Settled::Fulfilled(1));
        assert_eq!(results[1].1, Settled::Rejected(DEADLINE_REASON.to_string()));
        assert_eq!(results[2].1, Settled::Rejected("boom".to_string()));
    }

    #[tokio::test]
    async fn test_partial_race_all_complete_before_deadline() {
        let tasks: Vec<(String, BoxFuture<'static, Result<u32, String>>)> = (0..4)
            .map(|i| (format!("t{i}"), async move { Ok(i) }.boxed()))
            .collect();
        let results = partial_race(Duration::from_secs(5), tasks).await;
        assert!(results.iter().all(|(_, s)| s.is_fulfilled()));
    }
}
