use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::metrics;

// The appview allows 3 000 requests per 5 minutes; keep a 100-token margin.
const RESERVOIR_SIZE: u32 = 2_900;
const RESERVOIR_REFILL: Duration = Duration::from_secs(300);

/// Baseline minimum gap between job starts. The adaptive throttle widens
/// this while the firehose runs hot.
pub const BASELINE_MIN_TIME: Duration = Duration::from_millis(110);

const MAX_RETRIES: u32 = 5;
const BACKOFF_SEED: Duration = Duration::from_millis(250);

struct SchedState {
    next_start: Instant,
    tokens: u32,
}

/// Global scheduler for outbound API calls: enforces a minimum gap between
/// job starts and a token reservoir matching the upstream request ceiling,
/// and owns the retry/backoff policy for failed jobs.
pub struct RateLimiter {
    min_time_ms: AtomicU64,
    state: Mutex<SchedState>,
    refill: Notify,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            min_time_ms: AtomicU64::new(BASELINE_MIN_TIME.as_millis() as u64),
            state: Mutex::new(SchedState {
                next_start: Instant::now(),
                tokens: RESERVOIR_SIZE,
            }),
            refill: Notify::new(),
        }
    }

    pub fn set_min_time(&self, min_time: Duration) {
        self.min_time_ms
            .store(min_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn min_time(&self) -> Duration {
        Duration::from_millis(self.min_time_ms.load(Ordering::Relaxed))
    }

    /// Periodically restores the reservoir; spawned once at startup.
    pub async fn run_refill(&self) {
        let mut interval = tokio::time::interval(RESERVOIR_REFILL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let mut state = self.state.lock().await;
            state.tokens = RESERVOIR_SIZE;
            drop(state);
            self.refill.notify_waiters();
        }
    }

    /// Run `job` under the limiter, retrying per the failure policy. The id
    /// tags log lines and the retry-budget error.
    pub async fn schedule<T, F, Fut>(&self, id: &str, job: F) -> Result<T, IndexerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut retries = 0u32;
        let mut backoff = BACKOFF_SEED;

        loop {
            self.acquire().await;
            metrics::API_REQUESTS.inc();

            let err = match job().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match next_delay(&err, &mut retries, &mut backoff) {
                Some(delay) => {
                    metrics::API_RETRIES.inc();
                    debug!(job = id, ?delay, "Rescheduling failed job: {}", err);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if err.is_retryable() && retries >= MAX_RETRIES {
                        warn!(job = id, "Dropping job after {} retries: {}", retries, err);
                        return Err(IndexerError::RetriesExhausted(id.to_string()));
                    }
                    // Non-retryable: drop immediately.
                    return Err(err);
                }
            }
        }
    }

    // Wait for a start slot: a reservoir token plus the min-time gap.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if state.tokens == 0 {
                    None
                } else {
                    state.tokens -= 1;
                    let now = Instant::now();
                    let wait = state.next_start.duration_since(now);
                    let start = now.max(state.next_start);
                    state.next_start = start + self.min_time();
                    Some(wait)
                }
            };

            match wait {
                Some(wait) => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    return;
                }
                // Reservoir drained; park until the next refill. Register
                // before re-checking so a refill can't slip past unseen.
                None => {
                    let mut notified = std::pin::pin!(self.refill.notified());
                    notified.as_mut().enable();
                    if self.state.lock().await.tokens == 0 {
                        notified.await;
                    }
                }
            }
        }
    }
}

/// Failure policy. Returns the delay before the next attempt, or `None`
/// when the job should be dropped.
///
/// A 429 carrying `ratelimit-remaining: 0` is not a defect in the job, just
/// the shared budget running dry: wait out the advertised reset without
/// touching the backoff state. Everything else retryable escalates through
/// 250, 707, 3674, 29393, 328633 ms before the job is dropped.
fn next_delay(err: &IndexerError, retries: &mut u32, backoff: &mut Duration) -> Option<Duration> {
    if let IndexerError::Api {
        status: 429,
        ratelimit_remaining: Some(remaining),
        ratelimit_reset: Some(reset),
        ..
    } = err
    {
        if remaining == "0" {
            let delay_ms = (reset * 1000 - Utc::now().timestamp_millis()).max(0);
            return Some(Duration::from_millis(delay_ms as u64));
        }
    }

    if !err.is_retryable() || *retries >= MAX_RETRIES {
        return None;
    }

    let delay = *backoff;
    *retries += 1;
    let factor = ((*retries + 1) as f64).powf(1.5);
    *backoff = Duration::from_millis((delay.as_millis() as f64 * factor) as u64);
    Some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn transient() -> IndexerError {
        IndexerError::Api {
            status: 503,
            message: "unavailable".to_string(),
            ratelimit_remaining: None,
            ratelimit_reset: None,
        }
    }

    #[test]
    fn backoff_sequence() {
        let err = transient();
        let mut retries = 0;
        let mut backoff = BACKOFF_SEED;
        let mut delays = Vec::new();
        while let Some(d) = next_delay(&err, &mut retries, &mut backoff) {
            delays.push(d.as_millis() as u64);
        }
        assert_eq!(delays, vec![250, 707, 3674, 29393, 328633]);
        assert_eq!(retries, MAX_RETRIES);
    }

    #[test]
    fn non_retryable_drops_immediately() {
        let err = IndexerError::Api {
            status: 400,
            message: "invalid".to_string(),
            ratelimit_remaining: None,
            ratelimit_reset: None,
        };
        let mut retries = 0;
        let mut backoff = BACKOFF_SEED;
        assert!(next_delay(&err, &mut retries, &mut backoff).is_none());
        assert_eq!(retries, 0);
    }

    #[test]
    fn honors_ratelimit_reset() {
        let reset = Utc::now().timestamp() + 12;
        let err = IndexerError::Api {
            status: 429,
            message: "rate limited".to_string(),
            ratelimit_remaining: Some("0".to_string()),
            ratelimit_reset: Some(reset),
        };
        let mut retries = 0;
        let mut backoff = BACKOFF_SEED;
        let delay = next_delay(&err, &mut retries, &mut backoff).unwrap();
        assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(12));
        // No escalation: the backoff state is untouched.
        assert_eq!(retries, 0);
        assert_eq!(backoff, BACKOFF_SEED);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_retries_until_success() {
        let limiter = RateLimiter::new();
        let attempts = AtomicU32::new(0);

        let result = limiter
            .schedule("test-job", || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_exhausts_retry_budget() {
        let limiter = RateLimiter::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .schedule("doomed-job", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(result, Err(IndexerError::RetriesExhausted(_))));
        // Initial attempt plus five retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn min_time_spaces_job_starts() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter
                .schedule("spaced", || async { Ok::<_, IndexerError>(()) })
                .await
                .unwrap();
        }
        // Three starts need two min-time gaps between them.
        assert!(start.elapsed() >= BASELINE_MIN_TIME * 2);
    }
}
