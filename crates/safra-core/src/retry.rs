//! Retry with exponential backoff.
//!
//! [`RetryExecutor`] runs one operation against one source up to
//! `max_attempts` times. A caller-supplied predicate decides which failures
//! are worth another attempt; everything else propagates immediately. Retries
//! never cross source boundaries, the orchestrator wraps each source in its
//! own executor run.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::FetchError;

/// HTTP statuses treated as transient regardless of how the failure surfaced.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub fn should_retry_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `min(base * factor^retry, max)`, optionally with +/- 50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if jitter {
                    let spread = delay.as_millis() as u64 / 2;
                    let offset = fastrand::u64(0..=spread * 2);
                    let total = (delay.as_millis() as u64 + offset).saturating_sub(spread);
                    Duration::from_millis(total)
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: Backoff::Exponential {
                base: Duration::try_from_secs_f64(settings.base_delay_secs).unwrap_or_default(),
                factor: settings.exponential_base,
                max: Duration::try_from_secs_f64(settings.max_delay_secs).unwrap_or_default(),
                jitter: false,
            },
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt.saturating_sub(1))
    }
}

/// Retry tallies per source, shared through [`ResilienceState`](crate::ResilienceState).
#[derive(Debug, Default)]
pub struct RetryCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl RetryCounters {
    pub fn record(&self, label: &str) {
        let mut counts = self
            .counts
            .lock()
            .expect("retry counters should not be poisoned");
        *counts.entry(label.to_owned()).or_default() += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counts
            .lock()
            .expect("retry counters should not be poisoned")
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts
            .lock()
            .expect("retry counters should not be poisoned")
            .values()
            .sum()
    }

    pub fn reset(&self) {
        self.counts
            .lock()
            .expect("retry counters should not be poisoned")
            .clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    counters: Option<Arc<RetryCounters>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: None,
        }
    }

    pub fn with_counters(mut self, counters: Arc<RetryCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. The last error is returned on exhaustion.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if attempt < max_attempts && is_retryable(&error) => {
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    if let Some(counters) = &self.counters {
                        counters.record(label);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// [`run`](Self::run) with [`FetchError::is_retryable`] as the predicate.
    pub async fn run_fetch<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.run(label, operation, |error: &FetchError| error.is_retryable())
            .await
    }
}

/// Shorthand for a one-off executor run without counters.
pub async fn retry<T, E, F, Fut, P>(config: RetryConfig, operation: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    RetryExecutor::new(config)
        .run("retry", operation, is_retryable)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(5));
        assert_eq!(backoff.delay(60), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_half_of_the_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(400),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: true,
        };

        for _ in 0..20 {
            let delay = backoff.delay(0).as_millis();
            assert!((200..=600).contains(&delay), "delay_ms={delay}");
        }
    }

    #[test]
    fn attempt_numbers_are_one_based() {
        let config = RetryConfig::from_settings(&RetrySettings::default());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
    }

    #[test]
    fn transient_statuses() {
        for status in RETRYABLE_STATUSES {
            assert!(should_retry_status(status));
        }
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(403));
        assert!(!should_retry_status(404));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryConfig::from_settings(&RetrySettings::default()));
        let started = Instant::now();

        let result = executor
            .run_fetch("ibge", |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(FetchError::network("connection reset"))
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryConfig::fixed(Duration::from_secs(1), 5));

        let result: Result<(), _> = executor
            .run_fetch("cepea", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::parse("unexpected sheet layout")) }
            })
            .await;

        assert_eq!(result, Err(FetchError::parse("unexpected sheet layout")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_and_counts_retries() {
        let counters = Arc::new(RetryCounters::default());
        let executor = RetryExecutor::new(RetryConfig::fixed(Duration::from_millis(10), 3))
            .with_counters(Arc::clone(&counters));

        let result: Result<(), _> = executor
            .run_fetch("conab", |attempt| async move {
                Err(FetchError::network(format!("attempt {attempt}")))
            })
            .await;

        assert_eq!(result, Err(FetchError::network("attempt 3")));
        assert_eq!(counters.get("conab"), 2);
        assert_eq!(counters.total(), 2);

        counters.reset();
        assert_eq!(counters.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn free_function_uses_custom_predicate() {
        let result: Result<u8, String> = retry(
            RetryConfig::fixed(Duration::from_millis(1), 4),
            |attempt| async move {
                if attempt < 4 {
                    Err(String::from("busy"))
                } else {
                    Ok(7)
                }
            },
            |error: &String| error == "busy",
        )
        .await;
        assert_eq!(result, Ok(7));
    }
}
