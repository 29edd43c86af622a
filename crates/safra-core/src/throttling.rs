use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitSettings;

type DirectRateLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type Gate = Arc<AsyncMutex<Option<Instant>>>;

/// Per-source request gate.
///
/// Each source key owns one async lock and the instant of its last release.
/// Callers for the same key are serialized and spaced by at least the key's
/// minimum interval; different keys never wait on each other. Sources may
/// additionally carry a governor quota for providers that publish a budget
/// such as "60 requests per minute".
pub struct RateLimiter {
    default_interval: Duration,
    intervals: HashMap<String, Duration>,
    quotas: HashMap<String, Arc<DirectRateLimiter>>,
    gates: Mutex<HashMap<String, Gate>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_interval", &self.default_interval)
            .field("intervals", &self.intervals)
            .field("quotas", &self.quotas.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_settings(&RateLimitSettings::default())
    }
}

/// Held for the duration of one request. Dropping it stamps the key's release time.
#[derive(Debug)]
pub struct RateLimitGuard {
    last_release: OwnedMutexGuard<Option<Instant>>,
}

impl Drop for RateLimitGuard {
    fn drop(&mut self) {
        *self.last_release = Some(Instant::now());
    }
}

impl RateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            intervals: HashMap::new(),
            quotas: HashMap::new(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        settings
            .intervals()
            .fold(Self::new(settings.default_interval()), |limiter, (key, interval)| {
                limiter.with_interval(key, interval)
            })
    }

    pub fn with_interval(mut self, source_key: impl Into<String>, interval: Duration) -> Self {
        self.intervals.insert(source_key.into(), interval);
        self
    }

    /// Add a request budget of `limit` calls per `window` on top of the minimum interval.
    pub fn with_quota(mut self, source_key: impl Into<String>, window: Duration, limit: u32) -> Self {
        if let Some(quota) = quota_from_window(window, limit) {
            self.quotas
                .insert(source_key.into(), Arc::new(DirectRateLimiter::direct(quota)));
        }
        self
    }

    pub fn interval_for(&self, source_key: &str) -> Duration {
        self.intervals
            .get(source_key)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Wait for the key's turn and return a guard that must live as long as the request.
    pub async fn acquire(&self, source_key: &str) -> RateLimitGuard {
        let gate = self.gate(source_key);
        let last_release = gate.lock_owned().await;

        if let Some(previous) = *last_release {
            let interval = self.interval_for(source_key);
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                debug!(
                    source = source_key,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit wait"
                );
                tokio::time::sleep(wait).await;
            }
        }

        if let Some(quota) = self.quotas.get(source_key) {
            quota.until_ready().await;
        }

        RateLimitGuard { last_release }
    }

    /// Forget every timing record and lock. Guards still alive keep their own lock.
    pub fn reset(&self) {
        self.gates
            .lock()
            .expect("rate limiter gate table should not be poisoned")
            .clear();
    }

    fn gate(&self, source_key: &str) -> Gate {
        let mut gates = self
            .gates
            .lock()
            .expect("rate limiter gate table should not be poisoned");
        Arc::clone(
            gates
                .entry(source_key.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        )
    }
}

fn quota_from_window(window: Duration, limit: u32) -> Option<Quota> {
    let burst = NonZeroU32::new(limit.max(1))?;
    let seconds_per_cell = (window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    Quota::with_period(Duration::from_secs_f64(seconds_per_cell)).map(|quota| quota.allow_burst(burst))
}
