use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state for a fragile source's primary fetch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Cooldown after a hard block before the primary path is tried again.
    pub reset_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            reset_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitInner {
    opened_at: Option<Instant>,
    reason: Option<String>,
}

/// Thread-safe circuit breaker tripped by hard-block signals.
///
/// There is no half-open state. Once `reset_after` has elapsed the next
/// check closes the breaker and the caller makes a normal, unguarded attempt.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Closes an expired breaker as a side effect.
    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        let Some(opened_at) = inner.opened_at else {
            return true;
        };

        if now.saturating_duration_since(opened_at) >= self.config.reset_after {
            inner.opened_at = None;
            inner.reason = None;
            info!(source = %self.name, "circuit cooldown elapsed, closing");
            true
        } else {
            false
        }
    }

    pub fn trip(&self, reason: impl Into<String>) {
        self.trip_at(Instant::now(), reason);
    }

    pub fn trip_at(&self, now: Instant, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            source = %self.name,
            reset_after_secs = self.config.reset_after.as_secs(),
            reason = %reason,
            "hard block detected, opening circuit"
        );
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.opened_at = Some(now);
        inner.reason = Some(reason);
    }

    pub fn record_success(&self) {
        self.reset();
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// Read-only view; unlike [`allow_request_at`](Self::allow_request_at) it never mutates.
    pub fn state_at(&self, now: Instant) -> CircuitState {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) < self.config.reset_after => {
                CircuitState::Open
            }
            _ => CircuitState::Closed,
        }
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .opened_at
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .reason
            .clone()
    }

    pub fn reset(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.opened_at = None;
        inner.reason = None;
    }
}
