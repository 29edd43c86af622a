//! Process-wide resilience registries.
//!
//! Rate-limiter gates, circuit breakers and retry counters live in one
//! [`ResilienceState`], built once and shared by `Arc` with every component
//! that needs it. [`ResilienceState::reset`] restores a clean slate between tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::AcquisitionConfig;
use crate::retry::RetryCounters;
use crate::throttling::RateLimiter;

#[derive(Debug, Default)]
pub struct ResilienceState {
    rate_limiter: RateLimiter,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retry_counters: Arc<RetryCounters>,
}

impl ResilienceState {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            rate_limiter,
            breakers: Mutex::new(HashMap::new()),
            retry_counters: Arc::new(RetryCounters::default()),
        }
    }

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self::new(RateLimiter::from_settings(&config.rate_limit))
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry_counters(&self) -> Arc<RetryCounters> {
        Arc::clone(&self.retry_counters)
    }

    /// Give `source` a breaker. Registering twice keeps the existing one.
    pub fn register_breaker(
        &self,
        source: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let source = source.into();
        let mut breakers = self
            .breakers
            .lock()
            .expect("breaker registry should not be poisoned");
        Arc::clone(
            breakers
                .entry(source.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(source, config))),
        )
    }

    /// Breaker for `source`, if it is one of the fragile sources that has one.
    pub fn breaker(&self, source: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .expect("breaker registry should not be poisoned")
            .get(source)
            .cloned()
    }

    /// Clear timing records, close every breaker and zero the retry counters.
    pub fn reset(&self) {
        self.rate_limiter.reset();
        for breaker in self
            .breakers
            .lock()
            .expect("breaker registry should not be poisoned")
            .values()
        {
            breaker.reset();
        }
        self.retry_counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;

    #[test]
    fn breakers_are_shared_per_source() {
        let state = ResilienceState::default();
        let first = state.register_breaker("cepea", CircuitBreakerConfig::default());
        let second = state.register_breaker("cepea", CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(state.breaker("conab").is_none());
    }

    #[test]
    fn reset_closes_breakers_and_clears_counters() {
        let state = ResilienceState::default();
        let breaker = state.register_breaker("cepea", CircuitBreakerConfig::default());
        breaker.trip("blocked");
        state.retry_counters().record("cepea");

        state.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(state.retry_counters().total(), 0);
    }
}
