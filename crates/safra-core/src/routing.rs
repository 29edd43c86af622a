use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::AcquisitionConfig;
use crate::context::ExecutionContext;
use crate::data_source::{FetchOutput, FetchRequest, SourceDescriptor};
use crate::error::{AcquisitionError, FetchError, SourceFailure, ValidationError};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::ResilienceState;

/// Which sources were tried for one request, in order, and why each failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptLog {
    pub attempted: Vec<String>,
    pub failures: Vec<SourceFailure>,
}

/// Successful resolution with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub payload: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
    pub selected_source: String,
    pub attempts: AttemptLog,
    pub warnings: Vec<String>,
    pub latency_ms: u64,
}

/// Multi-source fallback engine.
///
/// Candidates are tried in ascending priority; the first success wins and no
/// further sources are contacted. Each candidate is gated by the shared rate
/// limiter, skipped while its circuit breaker is open, and wrapped in its own
/// retry run. Results from different sources are never merged.
#[derive(Debug)]
pub struct SourceOrchestrator {
    state: Arc<ResilienceState>,
    retry: RetryConfig,
    catalog: HashMap<String, Vec<SourceDescriptor>>,
}

impl SourceOrchestrator {
    pub fn new(state: Arc<ResilienceState>) -> Self {
        Self {
            state,
            retry: RetryConfig::default(),
            catalog: HashMap::new(),
        }
    }

    pub fn from_config(state: Arc<ResilienceState>, config: &AcquisitionConfig) -> Self {
        Self::new(state).with_retry(RetryConfig::from_settings(&config.retry))
    }

    /// Retry settings for sources that carry none of their own.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> &Arc<ResilienceState> {
        &self.state
    }

    /// Add a candidate source for `dataset`. Names are unique per dataset.
    pub fn register(
        &mut self,
        dataset: impl Into<String>,
        descriptor: SourceDescriptor,
    ) -> Result<(), ValidationError> {
        let dataset = dataset.into();
        let sources = self.catalog.entry(dataset.clone()).or_default();
        if sources.iter().any(|known| known.name() == descriptor.name()) {
            return Err(ValidationError::DuplicateSource {
                dataset,
                name: descriptor.name().to_owned(),
            });
        }
        sources.push(descriptor);
        Ok(())
    }

    pub fn sources(&self, dataset: &str) -> Option<&[SourceDescriptor]> {
        self.catalog.get(dataset).map(Vec::as_slice)
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.catalog.keys().map(String::as_str)
    }

    /// Resolve against the sources registered for `dataset`.
    pub async fn resolve_dataset(
        &self,
        dataset: &str,
        request: &FetchRequest,
        ctx: &ExecutionContext,
    ) -> Result<Resolution, AcquisitionError> {
        let sources = self
            .sources(dataset)
            .ok_or_else(|| AcquisitionError::UnknownDataset {
                dataset: dataset.to_owned(),
            })?;
        self.resolve(request, sources, ctx).await
    }

    /// Try `sources` in priority order until one succeeds.
    pub async fn resolve(
        &self,
        request: &FetchRequest,
        sources: &[SourceDescriptor],
        ctx: &ExecutionContext,
    ) -> Result<Resolution, AcquisitionError> {
        let started = Instant::now();
        let request_key = request.identity();

        let mut ordered: Vec<&SourceDescriptor> =
            sources.iter().filter(|source| source.is_enabled()).collect();
        ordered.sort_by_key(|source| source.priority());

        let mut attempts = AttemptLog::default();

        for source in ordered {
            attempts.attempted.push(source.name().to_owned());
            debug!(
                request_id = ctx.request_id(),
                request = %request_key,
                source = source.name(),
                "trying source"
            );

            match self.attempt(source, request, ctx).await {
                Ok(output) => {
                    let mut warnings = Vec::new();
                    if !attempts.failures.is_empty() {
                        let warning = format!(
                            "source fallback succeeded with '{}' after {} failed attempt(s)",
                            source.name(),
                            attempts.failures.len()
                        );
                        info!(request_id = ctx.request_id(), request = %request_key, "{warning}");
                        warnings.push(warning);
                    }

                    return Ok(Resolution {
                        payload: output.payload,
                        metadata: output.metadata,
                        selected_source: source.name().to_owned(),
                        attempts,
                        warnings,
                        latency_ms: elapsed_ms(started),
                    });
                }
                Err(error) => {
                    warn!(
                        request_id = ctx.request_id(),
                        request = %request_key,
                        source = source.name(),
                        kind = %error.kind(),
                        error = %error,
                        "source failed, falling through"
                    );
                    attempts.failures.push(SourceFailure::new(source.name(), &error));
                }
            }
        }

        Err(AcquisitionError::SourceUnavailable {
            request_key,
            failures: attempts.failures,
        })
    }

    async fn attempt(
        &self,
        source: &SourceDescriptor,
        request: &FetchRequest,
        ctx: &ExecutionContext,
    ) -> Result<FetchOutput, FetchError> {
        if ctx.is_offline() {
            return Err(FetchError::Offline);
        }

        let breaker = self.state.breaker(source.name());
        if let Some(breaker) = &breaker {
            if !breaker.allow_request() {
                return Err(FetchError::CircuitOpen {
                    source_name: source.name().to_owned(),
                });
            }
        }

        let executor = RetryExecutor::new(source.retry().cloned().unwrap_or_else(|| self.retry.clone()))
            .with_counters(self.state.retry_counters());
        let limiter = self.state.rate_limiter();

        let result = executor
            .run_fetch(source.name(), |_| async move {
                let _slot = limiter.acquire(source.name()).await;
                source.fetch(request, ctx).await
            })
            .await;

        match &result {
            Ok(_) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
            }
            Err(error) if error.is_hard_block() => {
                // Sources without a registered breaker get a default one on first block.
                self.state
                    .register_breaker(source.name(), CircuitBreakerConfig::default())
                    .trip(error.to_string());
            }
            Err(_) => {}
        }

        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
