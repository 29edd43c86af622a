//! Cache-aware acquisition.
//!
//! [`Acquirer`] decides, per request, whether to serve from the cache store,
//! go to the orchestrator, or fall back to a stale copy:
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | snapshot date set in the context | history ledger entry for that date, or `SnapshotMiss` |
//! | cached, not invalidated, policy says fresh | cached payload, [`Freshness::Fresh`] |
//! | offline | any cached payload as [`Freshness::Stale`], or `OfflineMiss` |
//! | resolved by a source | payload written back, [`Freshness::Live`]; a failed write becomes a warning |
//! | every source failed, cached within the staleness window | cached payload as [`Freshness::Stale`] unless strict |
//! | otherwise | the orchestrator's error |

use std::sync::Arc;

use safra_warehouse::{CacheEntry, CacheStore, HistoryRecord};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache_policy::{self, CachePolicy, PolicyRegistry};
use crate::config::AcquisitionConfig;
use crate::context::ExecutionContext;
use crate::data_source::FetchRequest;
use crate::error::{AcquisitionError, ValidationError};
use crate::routing::{AttemptLog, SourceOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served from cache within its freshness window.
    Fresh,
    /// Fetched from a source during this call.
    Live,
    /// Served from cache past its freshness window.
    Stale,
    /// Replayed from the history ledger.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub dataset: String,
    /// Key into the policy registry, usually the primary source's name.
    pub policy_source: String,
    pub endpoint: Option<String>,
    pub fetch: FetchRequest,
    /// Skip the cache even when it is fresh.
    pub force: bool,
}

impl AcquireRequest {
    pub fn new(dataset: impl Into<String>, policy_source: impl Into<String>, fetch: FetchRequest) -> Self {
        Self {
            dataset: dataset.into(),
            policy_source: policy_source.into(),
            endpoint: None,
            fetch,
            force: false,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.dataset, self.fetch.identity())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub payload: Vec<u8>,
    pub freshness: Freshness,
    /// Source that produced the payload, live or originally.
    pub source: String,
    pub metadata: Option<serde_json::Value>,
    /// Empty unless the orchestrator ran.
    pub attempts: AttemptLog,
    pub warnings: Vec<String>,
    pub collected_at: Option<OffsetDateTime>,
}

impl Acquired {
    fn from_cache(entry: CacheEntry, freshness: Freshness) -> Self {
        Self {
            payload: entry.payload,
            freshness,
            source: entry.source,
            metadata: None,
            attempts: AttemptLog::default(),
            warnings: Vec::new(),
            collected_at: Some(entry.created_at),
        }
    }
}

pub struct Acquirer {
    store: Arc<dyn CacheStore>,
    policies: PolicyRegistry,
    orchestrator: SourceOrchestrator,
    record_history: bool,
}

impl Acquirer {
    pub fn new(store: Arc<dyn CacheStore>, orchestrator: SourceOrchestrator) -> Self {
        Self {
            store,
            policies: PolicyRegistry::builtin(),
            orchestrator,
            record_history: true,
        }
    }

    /// Built-in policies with the configuration's cache overrides applied.
    pub fn from_config(
        store: Arc<dyn CacheStore>,
        orchestrator: SourceOrchestrator,
        config: &AcquisitionConfig,
    ) -> Result<Self, ValidationError> {
        let mut policies = PolicyRegistry::builtin();
        policies.apply_overrides(&config.cache)?;
        Ok(Self::new(store, orchestrator).with_policies(policies))
    }

    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Whether live payloads are also appended to the history ledger.
    pub fn with_history(mut self, record_history: bool) -> Self {
        self.record_history = record_history;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn orchestrator(&self) -> &SourceOrchestrator {
        &self.orchestrator
    }

    pub fn policy_for(&self, request: &AcquireRequest) -> &CachePolicy {
        self.policies
            .get(&request.policy_source, request.endpoint.as_deref())
    }

    pub async fn acquire(
        &self,
        request: &AcquireRequest,
        ctx: &ExecutionContext,
    ) -> Result<Acquired, AcquisitionError> {
        let key = request.cache_key();

        if let Some(date) = ctx.snapshot() {
            let record = self
                .store
                .history_get(&key, Some(date))?
                .ok_or(AcquisitionError::SnapshotMiss { key, date })?;
            return Ok(Acquired {
                payload: record.payload,
                freshness: Freshness::Snapshot,
                source: record.source,
                metadata: None,
                attempts: AttemptLog::default(),
                warnings: Vec::new(),
                collected_at: Some(record.collected_at),
            });
        }

        let now = ctx.now();
        let policy = self.policy_for(request);
        let cached = self.store.cache_entry(&key)?;

        if let Some(entry) = &cached {
            let decision = cache_policy::should_refresh(entry.created_at, policy, request.force, now);
            if !entry.stale && !decision.refresh {
                debug!(request_id = ctx.request_id(), key = %key, "cache hit");
                // Bumps the hit counter.
                let lookup = self.store.cache_get(&key)?;
                let mut acquired = Acquired::from_cache(entry.clone(), Freshness::Fresh);
                if let Some(payload) = lookup.payload {
                    acquired.payload = payload;
                }
                return Ok(acquired);
            }
            debug!(
                request_id = ctx.request_id(),
                key = %key,
                reason = decision.reason.as_str(),
                invalidated = entry.stale,
                "cache refresh needed"
            );
        }

        if ctx.is_offline() {
            return match cached {
                Some(entry) => {
                    let warning = format!("offline mode, serving cached '{key}' past its freshness window");
                    warn!(request_id = ctx.request_id(), "{warning}");
                    let mut acquired = Acquired::from_cache(entry, Freshness::Stale);
                    acquired.warnings.push(warning);
                    Ok(acquired)
                }
                None => Err(AcquisitionError::OfflineMiss { key }),
            };
        }

        match self
            .orchestrator
            .resolve_dataset(&request.dataset, &request.fetch, ctx)
            .await
        {
            Ok(resolution) => {
                let mut warnings = resolution.warnings;
                let ttl_seconds = cache_policy::ttl_from_now(policy, now);
                if let Err(error) =
                    self.store
                        .cache_set(&key, &resolution.payload, &resolution.selected_source, ttl_seconds)
                {
                    let warning = format!("failed to cache '{key}': {error}");
                    warn!(request_id = ctx.request_id(), "{warning}");
                    warnings.push(warning);
                }
                if self.record_history {
                    let saved = self.store.history_save(&HistoryRecord {
                        dataset: key.clone(),
                        reference_date: now.date(),
                        payload: resolution.payload.clone(),
                        source: resolution.selected_source.clone(),
                        collected_at: now,
                    });
                    if let Err(error) = saved {
                        let warning = format!("failed to record history for '{key}': {error}");
                        warn!(request_id = ctx.request_id(), "{warning}");
                        warnings.push(warning);
                    }
                }
                info!(
                    request_id = ctx.request_id(),
                    key = %key,
                    source = %resolution.selected_source,
                    ttl_seconds,
                    latency_ms = resolution.latency_ms,
                    "acquired live payload"
                );

                Ok(Acquired {
                    payload: resolution.payload,
                    freshness: Freshness::Live,
                    source: resolution.selected_source,
                    metadata: resolution.metadata,
                    attempts: resolution.attempts,
                    warnings,
                    collected_at: Some(now),
                })
            }
            Err(error @ AcquisitionError::SourceUnavailable { .. }) => {
                let fallback = cached.filter(|entry| {
                    cache_policy::is_stale_acceptable(entry.created_at, policy, now)
                });
                match fallback {
                    Some(entry) if !ctx.is_strict() => {
                        let warning = format!("serving stale cache for '{key}': {error}");
                        warn!(request_id = ctx.request_id(), "{warning}");
                        let mut acquired = Acquired::from_cache(entry, Freshness::Stale);
                        let failures = error.failures().to_vec();
                        acquired.attempts = AttemptLog {
                            attempted: failures.iter().map(|failure| failure.source_name.clone()).collect(),
                            failures,
                        };
                        acquired.warnings.push(warning);
                        Ok(acquired)
                    }
                    _ => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    use safra_warehouse::{CacheLookup, IndicatorFilter, IndicatorRow, MemoryCacheStore, WarehouseError};
    use time::macros::{date, datetime};
    use time::Duration;

    use super::*;
    use crate::data_source::{FetchFuture, FetchOutput, SourceDescriptor, SourceFetch};
    use crate::error::FetchError;
    use crate::retry::RetryConfig;
    use crate::state::ResilienceState;
    use crate::throttling::RateLimiter;

    struct Counting {
        fail: bool,
        calls: AtomicU32,
    }

    impl SourceFetch for Counting {
        fn fetch<'a>(&'a self, _request: &'a FetchRequest, _ctx: &'a ExecutionContext) -> FetchFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(FetchError::network("down"))
                } else {
                    Ok(FetchOutput::new(b"live".to_vec()))
                }
            })
        }
    }

    fn setup(fail: bool) -> (Acquirer, Arc<MemoryCacheStore>, Arc<Counting>) {
        let source = Arc::new(Counting {
            fail,
            calls: AtomicU32::new(0),
        });
        let state = Arc::new(ResilienceState::new(RateLimiter::new(StdDuration::ZERO)));
        let mut orchestrator = SourceOrchestrator::new(state).with_retry(RetryConfig::no_retry());
        orchestrator
            .register(
                "ibge_pam",
                SourceDescriptor::new("ibge", 1, Arc::clone(&source) as Arc<dyn SourceFetch>)
                    .expect("descriptor"),
            )
            .expect("register");
        let store = Arc::new(MemoryCacheStore::new());
        let acquirer = Acquirer::new(Arc::clone(&store) as Arc<dyn CacheStore>, orchestrator);
        (acquirer, store, source)
    }

    fn request() -> AcquireRequest {
        AcquireRequest::new("ibge_pam", "ibge", FetchRequest::new("soja"))
    }

    fn seed(store: &MemoryCacheStore, created_at: OffsetDateTime) {
        store
            .insert_entry(CacheEntry {
                key: request().cache_key(),
                payload: b"cached".to_vec(),
                created_at,
                expires_at: created_at + Duration::days(30),
                source: String::from("ibge"),
                stale: false,
                hit_count: 0,
            })
            .expect("seed");
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_fetching() {
        let (acquirer, store, source) = setup(false);
        let now = datetime!(2024-06-10 12:00 UTC);
        seed(&store, now - Duration::days(1));

        let acquired = acquirer
            .acquire(&request(), &ExecutionContext::new().at(now))
            .await
            .expect("acquired");

        assert_eq!(acquired.freshness, Freshness::Fresh);
        assert_eq!(acquired.payload, b"cached");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        let entry = store.cache_entry(&request().cache_key()).expect("entry").expect("present");
        assert_eq!(entry.hit_count, 1);
    }

    #[tokio::test]
    async fn force_bypasses_a_fresh_entry_and_records_history() {
        let (acquirer, store, source) = setup(false);
        let now = datetime!(2024-06-10 12:00 UTC);
        seed(&store, now - Duration::days(1));

        let acquired = acquirer
            .acquire(&request().forced(), &ExecutionContext::new().at(now))
            .await
            .expect("acquired");

        assert_eq!(acquired.freshness, Freshness::Live);
        assert_eq!(acquired.payload, b"live");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let history = store
            .history_get(&request().cache_key(), Some(date!(2024 - 06 - 10)))
            .expect("history")
            .expect("recorded");
        assert_eq!(history.payload, b"live");
    }

    #[tokio::test]
    async fn failing_sources_fall_back_to_stale_cache() {
        let (acquirer, store, _) = setup(true);
        let now = datetime!(2024-06-10 12:00 UTC);
        // Past the 30 day TTL, inside the 90 day staleness window.
        seed(&store, now - Duration::days(40));

        let acquired = acquirer
            .acquire(&request(), &ExecutionContext::new().at(now))
            .await
            .expect("acquired");

        assert_eq!(acquired.freshness, Freshness::Stale);
        assert_eq!(acquired.attempts.failures.len(), 1);
        assert!(acquired.warnings[0].contains("serving stale cache"));
    }

    #[tokio::test]
    async fn strict_mode_refuses_stale_fallback() {
        let (acquirer, store, _) = setup(true);
        let now = datetime!(2024-06-10 12:00 UTC);
        seed(&store, now - Duration::days(40));

        let error = acquirer
            .acquire(&request(), &ExecutionContext::new().at(now).with_strict(true))
            .await
            .expect_err("strict");

        assert!(matches!(error, AcquisitionError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn offline_without_cache_fails_and_never_fetches() {
        let (acquirer, _, source) = setup(false);

        let error = acquirer
            .acquire(&request(), &ExecutionContext::new().with_offline(true))
            .await
            .expect_err("offline");

        assert!(matches!(error, AcquisitionError::OfflineMiss { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidated_entry_is_refetched() {
        let (acquirer, store, source) = setup(false);
        let now = datetime!(2024-06-10 12:00 UTC);
        seed(&store, now - Duration::hours(1));
        store.cache_invalidate(&request().cache_key()).expect("invalidate");

        let acquired = acquirer
            .acquire(&request(), &ExecutionContext::new().at(now))
            .await
            .expect("acquired");

        assert_eq!(acquired.freshness, Freshness::Live);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_context_replays_history_only() {
        let (acquirer, _, source) = setup(false);

        let error = acquirer
            .acquire(
                &request(),
                &ExecutionContext::new().with_snapshot(date!(2023 - 12 - 31)),
            )
            .await
            .expect_err("no snapshot");

        assert!(matches!(error, AcquisitionError::SnapshotMiss { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    /// Serves reads from memory and fails every write.
    struct ReadOnly(MemoryCacheStore);

    impl CacheStore for ReadOnly {
        fn cache_get(&self, key: &str) -> Result<CacheLookup, WarehouseError> {
            self.0.cache_get(key)
        }

        fn cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, WarehouseError> {
            self.0.cache_entry(key)
        }

        fn cache_set(&self, _: &str, _: &[u8], _: &str, _: u64) -> Result<(), WarehouseError> {
            Err(WarehouseError::Poisoned)
        }

        fn cache_delete(&self, key: &str) -> Result<bool, WarehouseError> {
            self.0.cache_delete(key)
        }

        fn cache_clear(&self, source: Option<&str>) -> Result<usize, WarehouseError> {
            self.0.cache_clear(source)
        }

        fn cache_invalidate(&self, key: &str) -> Result<bool, WarehouseError> {
            self.0.cache_invalidate(key)
        }

        fn history_save(&self, _: &HistoryRecord) -> Result<(), WarehouseError> {
            Err(WarehouseError::Poisoned)
        }

        fn history_get(
            &self,
            dataset: &str,
            reference_date: Option<time::Date>,
        ) -> Result<Option<HistoryRecord>, WarehouseError> {
            self.0.history_get(dataset, reference_date)
        }

        fn indicators_upsert(&self, _: &[IndicatorRow]) -> Result<usize, WarehouseError> {
            Err(WarehouseError::Poisoned)
        }

        fn indicators_query(
            &self,
            filter: &IndicatorFilter,
        ) -> Result<Vec<IndicatorRow>, WarehouseError> {
            self.0.indicators_query(filter)
        }
    }

    #[tokio::test]
    async fn failed_cache_write_still_returns_the_live_payload() {
        let source = Arc::new(Counting {
            fail: false,
            calls: AtomicU32::new(0),
        });
        let state = Arc::new(ResilienceState::new(RateLimiter::new(StdDuration::ZERO)));
        let mut orchestrator = SourceOrchestrator::new(state).with_retry(RetryConfig::no_retry());
        orchestrator
            .register(
                "ibge_pam",
                SourceDescriptor::new("ibge", 1, Arc::clone(&source) as Arc<dyn SourceFetch>)
                    .expect("descriptor"),
            )
            .expect("register");
        let store = Arc::new(ReadOnly(MemoryCacheStore::new()));
        let acquirer = Acquirer::new(Arc::clone(&store) as Arc<dyn CacheStore>, orchestrator);
        let now = datetime!(2024-06-10 12:00 UTC);

        let acquired = acquirer
            .acquire(&request(), &ExecutionContext::new().at(now))
            .await
            .expect("live payload despite write failure");

        assert_eq!(acquired.freshness, Freshness::Live);
        assert_eq!(acquired.payload, b"live");
        assert_eq!(acquired.warnings.len(), 2);
        assert!(acquired.warnings[0].contains("failed to cache"));
        assert!(acquired.warnings[1].contains("failed to record history"));
        assert!(store.cache_entry(&request().cache_key()).expect("entry").is_none());
    }
}
