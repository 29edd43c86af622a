//! # Safra Core
//!
//! Resilient acquisition engine for volatile published datasets.
//!
//! ## Overview
//!
//! Government statistics pages, market spreadsheets and JSON APIs go offline,
//! rate-limit aggressively and change shape without notice. This crate decides
//! *how* and *whether* to trust a fetch, independent of *what* is fetched:
//!
//! - **Per-source rate limiting** with one async gate per source key
//! - **Retry with exponential backoff** for transient failures only
//! - **Circuit breakers** that stop hammering a source after a hard block
//! - **Cache policies** with TTL, staleness windows and publish-schedule expiry
//! - **Multi-source fallback** with a full attempt log per request
//! - **Structural drift detection** against saved page fingerprints
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`acquire`] | Cache-aware acquisition on top of the orchestrator |
//! | [`cache_policy`] | TTL, staleness and smart-expiry rules |
//! | [`circuit_breaker`] | Lazy-reset breaker for fragile sources |
//! | [`config`] | `SAFRA_*` environment configuration |
//! | [`context`] | Per-request execution context |
//! | [`data_source`] | Source fetch contract and descriptors |
//! | [`error`] | Core error types |
//! | [`fan_out`] | Bounded concurrent fan-out |
//! | [`fingerprint`] | Page fingerprints, drift scoring and baselines |
//! | [`http_client`] | HTTP transport shim and response classification |
//! | [`monitor`] | Periodic drift monitoring |
//! | [`retry`] | Retry executor and backoff |
//! | [`routing`] | Priority-ordered source orchestrator |
//! | [`state`] | Shared resilience registries |
//! | [`throttling`] | Per-source rate limiter |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use safra_core::{
//!     AcquireRequest, Acquirer, AcquisitionConfig, ExecutionContext, FetchRequest, HttpSource,
//!     ReqwestHttpClient, ResilienceState, SourceDescriptor, SourceOrchestrator, Warehouse,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcquisitionConfig::from_env()?;
//!     let state = Arc::new(ResilienceState::from_config(&config));
//!     let http = Arc::new(ReqwestHttpClient::from_timeouts(&config.timeouts));
//!
//!     let mut orchestrator = SourceOrchestrator::from_config(state, &config);
//!     orchestrator.register(
//!         "cepea_indicador",
//!         SourceDescriptor::new("cepea", 1, Arc::new(HttpSource::new(http, "https://example.test/{key}")))?,
//!     )?;
//!
//!     let acquirer = Acquirer::from_config(Arc::new(Warehouse::open_default()?), orchestrator, &config)?;
//!     let request = AcquireRequest::new("cepea_indicador", "cepea", FetchRequest::new("boi_gordo"));
//!     let acquired = acquirer.acquire(&request, &ExecutionContext::from_config(&config)).await?;
//!     println!("{} bytes from {} ({:?})", acquired.payload.len(), acquired.source, acquired.freshness);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │    Acquirer     │────▶│ CacheStore       │
//! │ (policy checks) │     │ (DuckDB/memory)  │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Orchestrator    │────▶│ ResilienceState  │
//! │ (priority loop) │     │ limiter/breakers │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ SourceFetch     │────▶│ HTTP Client      │
//! │ (per source)    │     │ (reqwest/script) │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Sources return a closed [`FetchError`]; the orchestrator classifies it with a
//! plain match and only gives up once every candidate failed:
//!
//! ```rust
//! use safra_core::{AcquisitionError, FailureKind};
//!
//! fn report(error: &AcquisitionError) {
//!     for failure in error.failures() {
//!         match failure.kind {
//!             FailureKind::Network => { /* transient, retried already */ }
//!             FailureKind::Parse | FailureKind::Contract => { /* layout changed? */ }
//!             FailureKind::Unexpected => {}
//!         }
//!     }
//! }
//! ```

pub mod acquire;
pub mod cache_policy;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod data_source;
pub mod error;
pub mod fan_out;
pub mod fingerprint;
pub mod http_client;
pub mod monitor;
pub mod retry;
pub mod routing;
pub mod state;
pub mod throttling;

// Acquisition
pub use acquire::{AcquireRequest, Acquired, Acquirer, Freshness};

// Cache policies
pub use cache_policy::{
    calculate_expiry, is_expired, is_stale_acceptable, should_refresh, CachePolicy,
    PolicyRegistry, RefreshDecision, RefreshReason,
};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Configuration and context
pub use config::{AcquisitionConfig, CacheOverride, RateLimitSettings, RetrySettings, TimeoutSettings};
pub use context::ExecutionContext;

// Source contract
pub use data_source::{FetchFuture, FetchOutput, FetchRequest, SourceDescriptor, SourceFetch};

// Error types
pub use error::{
    AcquisitionError, ConfigError, CoreError, FailureKind, FetchError, SourceFailure,
    ValidationError,
};

pub use fan_out::{fan_out, DEFAULT_FAN_OUT};

// Drift detection
pub use fingerprint::{
    compare, validate_against_baseline, BaselineError, BaselineStore, ComponentScores,
    DriftLevel, DriftReport, Fingerprint, PageStructure, TableStructure,
};
pub use monitor::{CaptureFuture, DriftError, DriftMonitor, FingerprintCapture};

// HTTP transport
pub use http_client::{
    classify_response, HardBlockDetector, HttpClient, HttpError, HttpFuture, HttpMethod, HttpRequest,
    HttpResponse, HttpSource, ReqwestHttpClient, ScriptedHttpClient,
};

// Retry
pub use retry::{retry, should_retry_status, Backoff, RetryConfig, RetryCounters, RetryExecutor};

// Orchestration
pub use routing::{AttemptLog, Resolution, SourceOrchestrator};
pub use state::ResilienceState;
pub use throttling::{RateLimitGuard, RateLimiter};

// Warehouse (re-exported from safra-warehouse)
pub use safra_warehouse::{
    CacheEntry, CacheLookup, CacheStore, HistoryRecord, IndicatorFilter, IndicatorRow,
    MemoryCacheStore, Warehouse, WarehouseConfig, WarehouseError,
};
