//! Source fetch contract.
//!
//! Collaborators implement [`SourceFetch`] once per upstream source. The
//! orchestrator only sees opaque payload bytes and optional metadata; it never
//! parses what it fetched.
//!
//! # Example
//!
//! ```rust,ignore
//! use safra_core::{ExecutionContext, FetchError, FetchFuture, FetchOutput, FetchRequest, SourceFetch};
//!
//! struct StaticSource;
//!
//! impl SourceFetch for StaticSource {
//!     fn fetch<'a>(&'a self, request: &'a FetchRequest, _ctx: &'a ExecutionContext) -> FetchFuture<'a> {
//!         Box::pin(async move { Ok(FetchOutput::new(request.key.as_bytes().to_vec())) })
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{FetchError, ValidationError};
use crate::retry::RetryConfig;

/// What to fetch: a request key plus free-form parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: String,
    pub params: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Stable identity used for cache keys and log fields, `key` or `key?a=1&b=2`.
    pub fn identity(&self) -> String {
        if self.params.is_empty() {
            return self.key.clone();
        }
        let query = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.key)
    }
}

/// Successful fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub payload: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
}

impl FetchOutput {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<FetchOutput, FetchError>> + Send + 'a>>;

/// One upstream source's fetch capability.
pub trait SourceFetch: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a FetchRequest, ctx: &'a ExecutionContext) -> FetchFuture<'a>;
}

/// A candidate source for a dataset.
///
/// Clones share the `enabled` switch, so toggling a registered descriptor
/// affects every later resolution.
#[derive(Clone)]
pub struct SourceDescriptor {
    name: String,
    priority: i32,
    fetcher: Arc<dyn SourceFetch>,
    enabled: Arc<AtomicBool>,
    retry: Option<RetryConfig>,
}

impl Debug for SourceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SourceDescriptor {
    /// Lower priority values are tried first.
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        fetcher: Arc<dyn SourceFetch>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptySourceName);
        }
        Ok(Self {
            name,
            priority,
            fetcher,
            enabled: Arc::new(AtomicBool::new(true)),
            retry: None,
        })
    }

    /// Per-source retry settings overriding the orchestrator's.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn disabled(self) -> Self {
        self.set_enabled(false);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn priority(&self) -> i32 {
        self.priority
    }

    pub fn retry(&self) -> Option<&RetryConfig> {
        self.retry.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn fetch<'a>(&'a self, request: &'a FetchRequest, ctx: &'a ExecutionContext) -> FetchFuture<'a> {
        self.fetcher.fetch(request, ctx)
    }
}
