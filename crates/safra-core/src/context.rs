//! Per-request execution context.
//!
//! Everything that used to be ambient (the wall clock, a frozen snapshot date for
//! reproducible runs, offline and strict switches) travels in an
//! [`ExecutionContext`] passed explicitly to every fetch and cache decision.

use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::config::AcquisitionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    request_id: String,
    now: Option<OffsetDateTime>,
    snapshot: Option<Date>,
    offline: bool,
    strict: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Live context with a fresh request id.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            now: None,
            snapshot: None,
            offline: false,
            strict: false,
        }
    }

    /// Live context carrying the global offline/strict flags from configuration.
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self::new()
            .with_offline(config.offline)
            .with_strict(config.strict)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Pin the clock used for cache decisions.
    pub fn at(mut self, now: OffsetDateTime) -> Self {
        self.now = Some(now);
        self
    }

    /// Serve every request from the history ledger as of `date`.
    pub fn with_snapshot(mut self, date: Date) -> Self {
        self.snapshot = Some(date);
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Pinned time if set, otherwise the current UTC time.
    pub fn now(&self) -> OffsetDateTime {
        self.now.unwrap_or_else(OffsetDateTime::now_utc)
    }

    pub const fn snapshot(&self) -> Option<Date> {
        self.snapshot
    }

    pub const fn is_offline(&self) -> bool {
        self.offline
    }

    pub const fn is_strict(&self) -> bool {
        self.strict
    }
}
