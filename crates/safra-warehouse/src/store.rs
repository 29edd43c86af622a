//! Cache store contract and the records it persists.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::WarehouseError;

/// A cached payload together with its bookkeeping metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub source: String,
    /// Set by [`CacheStore::cache_invalidate`]; the payload is kept.
    pub stale: bool,
    pub hit_count: u64,
}

/// Result of [`CacheStore::cache_get`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLookup {
    pub payload: Option<Vec<u8>>,
    /// True when the entry was invalidated or its store-side expiry has passed.
    pub stale: bool,
}

impl CacheLookup {
    pub const fn miss() -> Self {
        Self {
            payload: None,
            stale: false,
        }
    }

    pub const fn is_hit(&self) -> bool {
        self.payload.is_some()
    }
}

/// One dated snapshot in the append-only history ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub dataset: String,
    pub reference_date: Date,
    pub payload: Vec<u8>,
    pub source: String,
    pub collected_at: OffsetDateTime,
}

/// One point of an indicator series, unique per `(product, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub product: String,
    pub date: Date,
    pub value: f64,
    pub unit: Option<String>,
    pub region: Option<String>,
    pub source: String,
}

/// Filter for [`CacheStore::indicators_query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndicatorFilter {
    pub product: Option<String>,
    pub source: Option<String>,
    pub start: Option<Date>,
    pub end: Option<Date>,
    pub limit: Option<usize>,
}

impl IndicatorFilter {
    pub fn for_product(product: impl Into<String>) -> Self {
        Self {
            product: Some(product.into()),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, row: &IndicatorRow) -> bool {
        self.product.as_ref().map_or(true, |p| *p == row.product)
            && self.source.as_ref().map_or(true, |s| *s == row.source)
            && self.start.map_or(true, |start| row.date >= start)
            && self.end.map_or(true, |end| row.date <= end)
    }
}

/// Durable key to bytes store consumed by the acquisition layer.
///
/// Writers racing on the same key resolve as last-write-wins; no operation
/// spans more than one row except [`indicators_upsert`](Self::indicators_upsert),
/// which is applied atomically as a batch.
pub trait CacheStore: Send + Sync {
    /// Fetch a payload and bump its hit counter.
    fn cache_get(&self, key: &str) -> Result<CacheLookup, WarehouseError>;

    /// Read the full entry without touching the hit counter.
    fn cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, WarehouseError>;

    /// Insert or overwrite a payload. Overwriting clears the stale flag and hit counter.
    fn cache_set(
        &self,
        key: &str,
        payload: &[u8],
        source: &str,
        ttl_seconds: u64,
    ) -> Result<(), WarehouseError>;

    /// Remove one entry. Returns whether it existed.
    fn cache_delete(&self, key: &str) -> Result<bool, WarehouseError>;

    /// Remove every entry, or only those written by `source`. Returns the count removed.
    fn cache_clear(&self, source: Option<&str>) -> Result<usize, WarehouseError>;

    /// Mark an entry stale without deleting it. Returns whether it existed.
    fn cache_invalidate(&self, key: &str) -> Result<bool, WarehouseError>;

    /// Append a snapshot to the history ledger.
    fn history_save(&self, record: &HistoryRecord) -> Result<(), WarehouseError>;

    /// Latest snapshot for a dataset, optionally restricted to one reference date.
    fn history_get(
        &self,
        dataset: &str,
        reference_date: Option<Date>,
    ) -> Result<Option<HistoryRecord>, WarehouseError>;

    /// Insert or replace indicator points. Returns the number of rows written.
    fn indicators_upsert(&self, rows: &[IndicatorRow]) -> Result<usize, WarehouseError>;

    /// Indicator points matching `filter`, ordered by product then date.
    fn indicators_query(&self, filter: &IndicatorFilter)
        -> Result<Vec<IndicatorRow>, WarehouseError>;
}

pub(crate) fn parse_date(
    value: &str,
    field: &'static str,
    key: &str,
) -> Result<Date, WarehouseError> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).map_err(|error| {
        WarehouseError::Corrupt {
            field,
            key: key.to_owned(),
            reason: error.to_string(),
        }
    })
}
