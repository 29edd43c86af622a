//! In-memory [`CacheStore`] for tests and runs that must not touch disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use time::{Date, Duration, OffsetDateTime};

use crate::store::{
    CacheEntry, CacheLookup, CacheStore, HistoryRecord, IndicatorFilter, IndicatorRow,
};
use crate::WarehouseError;

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, CacheEntry>,
    history: Vec<HistoryRecord>,
    indicators: BTreeMap<(String, Date), IndicatorRow>,
}

/// Thread-safe in-memory cache store.
///
/// Clones share the same underlying maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry with an explicit creation time.
    ///
    /// Used to seed entries of a known age when exercising expiry rules.
    pub fn insert_entry(&self, entry: CacheEntry) -> Result<(), WarehouseError> {
        let mut inner = self.lock()?;
        inner.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Number of cached payloads, stale ones included.
    pub fn len(&self) -> Result<usize, WarehouseError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, WarehouseError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, WarehouseError> {
        self.inner.lock().map_err(|_| WarehouseError::Poisoned)
    }
}

impl CacheStore for MemoryCacheStore {
    fn cache_get(&self, key: &str) -> Result<CacheLookup, WarehouseError> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.entries.get_mut(key) else {
            return Ok(CacheLookup::miss());
        };
        entry.hit_count = entry.hit_count.saturating_add(1);
        let expired = OffsetDateTime::now_utc() >= entry.expires_at;
        Ok(CacheLookup {
            payload: Some(entry.payload.clone()),
            stale: entry.stale || expired,
        })
    }

    fn cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, WarehouseError> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    fn cache_set(
        &self,
        key: &str,
        payload: &[u8],
        source: &str,
        ttl_seconds: u64,
    ) -> Result<(), WarehouseError> {
        let created_at = OffsetDateTime::now_utc();
        let ttl = Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX));
        let expires_at = created_at
            .checked_add(ttl)
            .unwrap_or(created_at + Duration::days(365 * 100));

        self.insert_entry(CacheEntry {
            key: key.to_owned(),
            payload: payload.to_vec(),
            created_at,
            expires_at,
            source: source.to_owned(),
            stale: false,
            hit_count: 0,
        })
    }

    fn cache_delete(&self, key: &str) -> Result<bool, WarehouseError> {
        Ok(self.lock()?.entries.remove(key).is_some())
    }

    fn cache_clear(&self, source: Option<&str>) -> Result<usize, WarehouseError> {
        let mut inner = self.lock()?;
        let before = inner.entries.len();
        match source {
            Some(source) => inner.entries.retain(|_, entry| entry.source != source),
            None => inner.entries.clear(),
        }
        Ok(before - inner.entries.len())
    }

    fn cache_invalidate(&self, key: &str) -> Result<bool, WarehouseError> {
        let mut inner = self.lock()?;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn history_save(&self, record: &HistoryRecord) -> Result<(), WarehouseError> {
        self.lock()?.history.push(record.clone());
        Ok(())
    }

    fn history_get(
        &self,
        dataset: &str,
        reference_date: Option<Date>,
    ) -> Result<Option<HistoryRecord>, WarehouseError> {
        let inner = self.lock()?;
        // Later pushes win ties so the ledger reads like the DuckDB id ordering.
        let latest = inner
            .history
            .iter()
            .enumerate()
            .filter(|(_, record)| record.dataset == dataset)
            .filter(|(_, record)| reference_date.map_or(true, |d| record.reference_date == d))
            .max_by_key(|(index, record)| (record.collected_at, *index))
            .map(|(_, record)| record.clone());
        Ok(latest)
    }

    fn indicators_upsert(&self, rows: &[IndicatorRow]) -> Result<usize, WarehouseError> {
        let mut inner = self.lock()?;
        for row in rows {
            inner
                .indicators
                .insert((row.product.clone(), row.date), row.clone());
        }
        Ok(rows.len())
    }

    fn indicators_query(
        &self,
        filter: &IndicatorFilter,
    ) -> Result<Vec<IndicatorRow>, WarehouseError> {
        let inner = self.lock()?;
        let rows = inner
            .indicators
            .values()
            .filter(|row| filter.matches(row))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn basic_set_get_overwrite() {
        let cache = MemoryCacheStore::new();

        assert!(!cache.cache_get("key1").expect("get").is_hit());

        cache.cache_set("key1", b"value1", "ibge", 60).expect("set");
        assert_eq!(
            cache.cache_get("key1").expect("get").payload,
            Some(b"value1".to_vec())
        );

        cache.cache_set("key1", b"value2", "ibge", 60).expect("set");
        assert_eq!(
            cache.cache_get("key1").expect("get").payload,
            Some(b"value2".to_vec())
        );
    }

    #[test]
    fn zero_ttl_entries_report_stale() {
        let cache = MemoryCacheStore::new();
        cache.cache_set("k", b"v", "ibge", 0).expect("set");

        let lookup = cache.cache_get("k").expect("get");
        assert!(lookup.stale);
        assert!(lookup.is_hit());
    }

    #[test]
    fn delete_and_clear() {
        let cache = MemoryCacheStore::new();
        cache.cache_set("a", b"1", "cepea", 60).expect("set");
        cache.cache_set("b", b"2", "conab", 60).expect("set");

        assert!(cache.cache_delete("a").expect("delete"));
        assert!(!cache.cache_delete("a").expect("delete"));
        assert_eq!(cache.cache_clear(None).expect("clear"), 1);
        assert!(cache.is_empty().expect("empty"));
    }

    #[test]
    fn history_prefers_latest_collection() {
        let cache = MemoryCacheStore::new();
        let now = OffsetDateTime::now_utc();
        for (age, body) in [(120, "old"), (0, "new"), (60, "mid")] {
            cache
                .history_save(&HistoryRecord {
                    dataset: String::from("ibge_lspa"),
                    reference_date: date!(2024 - 06 - 01),
                    payload: body.as_bytes().to_vec(),
                    source: String::from("ibge"),
                    collected_at: now - Duration::seconds(age),
                })
                .expect("save");
        }

        let latest = cache
            .history_get("ibge_lspa", None)
            .expect("get")
            .expect("present");
        assert_eq!(latest.payload, b"new");
    }

    #[test]
    fn indicator_query_honours_limit() {
        let cache = MemoryCacheStore::new();
        let rows: Vec<IndicatorRow> = (0..4)
            .map(|day| IndicatorRow {
                product: String::from("boi_gordo"),
                date: date!(2024 - 07 - 01) + Duration::days(day),
                value: 230.0,
                unit: None,
                region: None,
                source: String::from("cepea"),
            })
            .collect();
        cache.indicators_upsert(&rows).expect("upsert");

        let filter = IndicatorFilter {
            limit: Some(2),
            ..IndicatorFilter::for_product("boi_gordo")
        };
        let found = cache.indicators_query(&filter).expect("query");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].date, date!(2024 - 07 - 01));
    }
}
