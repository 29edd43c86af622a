//! # Safra Warehouse
//!
//! Durable storage for fetched payloads and their bookkeeping metadata.
//!
//! ## Overview
//!
//! The warehouse never interprets payloads. It keeps opaque bytes keyed by a
//! cache key together with the metadata the acquisition layer needs to decide
//! whether a hit can be trusted:
//!
//! - **Payload cache** with expiry, explicit invalidation and hit counting
//! - **History ledger**, an append-only record of dated snapshots
//! - **Indicator series**, an upsertable time series keyed by product and date
//!
//! Two implementations of [`CacheStore`] are provided: [`Warehouse`], backed by
//! `DuckDB`, and [`MemoryCacheStore`] for tests and ephemeral runs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use safra_warehouse::{CacheStore, Warehouse};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!
//!     warehouse.cache_set("cepea:boi_gordo", b"<html>...</html>", "cepea", 86_400)?;
//!     let lookup = warehouse.cache_get("cepea:boi_gordo")?;
//!     assert!(lookup.payload.is_some());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `cache_entries` | Latest payload per cache key |
//! | `history_entries` | Append-only dated payload ledger |
//! | `indicators` | Time series values keyed by `(product, date)` |
//! | `schema_migrations` | Applied schema versions |

pub mod duckdb;
pub mod memory;
pub mod migrations;
pub mod store;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params_from_iter, OptionalExt, ToSql};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

pub use crate::duckdb::{DuckDbConnectionManager, PooledConnection};
pub use memory::MemoryCacheStore;
pub use store::{
    CacheEntry, CacheLookup, CacheStore, HistoryRecord, IndicatorFilter, IndicatorRow,
};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded back into its typed form.
    #[error("corrupt {field} in row '{key}': {reason}")]
    Corrupt {
        field: &'static str,
        key: String,
        reason: String,
    },

    /// The in-memory store lock was poisoned by a panicking writer.
    #[error("cache store lock poisoned")]
    Poisoned,
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for safra data.
    pub safra_home: PathBuf,
    /// Path to the `DuckDB` database file. `None` opens an in-memory database.
    pub db_path: Option<PathBuf>,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let safra_home = resolve_safra_home();
        let db_path = safra_home.join("cache").join("warehouse.duckdb");
        Self {
            safra_home,
            db_path: Some(db_path),
            max_pool_size: 4,
        }
    }
}

impl WarehouseConfig {
    /// Configuration for a throwaway in-memory database.
    pub fn in_memory() -> Self {
        Self {
            safra_home: resolve_safra_home(),
            db_path: None,
            max_pool_size: 2,
        }
    }
}

/// `DuckDB`-backed [`CacheStore`].
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.as_deref().and_then(Path::parent) {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Apply pending schema migrations.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Path to the database file, if the database is file-backed.
    pub fn db_path(&self) -> Option<&Path> {
        self.manager.db_path()
    }

    /// Number of rows in the history ledger for one dataset.
    pub fn history_len(&self, dataset: &str) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM history_entries WHERE dataset = ?",
            [dataset],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

impl CacheStore for Warehouse {
    fn cache_get(&self, key: &str) -> Result<CacheLookup, WarehouseError> {
        let connection = self.manager.acquire()?;
        let updated = connection.execute(
            "UPDATE cache_entries SET hit_count = hit_count + 1 WHERE key = ?",
            [key],
        )?;
        if updated == 0 {
            debug!(key, "cache miss");
            return Ok(CacheLookup::miss());
        }

        let row = connection
            .query_row(
                "SELECT payload, stale, expires_at_ms FROM cache_entries WHERE key = ?",
                [key],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((payload, stale, expires_at_ms)) = row else {
            return Ok(CacheLookup::miss());
        };
        let expired = now_millis() >= expires_at_ms;
        debug!(key, stale = stale || expired, "cache hit");
        Ok(CacheLookup {
            payload: Some(payload),
            stale: stale || expired,
        })
    }

    fn cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let row = connection
            .query_row(
                "SELECT key, payload, created_at_ms, expires_at_ms, source, stale, hit_count \
                 FROM cache_entries WHERE key = ?",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, payload, created_at_ms, expires_at_ms, source, stale, hit_count)) = row
        else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            created_at: from_millis(created_at_ms, "created_at", &key)?,
            expires_at: from_millis(expires_at_ms, "expires_at", &key)?,
            key,
            payload,
            source,
            stale,
            hit_count: u64::try_from(hit_count).unwrap_or_default(),
        }))
    }

    fn cache_set(
        &self,
        key: &str,
        payload: &[u8],
        source: &str,
        ttl_seconds: u64,
    ) -> Result<(), WarehouseError> {
        let created_at_ms = now_millis();
        let ttl_ms = i64::try_from(ttl_seconds.saturating_mul(1_000)).unwrap_or(i64::MAX);
        let expires_at_ms = created_at_ms.saturating_add(ttl_ms);

        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 5] = [&key, &payload, &created_at_ms, &expires_at_ms, &source];
        connection.execute(
            "INSERT OR REPLACE INTO cache_entries \
             (key, payload, created_at_ms, expires_at_ms, source, stale, hit_count) \
             VALUES (?, ?, ?, ?, ?, FALSE, 0)",
            params.as_slice(),
        )?;
        debug!(key, source, ttl_seconds, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    fn cache_delete(&self, key: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let deleted = connection.execute("DELETE FROM cache_entries WHERE key = ?", [key])?;
        Ok(deleted > 0)
    }

    fn cache_clear(&self, source: Option<&str>) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        let deleted = match source {
            Some(source) => {
                connection.execute("DELETE FROM cache_entries WHERE source = ?", [source])?
            }
            None => connection.execute("DELETE FROM cache_entries", [] as [&dyn ToSql; 0])?,
        };
        debug!(source = source.unwrap_or("*"), deleted, "cache cleared");
        Ok(deleted)
    }

    fn cache_invalidate(&self, key: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let updated = connection.execute(
            "UPDATE cache_entries SET stale = TRUE WHERE key = ?",
            [key],
        )?;
        Ok(updated > 0)
    }

    fn history_save(&self, record: &HistoryRecord) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let reference_date = record.reference_date.to_string();
        let collected_at_ms = to_millis(record.collected_at);
        let params: [&dyn ToSql; 5] = [
            &record.dataset,
            &reference_date,
            &record.payload,
            &record.source,
            &collected_at_ms,
        ];
        connection.execute(
            "INSERT INTO history_entries \
             (dataset, reference_date, payload, source, collected_at_ms) \
             VALUES (?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    fn history_get(
        &self,
        dataset: &str,
        reference_date: Option<time::Date>,
    ) -> Result<Option<HistoryRecord>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut sql = String::from(
            "SELECT dataset, reference_date, payload, source, collected_at_ms \
             FROM history_entries WHERE dataset = ?",
        );
        let mut values = vec![dataset.to_owned()];
        if let Some(date) = reference_date {
            sql.push_str(" AND reference_date = ?");
            values.push(date.to_string());
        }
        sql.push_str(" ORDER BY collected_at_ms DESC, id DESC LIMIT 1");

        let row = connection
            .query_row(&sql, params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;

        let Some((dataset, reference_date, payload, source, collected_at_ms)) = row else {
            return Ok(None);
        };

        Ok(Some(HistoryRecord {
            reference_date: store::parse_date(&reference_date, "reference_date", &dataset)?,
            collected_at: from_millis(collected_at_ms, "collected_at", &dataset)?,
            dataset,
            payload,
            source,
        }))
    }

    fn indicators_upsert(&self, rows: &[IndicatorRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let mut written = 0;
            for row in rows {
                let date = row.date.to_string();
                let params: [&dyn ToSql; 6] = [
                    &row.product,
                    &date,
                    &row.value,
                    &row.unit,
                    &row.region,
                    &row.source,
                ];
                written += connection.execute(
                    "INSERT OR REPLACE INTO indicators \
                     (product, date, value, unit, region, source, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                    params.as_slice(),
                )?;
            }
            Ok(written)
        })();

        finalize_transaction(&connection, result)
    }

    fn indicators_query(
        &self,
        filter: &IndicatorFilter,
    ) -> Result<Vec<IndicatorRow>, WarehouseError> {
        let mut sql = String::from(
            "SELECT product, date, value, unit, region, source FROM indicators WHERE 1 = 1",
        );
        let mut values: Vec<String> = Vec::new();
        if let Some(product) = &filter.product {
            sql.push_str(" AND product = ?");
            values.push(product.clone());
        }
        if let Some(source) = &filter.source {
            sql.push_str(" AND source = ?");
            values.push(source.clone());
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND date >= ?");
            values.push(start.to_string());
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND date <= ?");
            values.push(end.to_string());
        }
        sql.push_str(" ORDER BY product, date");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(&sql)?;
        let mut cursor = statement.query(params_from_iter(values.iter()))?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next()? {
            let product: String = row.get(0)?;
            let date: String = row.get(1)?;
            rows.push(IndicatorRow {
                date: store::parse_date(&date, "date", &product)?,
                product,
                value: row.get(2)?,
                unit: row.get(3)?,
                region: row.get(4)?,
                source: row.get(5)?,
            });
        }
        Ok(rows)
    }
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &::duckdb::Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(
    millis: i64,
    field: &'static str,
    key: &str,
) -> Result<OffsetDateTime, WarehouseError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).map_err(|error| {
        WarehouseError::Corrupt {
            field,
            key: key.to_owned(),
            reason: error.to_string(),
        }
    })
}

/// Resolve the safra home directory from environment or default.
fn resolve_safra_home() -> PathBuf {
    if let Some(path) = env::var_os("SAFRA_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".safra");
    }

    PathBuf::from(".safra")
}
