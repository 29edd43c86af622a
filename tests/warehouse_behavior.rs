//! Behavior-driven tests for Warehouse behavior
//!
//! These tests verify HOW the DuckDB warehouse stores cached payloads, the
//! history ledger and indicator series, focusing on what the acquisition
//! layer observes.

use safra_core::{
    CacheStore, HistoryRecord, IndicatorFilter, IndicatorRow, Warehouse, WarehouseConfig,
};
use tempfile::tempdir;
use time::macros::{date, datetime};

fn file_warehouse(dir: &std::path::Path) -> Warehouse {
    Warehouse::open(WarehouseConfig {
        safra_home: dir.to_path_buf(),
        db_path: Some(dir.join("cache").join("warehouse.duckdb")),
        max_pool_size: 2,
    })
    .expect("warehouse open")
}

// =============================================================================
// Warehouse: Payload Cache
// =============================================================================

#[test]
fn when_payload_is_cached_reads_return_it_and_count_hits() {
    // Given: A fresh warehouse
    let temp = tempdir().expect("tempdir");
    let warehouse = file_warehouse(temp.path());

    // When: A payload is written and read twice
    warehouse
        .cache_set("cepea_indicador:boi_gordo", b"310.55", "cepea", 3_600)
        .expect("set");
    let first = warehouse.cache_get("cepea_indicador:boi_gordo").expect("get");
    let second = warehouse.cache_get("cepea_indicador:boi_gordo").expect("get");

    // Then: Both reads hit, fresh, and the counter reflects them
    assert_eq!(first.payload.as_deref(), Some(&b"310.55"[..]));
    assert!(!first.stale);
    assert!(second.is_hit());
    let entry = warehouse
        .cache_entry("cepea_indicador:boi_gordo")
        .expect("entry")
        .expect("present");
    assert_eq!(entry.hit_count, 2);
    assert_eq!(entry.source, "cepea");
    assert!(entry.expires_at > entry.created_at);
}

#[test]
fn when_key_was_never_written_the_lookup_is_a_miss() {
    // Given: An empty in-memory warehouse
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");

    // When: Reading an unknown key
    let lookup = warehouse.cache_get("ibge_pam:soja").expect("get");

    // Then: Miss, not stale, and nothing was created
    assert!(!lookup.is_hit());
    assert!(!lookup.stale);
    assert!(warehouse.cache_entry("ibge_pam:soja").expect("entry").is_none());
}

#[test]
fn when_entry_is_invalidated_the_payload_is_kept_but_flagged_stale() {
    // Given: A cached payload
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    warehouse
        .cache_set("conab_precos:milho", b"58.10", "conab", 86_400)
        .expect("set");

    // When: It is invalidated
    let existed = warehouse.cache_invalidate("conab_precos:milho").expect("invalidate");

    // Then: The payload is still readable, flagged stale, until overwritten
    assert!(existed);
    let lookup = warehouse.cache_get("conab_precos:milho").expect("get");
    assert_eq!(lookup.payload.as_deref(), Some(&b"58.10"[..]));
    assert!(lookup.stale);

    warehouse
        .cache_set("conab_precos:milho", b"59.00", "conab", 86_400)
        .expect("overwrite");
    let entry = warehouse
        .cache_entry("conab_precos:milho")
        .expect("entry")
        .expect("present");
    assert!(!entry.stale);
    assert_eq!(entry.hit_count, 0);
}

#[test]
fn when_zero_ttl_is_written_reads_report_the_entry_as_stale() {
    // Given: An entry that expires immediately
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    warehouse
        .cache_set("inmet:A001", b"{}", "inmet", 0)
        .expect("set");

    // When: It is read
    let lookup = warehouse.cache_get("inmet:A001").expect("get");

    // Then: Payload present, flagged stale
    assert!(lookup.is_hit());
    assert!(lookup.stale);
}

#[test]
fn when_cache_is_cleared_by_source_other_sources_survive() {
    // Given: Entries from two sources
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    for key in ["cepea:boi", "cepea:soja", "cepea:cafe"] {
        warehouse.cache_set(key, b"x", "cepea", 60).expect("set");
    }
    warehouse.cache_set("conab:milho", b"y", "conab", 60).expect("set");

    // When: Only CEPEA is cleared, then one CONAB key is deleted
    let cleared = warehouse.cache_clear(Some("cepea")).expect("clear");
    let deleted = warehouse.cache_delete("conab:milho").expect("delete");
    let deleted_again = warehouse.cache_delete("conab:milho").expect("delete");

    // Then: Counts are reported and the store ends empty
    assert_eq!(cleared, 3);
    assert!(deleted);
    assert!(!deleted_again);
    assert_eq!(warehouse.cache_clear(None).expect("clear all"), 0);
}

#[test]
fn when_warehouse_is_reopened_cached_payloads_persist() {
    // Given: A file-backed warehouse with one entry
    let temp = tempdir().expect("tempdir");
    {
        let warehouse = file_warehouse(temp.path());
        warehouse
            .cache_set("bcb:ptax", b"5.12", "bcb", 86_400)
            .expect("set");
    }

    // When: It is opened again
    let reopened = file_warehouse(temp.path());

    // Then: The payload survived and the database file is where configured
    let lookup = reopened.cache_get("bcb:ptax").expect("get");
    assert_eq!(lookup.payload.as_deref(), Some(&b"5.12"[..]));
    assert!(reopened
        .db_path()
        .expect("file backed")
        .ends_with("cache/warehouse.duckdb"));
}

// =============================================================================
// Warehouse: History Ledger
// =============================================================================

fn snapshot(day: time::Date, payload: &[u8], collected_at: time::OffsetDateTime) -> HistoryRecord {
    HistoryRecord {
        dataset: String::from("cepea_indicador:boi_gordo"),
        reference_date: day,
        payload: payload.to_vec(),
        source: String::from("cepea"),
        collected_at,
    }
}

#[test]
fn when_history_is_queried_by_date_the_latest_snapshot_of_that_day_wins() {
    // Given: Three snapshots over two days
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    warehouse
        .history_save(&snapshot(date!(2024 - 06 - 10), b"morning", datetime!(2024-06-10 09:00 UTC)))
        .expect("save");
    warehouse
        .history_save(&snapshot(date!(2024 - 06 - 10), b"evening", datetime!(2024-06-10 21:00 UTC)))
        .expect("save");
    warehouse
        .history_save(&snapshot(date!(2024 - 06 - 11), b"next", datetime!(2024-06-11 21:00 UTC)))
        .expect("save");

    // When: Replaying a date, the latest overall, and an unrecorded date
    let on_tenth = warehouse
        .history_get("cepea_indicador:boi_gordo", Some(date!(2024 - 06 - 10)))
        .expect("get")
        .expect("present");
    let latest = warehouse
        .history_get("cepea_indicador:boi_gordo", None)
        .expect("get")
        .expect("present");
    let missing = warehouse
        .history_get("cepea_indicador:boi_gordo", Some(date!(2024 - 06 - 01)))
        .expect("get");

    // Then: Nothing was overwritten and each query sees the right snapshot
    assert_eq!(on_tenth.payload, b"evening");
    assert_eq!(on_tenth.collected_at, datetime!(2024-06-10 21:00 UTC));
    assert_eq!(latest.payload, b"next");
    assert!(missing.is_none());
    assert_eq!(warehouse.history_len("cepea_indicador:boi_gordo").expect("len"), 3);
}

// =============================================================================
// Warehouse: Indicator Series
// =============================================================================

fn point(product: &str, day: time::Date, value: f64) -> IndicatorRow {
    IndicatorRow {
        product: product.to_owned(),
        date: day,
        value,
        unit: Some(String::from("R$/sc 60kg")),
        region: Some(String::from("Paranagua")),
        source: String::from("cepea"),
    }
}

#[test]
fn when_indicator_points_are_upserted_the_latest_value_per_day_is_kept() {
    // Given: A series with one corrected point
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    warehouse
        .indicators_upsert(&[
            point("soja", date!(2024 - 06 - 10), 131.20),
            point("soja", date!(2024 - 06 - 11), 132.05),
            point("milho", date!(2024 - 06 - 10), 58.40),
        ])
        .expect("upsert");
    warehouse
        .indicators_upsert(&[point("soja", date!(2024 - 06 - 11), 132.50)])
        .expect("correction");

    // When: Querying soja
    let soja = warehouse
        .indicators_query(&IndicatorFilter::for_product("soja"))
        .expect("query");

    // Then: Two points in date order, the corrected value replacing the first
    assert_eq!(soja.len(), 2);
    assert_eq!(soja[0].date, date!(2024 - 06 - 10));
    assert_eq!(soja[1].value, 132.50);
    assert_eq!(soja[1].unit.as_deref(), Some("R$/sc 60kg"));
}

#[test]
fn when_indicators_are_filtered_by_range_only_matching_points_return() {
    // Given: A week of points
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse");
    let rows: Vec<_> = (10..=16)
        .map(|day| {
            let day = time::Date::from_calendar_date(2024, time::Month::June, day).expect("date");
            point("cafe", day, 1_300.0 + f64::from(day.day()))
        })
        .collect();
    assert_eq!(warehouse.indicators_upsert(&rows).expect("upsert"), 7);

    // When: Filtering by range with a limit
    let filter = IndicatorFilter {
        start: Some(date!(2024 - 06 - 12)),
        end: Some(date!(2024 - 06 - 15)),
        limit: Some(3),
        ..IndicatorFilter::for_product("cafe")
    };
    let window = warehouse.indicators_query(&filter).expect("query");

    // Then: The first three points inside the range
    let days: Vec<u8> = window.iter().map(|row| row.date.day()).collect();
    assert_eq!(days, vec![12, 13, 14]);
}
