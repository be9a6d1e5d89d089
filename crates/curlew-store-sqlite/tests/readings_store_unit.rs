// crates/curlew-store-sqlite/tests/readings_store_unit.rs
// ============================================================================
// Module: Readings Store Unit Tests
// Description: Targeted tests for the catalogue, engine, and purge.
// Purpose: Validate table allocation, global ID recovery, retrieval paths,
//          and retention behavior against real database files.
// ============================================================================

//! ## Overview
//! Unit-level tests for the readings store invariants:
//! - Append/fetch round trip and global ID assignment
//! - Per-asset table allocation and new-database expansion
//! - Timebucket-all aggregation shape
//! - Purge by age, keep-unsent clamping, and purge by rows
//! - Global ID crash recovery and clean restart
//! - Statistics table operations

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::Path;

use curlew_core::Reading;
use curlew_core::StatisticsSink;
use curlew_core::UserTimestamp;
use curlew_core::stream::encode_frame;
use curlew_store_sqlite::MAX_PURGE_BLOCK_SIZE;
use curlew_store_sqlite::MIN_PURGE_BLOCK_SIZE;
use curlew_store_sqlite::SqliteReadingsStore;
use curlew_store_sqlite::SqliteStoreConfig;
use rusqlite::Connection;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use time::Duration;
use time::OffsetDateTime;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn config_for(dir: &Path) -> SqliteStoreConfig {
    SqliteStoreConfig {
        data_dir: dir.to_path_buf(),
        pool_size: 2,
        readings_to_allocate: 3,
        busy_timeout_ms: 1_000,
    }
}

fn open_store(dir: &Path) -> SqliteReadingsStore {
    SqliteReadingsStore::open(&config_for(dir)).expect("open store")
}

fn reading(asset: &str, user_ts: &str, payload: Value) -> Reading {
    Reading::new(asset, UserTimestamp::parse(user_ts).expect("timestamp"), payload)
        .expect("reading")
}

fn reading_at(asset: &str, instant: OffsetDateTime, payload: Value) -> Reading {
    Reading::new(asset, UserTimestamp::At(instant), payload).expect("reading")
}

fn hours_ago(hours: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() - Duration::hours(hours)
}

fn rows(result: &Value) -> &Vec<Value> {
    result["rows"].as_array().expect("rows array")
}

/// Counts rows in the first readings database matching an age cutoff, via a
/// side connection independent of the store.
fn count_older_than(dir: &Path, table: &str, age_hours: i64) -> i64 {
    let conn = Connection::open(dir.join("readings_1.db")).expect("side connection");
    conn.query_row(
        &format!("SELECT count(*) FROM {table} WHERE user_ts < datetime('now', '-{age_hours} hours')"),
        [],
        |row| row.get(0),
    )
    .expect("count")
}

// ============================================================================
// SECTION: Append and Fetch
// ============================================================================

#[test]
fn single_reading_round_trips_with_id_one() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let outcome = store
        .append(&[reading("T1", "2024-01-01 00:00:00.000000", json!({"x": 1}))])
        .expect("append");
    assert_eq!(outcome.inserted, 1);

    let fetched = store.fetch_readings(1, 10).expect("fetch");
    assert_eq!(fetched["count"], json!(1));
    let row = &rows(&fetched)[0];
    assert_eq!(row["id"], json!(1));
    assert_eq!(row["asset_code"], json!("T1"));
    assert_eq!(row["reading"], json!({"x": 1}));
    assert_eq!(row["user_ts"], json!("2024-01-01 00:00:00.000000"));
}

#[test]
fn multi_asset_batch_allocates_one_table_per_asset() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch = [
        reading("A", "2024-01-01 00:00:00", json!({"v": 1})),
        reading("B", "2024-01-01 00:00:01", json!({"v": 2})),
        reading("A", "2024-01-01 00:00:02", json!({"v": 3})),
    ];
    assert_eq!(store.append(&batch).expect("append").inserted, 3);

    let entries = store.catalogue().entries();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].table.table_id, entries[1].table.table_id);

    let fetched = store.fetch_readings(1, 10).expect("fetch");
    let ids: Vec<i64> = rows(&fetched).iter().map(|row| row["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    let assets: Vec<&str> =
        rows(&fetched).iter().map(|row| row["asset_code"].as_str().unwrap()).collect();
    assert_eq!(assets, vec!["A", "B", "A"]);
}

#[test]
fn exhausting_preallocated_tables_expands_into_a_new_database() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    for (index, asset) in ["a1", "a2", "a3", "a4", "a5"].iter().enumerate() {
        let batch = [reading(asset, "2024-01-01 00:00:00", json!({"i": index}))];
        store.append(&batch).expect("append");
    }
    assert!(dir.path().join("readings_2.db").exists(), "second readings db created");

    let entries = store.catalogue().entries();
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().any(|entry| entry.table.db_id == 2), "entries span both databases");

    let fetched = store.fetch_readings(1, 10).expect("fetch");
    assert_eq!(fetched["count"], json!(5));
}

#[test]
fn malformed_json_readings_are_skipped_not_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let payload = json!({"readings": [
        {"asset_code": "ok", "user_ts": "2024-01-01 00:00:00", "reading": {"v": 1}},
        {"asset_code": "bad", "user_ts": "not-a-date", "reading": {"v": 2}},
        {"asset_code": "ok", "user_ts": "2024-01-01 00:00:01", "reading": 5}
    ]})
    .to_string();
    let outcome = store.append_readings_json(&payload).expect("append");
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.skipped, 2);
}

#[test]
fn reading_stream_frames_are_persisted() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let mut buffer = encode_frame(&reading("pump", "2024-01-01 10:00:00.500000", json!({"v": 1})));
    buffer.extend_from_slice(&encode_frame(&reading(
        "pump",
        "2024-01-01 10:00:01.500000",
        json!({"v": 2}),
    )));
    let outcome = store.reading_stream(&buffer).expect("stream");
    assert_eq!(outcome.inserted, 2);

    let fetched = store.fetch_readings(1, 10).expect("fetch");
    assert_eq!(fetched["count"], json!(2));
    assert_eq!(rows(&fetched)[0]["user_ts"], json!("2024-01-01 10:00:00.500000"));
}

// ============================================================================
// SECTION: Global ID Lifecycle
// ============================================================================

#[test]
fn clean_shutdown_resumes_from_last_issued_id() {
    let dir = TempDir::new().expect("tempdir");
    {
        let store = open_store(dir.path());
        let batch: Vec<Reading> = (0 .. 3)
            .map(|index| reading("restart", "2024-01-01 00:00:00", json!({"i": index})))
            .collect();
        store.append(&batch).expect("append");
        store.shutdown().expect("shutdown");
    }
    let store = open_store(dir.path());
    assert_eq!(store.catalogue().peek_next_id(), 4);
}

#[test]
fn crash_recovery_recomputes_next_id_from_max() {
    let dir = TempDir::new().expect("tempdir");
    {
        let store = open_store(dir.path());
        let batch: Vec<Reading> = (0 .. 42)
            .map(|index| reading("crash", "2024-01-01 00:00:00", json!({"i": index})))
            .collect();
        store.append(&batch).expect("append");
        // No shutdown: the stored global id keeps the -1 crash marker.
    }
    let store = open_store(dir.path());
    assert_eq!(store.catalogue().peek_next_id(), 43);
    store.append(&[reading("crash", "2024-01-01 00:01:00", json!({"post": 1}))]).expect("append");
    let fetched = store.fetch_readings(43, 10).expect("fetch");
    assert_eq!(fetched["count"], json!(1));
    assert_eq!(rows(&fetched)[0]["id"], json!(43));
}

// ============================================================================
// SECTION: Retrieval
// ============================================================================

#[test]
fn timebucket_all_aggregates_every_datapoint() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch = [
        reading("TB", "2024-01-01 00:00:05.000000", json!({"v": 10})),
        reading("TB", "2024-01-01 00:00:10.000000", json!({"v": 20})),
        reading("TB", "2024-01-01 00:00:20.000000", json!({"v": 30})),
    ];
    store.append(&batch).expect("append");

    let condition = json!({
        "aggregate": {"operation": "all"},
        "timebucket": {"timestamp": "user_ts", "size": "60"},
        "where": {"column": "asset_code", "condition": "=", "value": "TB"}
    })
    .to_string();
    let result = store.retrieve_readings(&condition).expect("retrieve");
    assert_eq!(result["count"], json!(1));
    let summary = &rows(&result)[0]["reading"]["v"];
    assert_eq!(summary["min"].as_f64().unwrap(), 10.0);
    assert_eq!(summary["max"].as_f64().unwrap(), 30.0);
    assert_eq!(summary["average"].as_f64().unwrap(), 20.0);
    assert_eq!(summary["count"].as_i64().unwrap(), 3);
    assert_eq!(summary["sum"].as_f64().unwrap(), 60.0);
}

#[test]
fn aggregate_projection_over_json_datapoint() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch = [
        reading("agg", "2024-01-01 00:00:00", json!({"v": 10})),
        reading("agg", "2024-01-01 00:01:00", json!({"v": 30})),
    ];
    store.append(&batch).expect("append");

    let condition = json!({
        "aggregate": [
            {"operation": "min", "json": {"column": "reading", "properties": "v"}},
            {"operation": "max", "json": {"column": "reading", "properties": "v"}},
            {"operation": "count", "column": "id"}
        ],
        "where": {"column": "asset_code", "condition": "=", "value": "agg"}
    })
    .to_string();
    let result = store.retrieve_readings(&condition).expect("retrieve");
    let row = &rows(&result)[0];
    assert_eq!(row["min_v"], json!(10));
    assert_eq!(row["max_v"], json!(30));
    assert_eq!(row["count_id"], json!(2));
}

#[test]
fn return_projection_renders_utc_and_aliases() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    store
        .append(&[reading("proj", "2024-06-01 12:00:00.250000", json!({"v": 7}))])
        .expect("append");

    let condition = json!({
        "return": [
            "asset_code",
            {"column": "user_ts", "timezone": "utc", "alias": "stamp"},
            {"json": {"column": "reading", "properties": "v"}, "alias": "value"}
        ],
        "where": {"column": "asset_code", "condition": "=", "value": "proj"},
        "limit": 5
    })
    .to_string();
    let result = store.retrieve_readings(&condition).expect("retrieve");
    let row = &rows(&result)[0];
    assert_eq!(row["asset_code"], json!("proj"));
    assert_eq!(row["stamp"], json!("2024-06-01 12:00:00.250000"));
    assert_eq!(row["value"], json!(7));
}

#[test]
fn empty_condition_dumps_all_readings() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch = [
        reading("d1", "2024-01-01 00:00:00", json!({"v": 1})),
        reading("d2", "2024-01-01 00:00:01", json!({"v": 2})),
    ];
    store.append(&batch).expect("append");
    let result = store.retrieve_readings("").expect("retrieve");
    assert_eq!(result["count"], json!(2));
    for row in rows(&result) {
        assert!(row["id"].is_i64());
        assert!(row["reading"].is_object());
        assert!(row["user_ts"].is_string());
    }
}

#[test]
fn unknown_where_condition_fails_closed() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    store.append(&[reading("x", "2024-01-01 00:00:00", json!({"v": 1}))]).expect("append");
    let condition = json!({
        "where": {"column": "asset_code", "condition": "matches", "value": "x"}
    })
    .to_string();
    assert!(store.retrieve_readings(&condition).is_err());
}

// ============================================================================
// SECTION: Purge
// ============================================================================

#[test]
fn purge_by_age_removes_exactly_the_over_age_rows() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let total = 1_000;
    let batch: Vec<Reading> = (0 .. total)
        .map(|index| reading_at("aged", hours_ago(total - index), json!({"i": index})))
        .collect();
    assert_eq!(store.append(&batch).expect("append").inserted, total as usize);

    let table = store.catalogue().entries()[0].table;
    let expected = count_older_than(dir.path(), &format!("readings_{}", table.table_id), 60);
    assert!(expected > 0, "seed data must span the cutoff");

    let result = store.purge_readings_by_age(60, 0, false).expect("purge");
    assert_eq!(result.removed, expected as u64);
    assert_eq!(result.readings, (total as u64) - result.removed);
    assert_eq!(
        count_older_than(dir.path(), &format!("readings_{}", table.table_id), 60),
        0,
        "no over-age row survives"
    );
    let size = store.state().purge_block_size();
    assert!((MIN_PURGE_BLOCK_SIZE ..= MAX_PURGE_BLOCK_SIZE).contains(&size));
}

#[test]
fn purge_by_age_with_keep_unsent_stops_at_the_watermark() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let total = 100;
    let batch: Vec<Reading> = (0 .. total)
        .map(|index| reading_at("held", hours_ago(total - index), json!({"i": index})))
        .collect();
    store.append(&batch).expect("append");

    // Every row with id <= 50 is old enough to purge; ids above the
    // watermark must survive untouched.
    let result = store.purge_readings_by_age(10, 50, true).expect("purge");
    assert_eq!(result.removed, 50);
    assert_eq!(result.unsent_purged, 0);
    assert_eq!(result.unsent_retained, 50);
    assert_eq!(result.readings, 50);

    let fetched = store.fetch_readings(1, 10).expect("fetch");
    assert_eq!(rows(&fetched)[0]["id"], json!(51));
}

#[test]
fn purge_by_rows_keeps_the_requested_row_count() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch: Vec<Reading> = (0 .. 100)
        .map(|index| reading_at("bulk", hours_ago(100 - index), json!({"i": index})))
        .collect();
    store.append(&batch).expect("append");

    let result = store.purge_readings_by_rows(40, 0, false).expect("purge");
    assert_eq!(result.removed, 60);
    assert_eq!(result.readings, 40);
    let fetched = store.fetch_readings(1, 10).expect("fetch");
    assert_eq!(rows(&fetched)[0]["id"], json!(61));
}

#[test]
fn purge_with_zero_age_derives_age_from_oldest_reading() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    let batch: Vec<Reading> = (0 .. 10)
        .map(|index| reading_at("derive", hours_ago(1_000 - index * 100), json!({"i": index})))
        .collect();
    store.append(&batch).expect("append");

    // The derived age is (now - oldest)/360: ten times the span of the data
    // in hours, so the derived cutoff sits before the oldest reading and
    // the purge is a no-op rather than an error.
    let result = store.purge_readings_by_age(0, 0, false).expect("purge");
    assert_eq!(result.removed, 0);
    assert_eq!(result.readings, 10);
}

// ============================================================================
// SECTION: Statistics
// ============================================================================

#[test]
fn statistics_rows_accumulate_deltas() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(dir.path());
    store.ensure_statistic("PUMP", "Readings received from asset pump").expect("ensure");
    store.ensure_statistic("PUMP", "Readings received from asset pump").expect("idempotent");
    store
        .bump_statistics(&[("PUMP".to_string(), 5), ("PUMP".to_string(), 2)])
        .expect("bump");

    let conn = Connection::open(dir.path().join("curlew.db")).expect("side connection");
    let value: i64 = conn
        .query_row("SELECT value FROM statistics WHERE key = 'PUMP'", [], |row| row.get(0))
        .expect("value");
    assert_eq!(value, 7);
}
