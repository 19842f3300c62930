//! Integration tests for the change-compacted store lifecycle.
//!
//! These exercise compaction, persistence across reopen, timestamp ordering
//! under clamping, and reader isolation against a live writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use tempfile::tempdir;
use tidemark::error::{RecordError, TidemarkError};
use tidemark::query::parse_timestamp;
use tidemark::store::{InsertOutcome, LevelStore, StoreOptions};

fn base_time() -> NaiveDateTime {
    parse_timestamp("2024-06-01 08:00:00").unwrap()
}

#[test]
fn test_compaction_row_count() {
    let temp_dir = tempdir().unwrap();
    let mut store =
        LevelStore::open(temp_dir.path().join("data.db"), StoreOptions::default()).unwrap();

    let levels = [1.2, 1.2, 1.2, 1.5, 1.5, 2.0, 2.0, 2.0, 1.2];
    let mut changes = 0;
    for (i, level) in (0i64..).zip(levels) {
        let ts = base_time() + TimeDelta::minutes(10 * i);
        let outcome = store.insert_measurement(level, level * 20.0, ts).unwrap();
        if matches!(outcome, InsertOutcome::Transition { .. }) {
            changes += 1;
        }
    }

    assert_eq!(changes, 3);
    assert_eq!(store.count().unwrap(), 1 + 2 * changes);

    // No two consecutive run starts share a level
    let rows = store.all().unwrap();
    let starts: Vec<f64> = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, r)| r.level)
        .collect();
    assert_eq!(starts, vec![1.2, 1.5, 2.0, 1.2]);
    assert!(starts.windows(2).all(|w| w[0] != w[1]));
}

#[test]
fn test_repeated_level_adds_no_rows() {
    let temp_dir = tempdir().unwrap();
    let mut store =
        LevelStore::open(temp_dir.path().join("data.db"), StoreOptions::default()).unwrap();

    assert_eq!(
        store.insert_measurement(1.553, 33.703, base_time()).unwrap(),
        InsertOutcome::First
    );
    for i in 1..=50 {
        let ts = base_time() + TimeDelta::minutes(2 * i);
        assert_eq!(
            store.insert_measurement(1.553, 33.703, ts).unwrap(),
            InsertOutcome::Unchanged
        );
    }

    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_transition_writes_backdated_boundary() {
    let temp_dir = tempdir().unwrap();
    let mut store =
        LevelStore::open(temp_dir.path().join("data.db"), StoreOptions::default()).unwrap();

    let t0 = base_time();
    let t1 = t0 + TimeDelta::hours(3);
    store.insert_measurement(1.553, 33.703, t0).unwrap();
    let outcome = store.insert_measurement(2.333, 48.918, t1).unwrap();

    assert_eq!(
        outcome,
        InsertOutcome::Transition {
            boundary: t1 - TimeDelta::minutes(1),
            clamped: false,
        }
    );

    let rows = store.all().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].timestamp, t1 - TimeDelta::minutes(1));
    assert_eq!(rows[1].level, 1.553);
    assert_eq!(rows[1].volume, 33.703);
    assert_eq!(rows[2].timestamp, t1);
    assert_eq!(rows[2].level, 2.333);
    assert!(rows[0].id < rows[1].id && rows[1].id < rows[2].id);
}

#[test]
fn test_timestamps_strictly_increase_under_clamping() {
    let temp_dir = tempdir().unwrap();
    let options = StoreOptions {
        boundary_offset: Duration::from_secs(600),
        ..StoreOptions::default()
    };
    let mut store = LevelStore::open(temp_dir.path().join("data.db"), options).unwrap();

    // Every change arrives well inside the ten-minute offset
    let mut clamped = 0;
    for i in 0..20 {
        let ts = base_time() + TimeDelta::seconds(30 * i);
        #[allow(clippy::cast_precision_loss)]
        let level = (i % 3) as f64;
        if let InsertOutcome::Transition { clamped: true, .. } =
            store.insert_measurement(level, level, ts).unwrap()
        {
            clamped += 1;
        }
    }
    assert_eq!(clamped, 19);

    let rows = store.all().unwrap();
    assert!(
        rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp),
        "persisted timestamps must strictly increase"
    );

    // Rows by id order match rows by time order
    let mut by_id = rows.clone();
    by_id.sort_by_key(|r| r.id);
    assert_eq!(by_id, rows);
}

#[test]
fn test_non_monotonic_transition_writes_nothing() {
    let temp_dir = tempdir().unwrap();
    let mut store =
        LevelStore::open(temp_dir.path().join("data.db"), StoreOptions::default()).unwrap();

    store.insert_measurement(1.0, 10.0, base_time()).unwrap();

    // Clock stepped backwards
    let err = store
        .insert_measurement(2.0, 20.0, base_time() - TimeDelta::minutes(5))
        .unwrap_err();
    assert!(matches!(
        err,
        TidemarkError::Record(RecordError::NonMonotonic { .. })
    ));
    assert_eq!(store.count().unwrap(), 1);

    // Store still accepts later measurements
    store
        .insert_measurement(2.0, 20.0, base_time() + TimeDelta::minutes(5))
        .unwrap();
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn test_reopen_continues_last_run() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.db");

    {
        let mut store = LevelStore::open(&path, StoreOptions::default()).unwrap();
        store.insert_measurement(1.0, 10.0, base_time()).unwrap();
    }

    let mut store = LevelStore::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(
        store
            .insert_measurement(1.0, 10.0, base_time() + TimeDelta::hours(1))
            .unwrap(),
        InsertOutcome::Unchanged
    );
    assert!(matches!(
        store
            .insert_measurement(1.1, 11.0, base_time() + TimeDelta::hours(2))
            .unwrap(),
        InsertOutcome::Transition { .. }
    ));
    assert_eq!(store.count().unwrap(), 3);

    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest.level, 1.1);
}

#[test]
fn test_read_only_store_sees_writes() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.db");

    let mut writer = LevelStore::open(&path, StoreOptions::default()).unwrap();
    writer.insert_measurement(1.0, 10.0, base_time()).unwrap();

    let reader = LevelStore::open_read_only(&path).unwrap();
    assert_eq!(reader.count().unwrap(), 1);

    writer
        .insert_measurement(2.0, 20.0, base_time() + TimeDelta::hours(1))
        .unwrap();
    assert_eq!(reader.count().unwrap(), 3);

    // Readers cannot write
    let mut reader = reader;
    assert!(
        reader
            .insert_measurement(3.0, 30.0, base_time() + TimeDelta::hours(2))
            .is_err()
    );
}

#[test]
fn test_concurrent_reader_never_sees_half_a_pair() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("data.db");

    let mut writer = LevelStore::open(&path, StoreOptions::default()).unwrap();
    writer.insert_measurement(0.0, 0.0, base_time()).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader_done = Arc::clone(&done);
    let reader_path = path.clone();
    let reader = thread::spawn(move || {
        let reader = LevelStore::open_read_only(&reader_path).unwrap();
        let mut observations = 0;
        loop {
            let count = reader.count().unwrap();
            assert_eq!(count % 2, 1, "observed {count} rows: a transition was split");
            observations += 1;
            if reader_done.load(Ordering::Relaxed) {
                return observations;
            }
        }
    });

    for i in 1..=200 {
        let ts = base_time() + TimeDelta::minutes(10 * i);
        #[allow(clippy::cast_precision_loss)]
        let level = (i % 2) as f64;
        writer.insert_measurement(level, level, ts).unwrap();
    }
    done.store(true, Ordering::Relaxed);

    let observations = reader.join().unwrap();
    assert!(observations > 0);
    assert_eq!(writer.count().unwrap(), 401);
}
