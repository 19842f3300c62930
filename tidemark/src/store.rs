//! Change-compacted level history backed by SQLite.
//!
//! The store persists `(time, level, volume)` rows into a single append-only
//! table, writing only when the calibrated level changes. A constant level
//! over any number of measurement cycles costs at most two rows.
//!
//! # Runs
//!
//! A run is a maximal span during which the level is constant. It is stored
//! as the row that started it plus, once the next change is seen, a boundary
//! row carrying the run's level with a back-dated timestamp. The boundary
//! lets charts draw the run as a flat segment up to just before the change,
//! instead of interpolating across the whole gap.
//!
//! ```text
//! measurements   1.553  1.553  1.553  2.333
//! rows           1.553 ...............1.553' 2.333
//!                start                boundary start
//! ```
//!
//! Each insert is one of three transitions, decided by [`RunAction::decide`]:
//!
//! - empty store: insert the first row
//! - same level as the last row: no-op
//! - different level: insert the boundary row and the new row in one
//!   transaction, so a reader never sees only half of the pair
//!
//! # Timestamps
//!
//! Persisted timestamps are strictly increasing in insertion order. The
//! boundary timestamp is `timestamp - boundary_offset`, clamped into the open
//! interval between the previous row and the new measurement at one-second
//! resolution. When no such second exists the insert fails with
//! [`RecordError::NonMonotonic`] and nothing is written.
//!
//! # Concurrency
//!
//! One writer, any number of readers. The database runs in WAL mode so
//! readers opened with [`LevelStore::open_read_only`] see a consistent
//! snapshot while the writer commits.
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::store::{LevelStore, StoreOptions};
//! use tidemark::query::{Granularity, RangeCaps, TimeRange};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = LevelStore::open("data.db", StoreOptions::default())?;
//!
//! let now = chrono::Local::now().naive_local();
//! store.insert_measurement(1.553, 33.703, now)?;
//!
//! let range = TimeRange::from_bounds("2024-01-01".parse()?, "2024-12-31".parse()?)?;
//! let rows = store.query_raw(&range)?;
//! let daily = store.aggregate(&range, Granularity::Day, &RangeCaps::default())?;
//! println!("{} rows, {} daily buckets", rows.len(), daily.buckets.len());
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, SubsecRound, TimeDelta};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RecordError, Result, StoreError};
use crate::query::{
    self, Aggregation, Granularity, RangeCaps, Summary, TimeRange, format_timestamp,
};

/// Table and index bootstrap, applied on every writable open.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS data (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    time   TEXT NOT NULL,
    level  REAL NOT NULL,
    volume REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS data_time_idx ON data (time);
";

const SELECT_COLUMNS: &str = "SELECT id, time, level, volume FROM data";

/// Smallest gap between two persisted timestamps.
const TIMESTAMP_RESOLUTION: TimeDelta = TimeDelta::seconds(1);

/// Default busy timeout for lock contention between writer and readers.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelReading {
    /// Surrogate key in insertion order.
    pub id: i64,
    /// Local wall-clock time, second precision.
    pub timestamp: NaiveDateTime,
    /// Level in tank-height units.
    pub level: f64,
    /// Volume.
    pub volume: f64,
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The store was empty; the row starts the first run.
    First,
    /// The level matched the last row; nothing was written.
    Unchanged,
    /// The previous run was closed with a boundary row and a new run started.
    Transition {
        /// Timestamp written on the boundary row.
        boundary: NaiveDateTime,
        /// Whether the configured offset had to be clamped to keep order.
        clamped: bool,
    },
}

/// The write a measurement calls for, given the last persisted row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunAction {
    /// Insert the first row of an empty store.
    Start,
    /// The current run continues; write nothing.
    Continue,
    /// Close the current run at `boundary` and start a new one.
    Transition {
        /// Boundary row timestamp.
        boundary: NaiveDateTime,
        /// Whether `boundary` differs from `timestamp - offset`.
        clamped: bool,
        /// The last row of the run being closed. The boundary row repeats its
        /// level and volume.
        closing: LevelReading,
    },
}

impl RunAction {
    /// Decides the write for a measurement.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::NonMonotonic`] when the level changed but no
    /// boundary second fits strictly between `last` and `timestamp`.
    pub fn decide(
        last: Option<&LevelReading>,
        level: f64,
        timestamp: NaiveDateTime,
        offset: TimeDelta,
    ) -> Result<Self> {
        let Some(last) = last else {
            return Ok(Self::Start);
        };

        if level == last.level {
            return Ok(Self::Continue);
        }

        let earliest = last.timestamp + TIMESTAMP_RESOLUTION;
        let latest = timestamp - TIMESTAMP_RESOLUTION;
        if earliest > latest {
            return Err(RecordError::NonMonotonic {
                last: last.timestamp,
                attempted: timestamp,
            }
            .into());
        }

        let proposed = timestamp
            .checked_sub_signed(offset)
            .unwrap_or(NaiveDateTime::MIN);
        let boundary = proposed.clamp(earliest, latest);
        Ok(Self::Transition {
            boundary,
            clamped: boundary != proposed,
            closing: *last,
        })
    }
}

/// Tuning for a writable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How far before a level change the boundary row is dated.
    pub boundary_offset: Duration,
    /// How long to wait on a locked database.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::for_cycle(120)
    }
}

impl StoreOptions {
    /// Options for a measurement cycle of `cycle_seconds`.
    ///
    /// The boundary offset is `cycle_seconds / 120` whole minutes: one minute
    /// for the default two-minute cycle, zero for cycles under two minutes
    /// (the boundary is then clamped to one second before the change).
    pub fn for_cycle(cycle_seconds: u32) -> Self {
        Self {
            boundary_offset: Duration::from_secs(u64::from(cycle_seconds / 120) * 60),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Owned handle to the level history database.
///
/// Opened once at process start and passed by reference to the write path
/// and the read path. Dropping it closes the connection.
#[derive(Debug)]
pub struct LevelStore {
    conn: Connection,
    path: PathBuf,
    boundary_offset: TimeDelta,
}

impl LevelStore {
    /// Opens or creates a writable store.
    ///
    /// Creates the parent directory and the `data` table if needed and
    /// switches the database to WAL mode.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DirectoryAccess`] if the parent directory cannot be created
    /// - [`StoreError::Sqlite`] if the database cannot be opened or bootstrapped
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| StoreError::DirectoryAccess {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let existed = path.exists();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL)?;

        if existed {
            info!(path = %path.display(), journal_mode = %mode, "opened level store");
        } else {
            info!(path = %path.display(), journal_mode = %mode, "created level store");
        }

        Ok(Self {
            conn,
            path,
            boundary_offset: to_delta(options.boundary_offset),
        })
    }

    /// Opens an existing store for reading only.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the file does not exist
    /// - [`StoreError::Sqlite`] if it cannot be opened
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(StoreError::NotFound { path }.into());
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self {
            conn,
            path,
            boundary_offset: TimeDelta::zero(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a calibrated measurement, compacting unchanged levels.
    ///
    /// `timestamp` is truncated to whole seconds. The last row is read and
    /// the new rows are written inside one immediate transaction.
    ///
    /// # Errors
    ///
    /// - [`RecordError::InvalidValue`] if `level` or `volume` is not finite
    /// - [`RecordError::NonMonotonic`] if the transition cannot be written in order
    /// - [`StoreError::Sqlite`] if the transaction fails; nothing is written
    pub fn insert_measurement(
        &mut self,
        level: f64,
        volume: f64,
        timestamp: NaiveDateTime,
    ) -> Result<InsertOutcome> {
        for (name, value) in [("level", level), ("volume", volume)] {
            if !value.is_finite() {
                return Err(RecordError::InvalidValue {
                    value,
                    reason: format!("{name} must be finite"),
                }
                .into());
            }
        }

        let timestamp = timestamp.trunc_subsecs(0);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last = match tx
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT 1"),
                [],
                raw_row,
            )
            .optional()?
        {
            Some(raw) => Some(into_reading(raw)?),
            None => None,
        };

        let action = RunAction::decide(last.as_ref(), level, timestamp, self.boundary_offset)?;

        let outcome = match action {
            RunAction::Start => {
                insert_row(&tx, timestamp, level, volume)?;
                info!(time = %format_timestamp(timestamp), level, volume, "first measurement");
                InsertOutcome::First
            }
            RunAction::Continue => {
                debug!(time = %format_timestamp(timestamp), level, "level unchanged");
                InsertOutcome::Unchanged
            }
            RunAction::Transition {
                boundary,
                clamped,
                closing,
            } => {
                insert_row(&tx, boundary, closing.level, closing.volume)?;
                insert_row(&tx, timestamp, level, volume)?;
                if clamped {
                    warn!(
                        boundary = %format_timestamp(boundary),
                        last = %format_timestamp(closing.timestamp),
                        "boundary timestamp clamped to keep rows ordered"
                    );
                }
                info!(
                    time = %format_timestamp(timestamp),
                    from = closing.level,
                    to = level,
                    "level transition"
                );
                InsertOutcome::Transition { boundary, clamped }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Rows with `time` in `[range.start, range.end]`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure or a corrupt timestamp.
    pub fn query_raw(&self, range: &TimeRange) -> Result<Vec<LevelReading>> {
        self.select(
            &format!("{SELECT_COLUMNS} WHERE time BETWEEN ?1 AND ?2 ORDER BY time, id"),
            params![format_timestamp(range.start()), format_timestamp(range.end())],
        )
    }

    /// Aggregates rows in `[range.start, range.end_exclusive)` into buckets.
    ///
    /// If `caps` limits the span for `granularity`, the range start is moved
    /// forward and the returned [`Aggregation::adjustment`] says so.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure or a corrupt timestamp.
    pub fn aggregate(
        &self,
        range: &TimeRange,
        granularity: Granularity,
        caps: &RangeCaps,
    ) -> Result<Aggregation> {
        let (effective, adjustment) = caps.apply(*range, granularity);
        if let Some(adjustment) = &adjustment {
            debug!(%adjustment, "aggregate range narrowed");
        }

        let rows = self.select(
            &format!("{SELECT_COLUMNS} WHERE time >= ?1 AND time < ?2 ORDER BY time, id"),
            params![
                format_timestamp(effective.start()),
                format_timestamp(effective.end_exclusive())
            ],
        )?;

        Ok(Aggregation {
            granularity,
            start: effective.start(),
            end: effective.end_exclusive(),
            buckets: query::bucketize(&rows, granularity, effective),
            adjustment,
        })
    }

    /// Whole-range statistics over `[range.start, range.end]`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure or a corrupt timestamp.
    pub fn summary(&self, range: &TimeRange) -> Result<Option<Summary>> {
        Ok(query::summarize(&self.query_raw(range)?))
    }

    /// The row with the latest timestamp, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure or a corrupt timestamp.
    pub fn latest(&self) -> Result<Option<LevelReading>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY time DESC, id DESC LIMIT 1"),
                [],
                raw_row,
            )
            .optional()?;
        raw.map(into_reading).transpose()
    }

    /// Every row, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure or a corrupt timestamp.
    pub fn all(&self) -> Result<Vec<LevelReading>> {
        self.select(&format!("{SELECT_COLUMNS} ORDER BY time, id"), [])
    }

    /// Number of persisted rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM data", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn select<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<LevelReading>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let raws = stmt
            .query_map(params, raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(into_reading).collect()
    }
}

/// A row as stored, before timestamp parsing.
type RawRow = (i64, String, f64, f64);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_reading((id, time, level, volume): RawRow) -> Result<LevelReading> {
    let timestamp = query::parse_timestamp(&time)
        .map_err(|_| StoreError::CorruptTimestamp { id, value: time })?;
    Ok(LevelReading {
        id,
        timestamp,
        level,
        volume,
    })
}

fn insert_row(
    conn: &Connection,
    timestamp: NaiveDateTime,
    level: f64,
    volume: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO data (time, level, volume) VALUES (?1, ?2, ?3)",
        params![format_timestamp(timestamp), level, volume],
    )?;
    Ok(())
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidemarkError;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        query::parse_timestamp(s).unwrap()
    }

    fn row(t: &str, level: f64) -> LevelReading {
        LevelReading {
            id: 1,
            timestamp: ts(t),
            level,
            volume: 0.0,
        }
    }

    #[test]
    fn test_decide_start_and_continue() {
        let offset = TimeDelta::minutes(1);
        assert_eq!(
            RunAction::decide(None, 1.0, ts("2024-01-01 00:00:00"), offset).unwrap(),
            RunAction::Start
        );

        let last = row("2024-01-01 00:00:00", 1.0);
        assert_eq!(
            RunAction::decide(Some(&last), 1.0, ts("2024-01-01 00:02:00"), offset).unwrap(),
            RunAction::Continue
        );
        // Unchanged level never errors, even with an earlier timestamp
        assert_eq!(
            RunAction::decide(Some(&last), 1.0, ts("2023-12-31 00:00:00"), offset).unwrap(),
            RunAction::Continue
        );
    }

    #[test]
    fn test_decide_transition_uses_offset() {
        let last = LevelReading {
            id: 7,
            volume: 19.5,
            ..row("2024-01-01 00:00:00", 1.0)
        };
        let action = RunAction::decide(
            Some(&last),
            2.0,
            ts("2024-01-01 00:10:00"),
            TimeDelta::minutes(1),
        )
        .unwrap();
        assert_eq!(
            action,
            RunAction::Transition {
                boundary: ts("2024-01-01 00:09:00"),
                clamped: false,
                closing: last,
            }
        );
    }

    #[test]
    fn test_decide_clamps_boundary_after_last_row() {
        // Offset reaches back past the last row
        let last = row("2024-01-01 00:09:30", 1.0);
        let action = RunAction::decide(
            Some(&last),
            2.0,
            ts("2024-01-01 00:10:00"),
            TimeDelta::minutes(1),
        )
        .unwrap();
        assert_eq!(
            action,
            RunAction::Transition {
                boundary: ts("2024-01-01 00:09:31"),
                clamped: true,
                closing: last,
            }
        );
    }

    #[test]
    fn test_decide_clamps_zero_offset_before_new_row() {
        let last = row("2024-01-01 00:00:00", 1.0);
        let action = RunAction::decide(
            Some(&last),
            2.0,
            ts("2024-01-01 00:01:00"),
            TimeDelta::zero(),
        )
        .unwrap();
        assert_eq!(
            action,
            RunAction::Transition {
                boundary: ts("2024-01-01 00:00:59"),
                clamped: true,
                closing: last,
            }
        );
    }

    #[test]
    fn test_decide_rejects_when_no_room() {
        let last = row("2024-01-01 00:00:00", 1.0);
        for attempted in ["2024-01-01 00:00:01", "2024-01-01 00:00:00", "2023-12-31 23:00:00"] {
            let err = RunAction::decide(Some(&last), 2.0, ts(attempted), TimeDelta::minutes(1))
                .unwrap_err();
            assert!(matches!(
                err,
                TidemarkError::Record(RecordError::NonMonotonic { .. })
            ));
        }

        // Two seconds apart leaves exactly one boundary second
        let action = RunAction::decide(
            Some(&last),
            2.0,
            ts("2024-01-01 00:00:02"),
            TimeDelta::minutes(1),
        )
        .unwrap();
        assert_eq!(
            action,
            RunAction::Transition {
                boundary: ts("2024-01-01 00:00:01"),
                clamped: true,
                closing: last,
            }
        );
    }

    #[test]
    fn test_store_options_for_cycle() {
        assert_eq!(
            StoreOptions::for_cycle(120).boundary_offset,
            Duration::from_secs(60)
        );
        assert_eq!(
            StoreOptions::for_cycle(600).boundary_offset,
            Duration::from_secs(300)
        );
        assert_eq!(StoreOptions::for_cycle(60).boundary_offset, Duration::ZERO);
    }

    #[test]
    fn test_open_creates_parent_directory_and_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");

        let store = LevelStore::open(&path, StoreOptions::default()).unwrap();
        assert!(path.exists());
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_insert_rejects_non_finite() {
        let dir = tempdir().unwrap();
        let mut store = LevelStore::open(dir.path().join("data.db"), StoreOptions::default())
            .unwrap();

        let err = store
            .insert_measurement(f64::NAN, 1.0, ts("2024-01-01 00:00:00"))
            .unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Record(RecordError::InvalidValue { .. })
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_subsecond_timestamps_are_truncated() {
        let dir = tempdir().unwrap();
        let mut store = LevelStore::open(dir.path().join("data.db"), StoreOptions::default())
            .unwrap();

        let t = ts("2024-01-01 00:00:00") + TimeDelta::milliseconds(750);
        store.insert_measurement(1.0, 2.0, t).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.timestamp, ts("2024-01-01 00:00:00"));
    }

    #[test]
    fn test_corrupt_timestamp_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let store = LevelStore::open(&path, StoreOptions::default()).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO data (time, level, volume) VALUES ('yesterday', 1.0, 1.0)",
                [],
            )
            .unwrap();

        let err = store.all().unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Store(StoreError::CorruptTimestamp { id: 1, .. })
        ));
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempdir().unwrap();
        let err = LevelStore::open_read_only(dir.path().join("missing.db")).unwrap_err();
        assert!(matches!(err, TidemarkError::Store(StoreError::NotFound { .. })));
    }
}
