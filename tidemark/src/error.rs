//! Error types for the tidemark acquisition pipeline and level store.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use thiserror::Error;

/// The main error type for all tidemark operations.
///
/// Each variant wraps the error enum of one concern: configuration, window
/// reduction, store lifecycle, the write path, and the read path.
#[derive(Error, Debug)]
pub enum TidemarkError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error reducing a window of raw samples.
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Error opening or accessing the level store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error during a measurement insert (write path).
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Error during a range query or aggregation (read path).
    #[error("query error: {0}")]
    Query(#[from] QueryError),
}

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("failed to access config file '{}': {source}", path.display())]
    FileAccess {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`crate::config::Config`].
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize configuration to JSON.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The calibration endpoints or tank geometry are unusable.
    #[error("invalid calibration: {reason}")]
    InvalidCalibration {
        /// Why the calibration is invalid.
        reason: String,
    },

    /// The sampling section is unusable.
    #[error("invalid sampling configuration: {reason}")]
    InvalidSampling {
        /// Why the sampling configuration is invalid.
        reason: String,
    },

    /// The sensor section is unusable.
    #[error("invalid sensor configuration: {reason}")]
    InvalidSensor {
        /// Why the sensor configuration is invalid.
        reason: String,
    },

    /// The query section is unusable.
    #[error("invalid query configuration: {reason}")]
    InvalidQuery {
        /// Why the query configuration is invalid.
        reason: String,
    },
}

/// Errors that can occur when reducing a window of raw samples.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// The window closed without a single valid sample to reduce.
    #[error("insufficient data: no valid samples in a window of {ticks} ticks")]
    InsufficientData {
        /// Number of ticks the window spanned.
        ticks: usize,
    },
}

/// Errors that can occur when opening or reading the level store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database file does not exist (read-only open).
    #[error("no level store found at '{}'", path.display())]
    NotFound {
        /// The path that was expected to hold the database.
        path: PathBuf,
    },

    /// The parent directory of the database could not be created.
    #[error("failed to access store directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted `time` value is not in `YYYY-MM-DD HH:MM:SS` form.
    #[error("row {id} has an unparseable timestamp '{value}'")]
    CorruptTimestamp {
        /// Surrogate key of the offending row.
        id: i64,
        /// The raw column text.
        value: String,
    },
}

/// Errors that can occur during a measurement insert (write path).
#[derive(Error, Debug)]
pub enum RecordError {
    /// The level or volume is NaN or infinite.
    #[error("invalid value: {value} ({reason})")]
    InvalidValue {
        /// The invalid value.
        value: f64,
        /// Why the value is invalid.
        reason: String,
    },

    /// No boundary timestamp fits strictly between the previous row and the
    /// new measurement, so the run transition cannot be written in order.
    #[error("timestamp {attempted} does not leave room after last row at {last}")]
    NonMonotonic {
        /// Timestamp of the most recent persisted row.
        last: NaiveDateTime,
        /// Timestamp of the rejected measurement.
        attempted: NaiveDateTime,
    },
}

/// Errors that can occur during range queries and aggregation (read path).
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is inverted.
    #[error("invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// The start of the range.
        start: NaiveDateTime,
        /// The end of the range.
        end: NaiveDateTime,
    },

    /// A granularity or bound string could not be parsed.
    #[error("cannot parse '{input}': {reason}")]
    Parse {
        /// The rejected input.
        input: String,
        /// What was expected.
        reason: String,
    },
}

impl From<rusqlite::Error> for TidemarkError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(error))
    }
}

/// Type alias for `Result<T, TidemarkError>`.
pub type Result<T> = std::result::Result<T, TidemarkError>;
