//! # tidemark
//!
//! Tank level monitoring with change-compacted history.
//!
//! tidemark samples an analog level sensor (a 4-20 mA current loop or a
//! voltage loop read through an ADC), folds each measurement window into one
//! representative reading, calibrates it into a tank level and volume, and
//! stores it in SQLite only when the level changes. A tank sitting at the
//! same level for a week costs two rows, not five thousand.
//!
//! ## Key Properties
//!
//! - Explicit failure on empty windows instead of dividing by zero
//! - Run-length storage: a start row per level run, plus a back-dated
//!   boundary row when the run ends
//! - Transition rows are written in one transaction, so readers never see
//!   half a pair
//! - Persisted timestamps strictly increase, even when the boundary offset
//!   reaches back past the previous row
//! - Calendar-aligned aggregation with per-granularity range caps
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//!
//! use tidemark::{AdcFileSensor, Collector, Config, LevelStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("tidemark.json")?;
//! let mut store = LevelStore::open(&config.store.path, config.store_options())?;
//!
//! let sensor = AdcFileSensor::from_config(&config.sensor)?;
//! let mut collector = Collector::new(sensor, &config, &mut store)?;
//! collector.run(&AtomicBool::new(false));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sensor`] — Raw ADC readings and their validity
//! - [`window`] — Window reduction (mean, median, mode)
//! - [`calibrate`] — Raw value to level and volume
//! - [`store`] — Change-compacted SQLite store
//! - [`query`] — Time ranges, granularities, bucketed statistics
//! - [`collector`] — The acquisition loop
//! - [`config`] — JSON configuration
//! - [`error`] — Error types

pub mod calibrate;
pub mod collector;
pub mod config;
pub mod error;
pub mod query;
pub mod sensor;
pub mod store;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use calibrate::{CalibrationParameters, Calibrator, Measurement};
pub use collector::{Collector, RunStats, Tick, TickOutcome};
pub use config::Config;
pub use error::{Result, TidemarkError};
pub use query::{Aggregation, Granularity, RangeCaps, TimeBound, TimeBucket, TimeRange};
pub use sensor::{AdcFileSensor, RawSample, ScriptedSensor, Sensor};
pub use store::{InsertOutcome, LevelReading, LevelStore, StoreOptions};
pub use window::{Reducer, WindowAggregator};
