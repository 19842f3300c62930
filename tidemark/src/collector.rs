//! The acquisition loop: sensor → window → calibrator → store.
//!
//! A [`Collector`] owns the sensor, the window and the calibrator, and
//! borrows the store for its lifetime. Each call to [`Collector::tick`]
//! performs one sampling tick. Every `W` ticks the window closes and, if it
//! held any valid samples, the representative value is calibrated and handed
//! to [`LevelStore::insert_measurement`].
//!
//! No failure stops the loop. Failed reads are excluded from the window,
//! empty windows are skipped, and store errors lose that one measurement.
//! Each is logged and reported in the [`TickOutcome`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::calibrate::{Calibrator, Measurement};
use crate::config::Config;
use crate::error::Result;
use crate::sensor::{RawSample, Sensor};
use crate::store::{InsertOutcome, LevelStore};
use crate::window::WindowAggregator;

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The window is still filling.
    Filling {
        /// Ticks observed so far in this window.
        ticks: usize,
    },
    /// The window closed without a single valid sample.
    Skipped {
        /// Ticks in the skipped window.
        ticks: usize,
    },
    /// The window closed and the measurement reached the store.
    Recorded {
        /// The calibrated measurement.
        measurement: Measurement,
        /// What the store did with it.
        insert: InsertOutcome,
    },
    /// The window closed but the store rejected the measurement.
    WriteFailed {
        /// The lost measurement.
        measurement: Measurement,
    },
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// The sensor reading, `None` if the read failed.
    pub reading: Option<f64>,
    /// What happened to the window.
    pub outcome: TickOutcome,
}

/// Counters accumulated by [`Collector::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Ticks performed.
    pub ticks: u64,
    /// Sensor reads that failed.
    pub failed_reads: u64,
    /// Windows that reached the store.
    pub recorded: u64,
    /// Windows skipped for lack of valid samples.
    pub skipped: u64,
    /// Measurements lost to store errors.
    pub write_failures: u64,
}

impl RunStats {
    fn observe(&mut self, tick: &Tick) {
        self.ticks += 1;
        if tick.reading.is_none() {
            self.failed_reads += 1;
        }
        match tick.outcome {
            TickOutcome::Filling { .. } => {}
            TickOutcome::Skipped { .. } => self.skipped += 1,
            TickOutcome::Recorded { .. } => self.recorded += 1,
            TickOutcome::WriteFailed { .. } => self.write_failures += 1,
        }
    }
}

/// Single-writer acquisition pipeline.
#[derive(Debug)]
pub struct Collector<'a, S: Sensor> {
    sensor: S,
    window: WindowAggregator,
    calibrator: Calibrator,
    store: &'a mut LevelStore,
    tick_interval: Duration,
    failure_backoff: Duration,
}

impl<'a, S: Sensor> Collector<'a, S> {
    /// Builds a collector from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] if the calibration is invalid.
    pub fn new(sensor: S, config: &Config, store: &'a mut LevelStore) -> Result<Self> {
        Ok(Self {
            sensor,
            window: WindowAggregator::new(config.window_ticks(), config.sampling.reducer),
            calibrator: Calibrator::new(config.calibration.clone())?,
            store,
            tick_interval: config.sampling.tick_interval,
            failure_backoff: config.sampling.failure_backoff,
        })
    }

    /// The current window.
    pub fn window(&self) -> &WindowAggregator {
        &self.window
    }

    /// The store this collector writes to.
    pub fn store(&self) -> &LevelStore {
        &*self.store
    }

    /// Performs one sampling tick at `now`.
    ///
    /// `now` timestamps the measurement if this tick closes the window.
    pub fn tick(&mut self, now: NaiveDateTime) -> Tick {
        let reading = self.sensor.read_raw();
        let sample = RawSample::from_reading(reading);

        let outcome = match self.window.push(sample) {
            None => TickOutcome::Filling {
                ticks: self.window.ticks(),
            },
            Some(Err(e)) => {
                warn!(error = %e, "skipping measurement cycle");
                TickOutcome::Skipped {
                    ticks: self.window.size(),
                }
            }
            Some(Ok(raw)) => self.record(raw, now),
        };

        Tick { reading, outcome }
    }

    fn record(&mut self, raw: f64, now: NaiveDateTime) -> TickOutcome {
        let measurement = self.calibrator.calibrate(raw);
        debug!(
            raw,
            level = measurement.level,
            volume = measurement.volume,
            reducer = ?self.window.reducer(),
            "window complete"
        );

        match self
            .store
            .insert_measurement(measurement.level, measurement.volume, now)
        {
            Ok(insert) => TickOutcome::Recorded {
                measurement,
                insert,
            },
            Err(e) => {
                warn!(error = %e, level = measurement.level, "measurement lost");
                TickOutcome::WriteFailed { measurement }
            }
        }
    }

    /// Runs the acquisition loop until `stop` is set.
    ///
    /// Sleeps the tick interval between ticks, or the failure backoff after
    /// a failed read. Timestamps come from the local wall clock.
    pub fn run(&mut self, stop: &AtomicBool) -> RunStats {
        info!(
            store = %self.store.path().display(),
            window_ticks = self.window.size(),
            tick_interval = ?self.tick_interval,
            "collector started"
        );

        let mut stats = RunStats::default();
        while !stop.load(Ordering::Relaxed) {
            let tick = self.tick(Local::now().naive_local());
            stats.observe(&tick);

            let pause = if tick.reading.is_some() {
                self.tick_interval
            } else {
                self.failure_backoff
            };
            thread::sleep(pause);
        }

        info!(ticks = stats.ticks, recorded = stats.recorded, "collector stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_timestamp;
    use crate::sensor::ScriptedSensor;
    use crate::store::StoreOptions;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn config(window: u32) -> Config {
        let mut config = Config::default();
        config.sampling.cycle_seconds = window;
        config.sampling.tick_interval = Duration::from_secs(1);
        config
    }

    fn open_store(dir: &tempfile::TempDir) -> LevelStore {
        LevelStore::open(dir.path().join("data.db"), StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_window_fills_then_records() {
        let dir = tempdir().unwrap();
        let mut store = open_store(&dir);
        let sensor = ScriptedSensor::new([Some(12.0), None, Some(12.0)]);
        let mut collector = Collector::new(sensor, &config(3), &mut store).unwrap();

        let t = parse_timestamp("2024-01-01 00:00:00").unwrap();
        assert_eq!(
            collector.tick(t).outcome,
            TickOutcome::Filling { ticks: 1 }
        );

        let failed = collector.tick(t);
        assert_eq!(failed.reading, None);
        assert_eq!(failed.outcome, TickOutcome::Filling { ticks: 2 });

        match collector.tick(t).outcome {
            TickOutcome::Recorded {
                measurement,
                insert,
            } => {
                assert!((measurement.level - 1.555).abs() < 1e-9);
                assert_eq!(insert, InsertOutcome::First);
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert_eq!(collector.store().count().unwrap(), 1);
    }

    #[test]
    fn test_empty_window_is_skipped() {
        let dir = tempdir().unwrap();
        let mut store = open_store(&dir);
        let sensor = ScriptedSensor::new([None, Some(0.0)]);
        let mut collector = Collector::new(sensor, &config(2), &mut store).unwrap();

        let t = parse_timestamp("2024-01-01 00:00:00").unwrap();
        collector.tick(t);
        assert_eq!(collector.tick(t).outcome, TickOutcome::Skipped { ticks: 2 });
        assert_eq!(collector.window().ticks(), 0);
        assert_eq!(collector.store().count().unwrap(), 0);
    }

    #[test]
    fn test_store_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let mut store = open_store(&dir);
        let mut sensor = ScriptedSensor::default();
        sensor.extend_repeat(Some(12.0), 1);
        sensor.extend_repeat(Some(20.0), 1);
        sensor.extend_repeat(Some(4.0), 1);
        let mut collector = Collector::new(sensor, &config(1), &mut store).unwrap();

        let t = parse_timestamp("2024-01-01 00:10:00").unwrap();
        collector.tick(t);

        // Same second: no room for a boundary row, the insert is rejected
        assert!(matches!(
            collector.tick(t).outcome,
            TickOutcome::WriteFailed { .. }
        ));

        // The next cycle records normally
        let later = t + TimeDelta::minutes(5);
        assert!(matches!(
            collector.tick(later).outcome,
            TickOutcome::Recorded {
                insert: InsertOutcome::Transition { clamped: false, .. },
                ..
            }
        ));
        assert_eq!(collector.store().count().unwrap(), 3);
    }

    #[test]
    fn test_run_stops_when_flag_is_set() {
        let dir = tempdir().unwrap();
        let mut store = open_store(&dir);
        let mut config = config(1);
        config.sampling.tick_interval = Duration::from_millis(1);
        config.sampling.cycle_seconds = 1;
        let mut collector =
            Collector::new(ScriptedSensor::default(), &config, &mut store).unwrap();

        let stop = AtomicBool::new(true);
        assert_eq!(collector.run(&stop), RunStats::default());
    }

    #[test]
    fn test_run_stats_observe() {
        let mut stats = RunStats::default();
        stats.observe(&Tick {
            reading: None,
            outcome: TickOutcome::Skipped { ticks: 1 },
        });
        stats.observe(&Tick {
            reading: Some(12.0),
            outcome: TickOutcome::Filling { ticks: 1 },
        });
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.failed_reads, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.recorded, 0);
    }
}
