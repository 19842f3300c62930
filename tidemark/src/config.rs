//! Runtime configuration, loaded from a JSON file.
//!
//! Every section and field has a default, so an empty object `{}` is a valid
//! configuration for the standard 4-20 mA deployment:
//!
//! ```json
//! {
//!   "calibration": { "raw_min": 4.0, "raw_max": 20.0, "tank_height": 3.11 },
//!   "sampling": { "tick_interval": 1.0, "cycle_seconds": 120, "reducer": "median" },
//!   "store": { "path": "/var/lib/tidemark/data.db" },
//!   "query": { "range_caps": { "minute": 7, "hour": 90 } },
//!   "sensor": { "kind": "iio", "signal": { "type": "milliamps", "shunt_ohms": 96.75 } }
//! }
//! ```
//!
//! Durations are written as seconds (floating point).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibrate::CalibrationParameters;
use crate::error::{ConfigError, Result};
use crate::query::RangeCaps;
use crate::sensor::SensorConfig;
use crate::store::StoreOptions;
use crate::window::Reducer;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Calibration endpoints and tank geometry.
    pub calibration: CalibrationParameters,
    /// Tick and window timing.
    pub sampling: SamplingConfig,
    /// Database location and write tuning.
    pub store: StoreConfig,
    /// Read-path limits.
    pub query: QueryConfig,
    /// ADC front end.
    pub sensor: SensorConfig,
}

/// Sampling section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Time between sensor reads.
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
    /// Length of one measurement cycle in seconds.
    pub cycle_seconds: u32,
    /// How each window is folded into one value.
    pub reducer: Reducer,
    /// Pause after a failed read before the next tick.
    #[serde(with = "duration_serde")]
    pub failure_backoff: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            cycle_seconds: 120,
            reducer: Reducer::Mean,
            failure_backoff: Duration::from_secs(5),
        }
    }
}

/// Store section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Boundary offset override. Derived from `cycle_seconds` when unset.
    #[serde(
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub boundary_offset: Option<Duration>,
    /// How long to wait on a locked database.
    #[serde(with = "duration_serde")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data.db"),
            boundary_offset: None,
            busy_timeout: StoreOptions::default().busy_timeout,
        }
    }
}

/// Query section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Longest span, in days, an aggregate may cover per granularity.
    pub range_caps: RangeCaps,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::FileAccess`] if the file cannot be read
    /// - [`ConfigError::Parse`] if it is not valid configuration JSON
    /// - any validation error from [`Config::validate`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, json + "\n").map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;
        self.sensor.validate()?;
        self.query.range_caps.validate()?;

        let sampling = &self.sampling;
        if sampling.tick_interval.is_zero() {
            return Err(ConfigError::InvalidSampling {
                reason: "tick_interval must be positive".to_string(),
            }
            .into());
        }
        if sampling.cycle_seconds == 0 {
            return Err(ConfigError::InvalidSampling {
                reason: "cycle_seconds must be positive".to_string(),
            }
            .into());
        }
        if Duration::from_secs(u64::from(sampling.cycle_seconds)) < sampling.tick_interval {
            return Err(ConfigError::InvalidSampling {
                reason: format!(
                    "cycle_seconds ({}) is shorter than tick_interval ({:?})",
                    sampling.cycle_seconds, sampling.tick_interval
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Ticks per measurement window.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // ratio is positive and small
    pub fn window_ticks(&self) -> usize {
        let ratio =
            f64::from(self.sampling.cycle_seconds) / self.sampling.tick_interval.as_secs_f64();
        (ratio.round() as usize).max(1)
    }

    /// Store options with the boundary offset resolved.
    pub fn store_options(&self) -> StoreOptions {
        let derived = StoreOptions::for_cycle(self.sampling.cycle_seconds);
        StoreOptions {
            boundary_offset: self.store.boundary_offset.unwrap_or(derived.boundary_offset),
            busy_timeout: self.store.busy_timeout,
        }
    }
}

/// Serde helpers for `Duration` as floating-point seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.as_secs_f64()).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<f64>::deserialize(deserializer)?
                .map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
