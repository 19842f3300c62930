//! Signal acquisition: one raw analog reading per sampling tick.
//!
//! A [`Sensor`] returns `Some(value)` for a reading and `None` for a transient
//! failure. It never panics and never returns an error; failures are logged
//! by the implementation and filtered out of the window by [`RawSample`].
//!
//! Two ADC front ends are supported, selected by [`SignalKind`]:
//!
//! - **Voltage loop**: the ADC voltage is the raw value.
//! - **Current loop (4-20 mA)**: the ADC measures the voltage across a shunt
//!   resistor, converted to milliamps as `V / ohms * 1000`.
//!
//! [`AdcFileSensor`] reads the ADC through a sysfs attribute, either a Linux
//! IIO `in_voltageN_raw` channel (integer counts times a scale) or a plain
//! text file holding a voltage.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, Result};

/// Default shunt resistance on the current-loop board, in ohms.
pub const DEFAULT_SHUNT_OHMS: f64 = 96.75;

/// Name of the IIO attribute holding the millivolts-per-count scale.
const IIO_SCALE_FILE: &str = "in_voltage_scale";

/// A source of raw analog readings.
pub trait Sensor {
    /// Takes one reading. Returns `None` on a transient failure.
    fn read_raw(&mut self) -> Option<f64>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn read_raw(&mut self) -> Option<f64> {
        (**self).read_raw()
    }
}

/// A single raw reading with its validity flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// The reading, or 0.0 when no reading was obtained.
    pub value: f64,
    /// Whether the reading may be folded into a window.
    pub valid: bool,
}

impl RawSample {
    /// Classifies a sensor reading.
    ///
    /// Missing, non-finite, zero and negative readings are invalid. A live
    /// current loop never reads zero, so zero indicates a disconnected or
    /// failed front end.
    pub fn from_reading(reading: Option<f64>) -> Self {
        match reading {
            Some(value) if value.is_finite() && value > 0.0 => Self { value, valid: true },
            Some(value) => Self {
                value,
                valid: false,
            },
            None => Self {
                value: 0.0,
                valid: false,
            },
        }
    }
}

/// How an ADC voltage becomes the raw value fed to calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SignalKind {
    /// The voltage itself is the raw value.
    Volts,
    /// Current through a shunt resistor, in milliamps.
    Milliamps {
        /// Shunt resistance in ohms.
        shunt_ohms: f64,
    },
}

impl Default for SignalKind {
    fn default() -> Self {
        Self::Milliamps {
            shunt_ohms: DEFAULT_SHUNT_OHMS,
        }
    }
}

impl SignalKind {
    /// Converts a measured voltage into the raw calibration unit.
    pub fn convert(self, volts: f64) -> f64 {
        match self {
            Self::Volts => volts,
            Self::Milliamps { shunt_ohms } => {
                let milliamps = volts / shunt_ohms * 1000.0;
                (milliamps * 1000.0).round() / 1000.0
            }
        }
    }
}

/// How the ADC attribute file is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Linux IIO channel: integer counts, multiplied by a volts-per-count scale.
    #[default]
    Iio,
    /// Text file containing a voltage.
    File,
}

/// Sensor section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Attribute file encoding.
    pub kind: SensorKind,
    /// Path to the attribute file.
    pub path: PathBuf,
    /// Volts per count for IIO channels. When unset, read from the
    /// channel's `in_voltage_scale` sibling (millivolts per count).
    pub scale: Option<f64>,
    /// Front-end conversion from volts to the raw unit.
    pub signal: SignalKind,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Iio,
            path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage0_raw"),
            scale: None,
            signal: SignalKind::default(),
        }
    }
}

impl SensorConfig {
    /// Validates the sensor configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSensor`] if the path is empty, the scale
    /// is not a positive finite number, or the shunt resistance is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidSensor {
                reason: "path cannot be empty".to_string(),
            }
            .into());
        }

        if let Some(scale) = self.scale
            && !(scale.is_finite() && scale > 0.0)
        {
            return Err(ConfigError::InvalidSensor {
                reason: format!("scale must be positive, got {scale}"),
            }
            .into());
        }

        if let SignalKind::Milliamps { shunt_ohms } = self.signal
            && !(shunt_ohms.is_finite() && shunt_ohms > 0.0)
        {
            return Err(ConfigError::InvalidSensor {
                reason: format!("shunt_ohms must be positive, got {shunt_ohms}"),
            }
            .into());
        }

        Ok(())
    }
}

/// ADC sensor backed by a sysfs attribute file.
#[derive(Debug)]
pub struct AdcFileSensor {
    kind: SensorKind,
    path: PathBuf,
    /// Volts per count (IIO only).
    scale: f64,
    signal: SignalKind,
}

impl AdcFileSensor {
    /// Creates a sensor from configuration.
    ///
    /// For IIO channels without an explicit scale, the scale is read once
    /// from the `in_voltage_scale` attribute next to the channel file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSensor`] if the configuration is invalid
    /// or the IIO scale attribute cannot be read.
    pub fn from_config(config: &SensorConfig) -> Result<Self> {
        config.validate()?;

        let scale = match (config.kind, config.scale) {
            (_, Some(scale)) => scale,
            (SensorKind::File, None) => 1.0,
            (SensorKind::Iio, None) => read_iio_scale(&config.path)?,
        };

        Ok(Self {
            kind: config.kind,
            path: config.path.clone(),
            scale,
            signal: config.signal,
        })
    }

    /// Returns the attribute path this sensor reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_volts(&self) -> std::result::Result<f64, String> {
        let text = fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        let text = text.trim();
        match self.kind {
            SensorKind::Iio => text
                .parse::<i64>()
                .map(|counts| {
                    #[allow(clippy::cast_precision_loss)] // ADC counts are at most 24 bits
                    let counts = counts as f64;
                    counts * self.scale
                })
                .map_err(|e| format!("bad count '{text}': {e}")),
            SensorKind::File => text
                .parse::<f64>()
                .map(|v| v * self.scale)
                .map_err(|e| format!("bad voltage '{text}': {e}")),
        }
    }
}

impl Sensor for AdcFileSensor {
    fn read_raw(&mut self) -> Option<f64> {
        match self.read_volts() {
            Ok(volts) => Some(self.signal.convert(volts)),
            Err(reason) => {
                warn!(path = %self.path.display(), %reason, "ADC read failed");
                None
            }
        }
    }
}

/// Reads the IIO millivolts-per-count scale and converts it to volts.
fn read_iio_scale(channel: &Path) -> Result<f64> {
    let scale_path = channel
        .parent()
        .map(|dir| dir.join(IIO_SCALE_FILE))
        .unwrap_or_else(|| PathBuf::from(IIO_SCALE_FILE));

    let text = fs::read_to_string(&scale_path).map_err(|e| ConfigError::InvalidSensor {
        reason: format!("cannot read IIO scale '{}': {e}", scale_path.display()),
    })?;

    let millivolts: f64 = text.trim().parse().map_err(|_| ConfigError::InvalidSensor {
        reason: format!(
            "IIO scale '{}' is not a number: '{}'",
            scale_path.display(),
            text.trim()
        ),
    })?;

    Ok(millivolts / 1000.0)
}

/// Sensor that replays a fixed sequence of readings.
///
/// Once the sequence is exhausted every read fails. Used for replaying
/// captured traces and for driving the collector deterministically.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSensor {
    readings: VecDeque<Option<f64>>,
}

impl ScriptedSensor {
    /// Creates a sensor that returns the given readings in order.
    pub fn new<I: IntoIterator<Item = Option<f64>>>(readings: I) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }

    /// Appends `count` copies of `reading`.
    pub fn extend_repeat(&mut self, reading: Option<f64>, count: usize) {
        self.readings
            .extend(std::iter::repeat_n(reading, count));
    }

    /// Number of readings left before the sensor starts failing.
    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl Sensor for ScriptedSensor {
    fn read_raw(&mut self) -> Option<f64> {
        self.readings.pop_front().flatten()
    }
}
