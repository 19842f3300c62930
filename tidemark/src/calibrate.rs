//! Calibration from a representative raw reading to tank level and volume.
//!
//! The sensor is calibrated with two endpoints: the raw reading with an empty
//! tank (`raw_min`) and the raw reading with a full tank (`raw_max`). Raw
//! values are interpolated linearly onto `[0, tank_height]`, and the volume is
//! derived from the level with a fixed prism approximation of the tank:
//!
//! ```text
//! level  = (raw - raw_min) / ((raw_max - raw_min) / tank_height)
//! volume = base_offset + level * cross_section_area
//! ```
//!
//! Both outputs are rounded to `rounding_precision` decimal places. The store
//! detects run transitions by comparing rounded levels for equality, so the
//! precision sets the compaction granularity.
//!
//! Raw inputs outside the calibration endpoints produce levels outside
//! `[0, tank_height]` unless `clamp_to_tank` is set.
//!
//! # Example
//!
//! ```rust
//! use tidemark::calibrate::{CalibrationParameters, Calibrator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let params = CalibrationParameters {
//!     raw_min: 4.0,
//!     raw_max: 20.0,
//!     tank_height: 3.11,
//!     ..CalibrationParameters::default()
//! };
//! let calibrator = Calibrator::new(params)?;
//!
//! let m = calibrator.calibrate(20.0);
//! assert_eq!(m.level, 3.11);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Largest supported rounding precision (decimal places).
const MAX_ROUNDING_PRECISION: u32 = 9;

/// Calibration endpoints and tank geometry.
///
/// Immutable for the lifetime of a collector run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParameters {
    /// Raw reading with an empty tank (e.g. 4.0 mA).
    pub raw_min: f64,
    /// Raw reading with a full tank (e.g. 20.0 mA).
    pub raw_max: f64,
    /// Usable tank height in level units (tank height minus nozzle offset).
    pub tank_height: f64,
    /// Volume held below level zero, accounting for an uneven base.
    pub base_offset: f64,
    /// Horizontal cross-section area of the tank.
    pub cross_section_area: f64,
    /// Decimal places kept for level and volume.
    pub rounding_precision: u32,
    /// Clamp levels to `[0, tank_height]`. Off by default.
    pub clamp_to_tank: bool,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            raw_min: 4.0,
            raw_max: 20.0,
            tank_height: 3.11,
            base_offset: 3.41,
            cross_section_area: 3.855 * 5.06,
            rounding_precision: 3,
            clamp_to_tank: false,
        }
    }
}

impl CalibrationParameters {
    /// Validates the calibration parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCalibration`] if any value is non-finite,
    /// the endpoints coincide, the tank height or area is not positive, or
    /// the rounding precision exceeds nine places.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("raw_min", self.raw_min),
            ("raw_max", self.raw_max),
            ("tank_height", self.tank_height),
            ("base_offset", self.base_offset),
            ("cross_section_area", self.cross_section_area),
        ];
        if let Some((name, value)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(invalid(format!("{name} must be finite, got {value}")));
        }

        if self.raw_max == self.raw_min {
            return Err(invalid(format!(
                "raw_min and raw_max must differ (both {})",
                self.raw_min
            )));
        }

        if self.tank_height <= 0.0 {
            return Err(invalid(format!(
                "tank_height must be positive, got {}",
                self.tank_height
            )));
        }

        if self.cross_section_area <= 0.0 {
            return Err(invalid(format!(
                "cross_section_area must be positive, got {}",
                self.cross_section_area
            )));
        }

        if self.rounding_precision > MAX_ROUNDING_PRECISION {
            return Err(invalid(format!(
                "rounding_precision must be <= {MAX_ROUNDING_PRECISION}, got {}",
                self.rounding_precision
            )));
        }

        Ok(())
    }
}

fn invalid(reason: String) -> crate::error::TidemarkError {
    ConfigError::InvalidCalibration { reason }.into()
}

/// A calibrated measurement, ready to hand to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// The representative raw value the measurement was computed from.
    pub raw: f64,
    /// Rounded level in tank-height units.
    pub level: f64,
    /// Rounded volume.
    pub volume: f64,
}

/// Maps representative raw values to level and volume.
#[derive(Debug, Clone)]
pub struct Calibrator {
    params: CalibrationParameters,
    /// Raw units per level unit.
    raw_per_level: f64,
    /// `10^rounding_precision`.
    scale: f64,
}

impl Calibrator {
    /// Creates a calibrator from validated parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCalibration`] if the parameters are invalid.
    pub fn new(params: CalibrationParameters) -> Result<Self> {
        params.validate()?;
        let raw_per_level = (params.raw_max - params.raw_min) / params.tank_height;
        #[allow(clippy::cast_possible_wrap)] // precision is validated to <= 9
        let scale = 10f64.powi(params.rounding_precision as i32);
        Ok(Self {
            params,
            raw_per_level,
            scale,
        })
    }

    /// Returns the calibration parameters.
    pub fn params(&self) -> &CalibrationParameters {
        &self.params
    }

    /// Calibrates a representative raw value.
    ///
    /// The volume is computed from the unrounded level, then both are rounded.
    pub fn calibrate(&self, raw: f64) -> Measurement {
        let mut level = (raw - self.params.raw_min) / self.raw_per_level;
        if self.params.clamp_to_tank {
            level = level.clamp(0.0, self.params.tank_height);
        }
        let volume = self.params.base_offset + level * self.params.cross_section_area;

        Measurement {
            raw,
            level: self.round(level),
            volume: self.round(volume),
        }
    }

    /// Rounds a value to the configured precision.
    pub fn round(&self, value: f64) -> f64 {
        (value * self.scale).round() / self.scale
    }
}
