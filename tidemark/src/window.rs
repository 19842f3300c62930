//! Folding a measurement window of raw samples into one representative value.
//!
//! A window spans a fixed number of sampling ticks. Every tick counts toward
//! the window, but only valid samples are reduced. A window that closes with
//! no valid samples fails with [`WindowError::InsufficientData`] instead of
//! producing a value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WindowError};
use crate::sensor::RawSample;

/// Decimal places readings are bucketed to when counting occurrences.
const MODE_PRECISION: f64 = 1000.0;

/// Reduction applied to the valid samples of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Arithmetic mean.
    #[default]
    Mean,
    /// Median; the mean of the middle pair for even counts.
    Median,
    /// Most frequent reading after rounding to three decimal places.
    /// Ties go to the reading seen first.
    Mode,
}

impl Reducer {
    /// Reduces a slice of values. Returns `None` for an empty slice.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidemark::window::Reducer;
    ///
    /// let values = [12.0, 12.5, 11.5, 30.0];
    /// assert_eq!(Reducer::Median.reduce(&values), Some(12.25));
    /// assert_eq!(Reducer::Mean.reduce(&[]), None);
    /// ```
    #[allow(clippy::cast_precision_loss)] // window sizes are far below 2^52
    pub fn reduce(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        match self {
            Self::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            Self::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
            Self::Mode => survey(values, 0).map(|s| s.mode),
        }
    }
}

/// Occurrence counts of rounded readings, as used for calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Survey {
    /// The most frequent reading.
    pub mode: f64,
    /// Up to `top_n` `(reading, occurrences)` pairs, most frequent first.
    pub top: Vec<(f64, usize)>,
    /// Number of readings surveyed.
    pub total: usize,
}

/// Counts occurrences of each reading rounded to three decimal places.
///
/// Returns `None` if `values` is empty. Readings with equal counts keep the
/// order in which they were first seen.
pub fn survey(values: &[f64], top_n: usize) -> Option<Survey> {
    // (rounded key, occurrences) in first-seen order
    let mut counts: Vec<(i64, usize)> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for value in values {
        #[allow(clippy::cast_possible_truncation)] // sensor readings are small
        let key = (value * MODE_PRECISION).round() as i64;
        match index.get(&key) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(key, counts.len());
                counts.push((key, 1));
            }
        }
    }

    let mut ranked = counts;
    // stable sort keeps first-seen order among ties
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    #[allow(clippy::cast_precision_loss)]
    let to_value = |key: i64| key as f64 / MODE_PRECISION;

    let &(mode_key, _) = ranked.first()?;
    Some(Survey {
        mode: to_value(mode_key),
        top: ranked
            .iter()
            .take(top_n)
            .map(|&(key, n)| (to_value(key), n))
            .collect(),
        total: values.len(),
    })
}

/// Accumulates one window of samples and reduces it when full.
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    /// Ticks per window.
    size: usize,
    /// Ticks observed in the current window.
    ticks: usize,
    /// Valid samples in the current window.
    values: Vec<f64>,
    reducer: Reducer,
}

impl WindowAggregator {
    /// Creates an aggregator for windows of `size` ticks.
    ///
    /// A `size` of zero is treated as one.
    pub fn new(size: usize, reducer: Reducer) -> Self {
        let size = size.max(1);
        Self {
            size,
            ticks: 0,
            values: Vec::with_capacity(size),
            reducer,
        }
    }

    /// Adds one tick's sample.
    ///
    /// Returns `None` while the window is filling. On the tick that completes
    /// the window, returns the reduced value, or
    /// [`WindowError::InsufficientData`] if no sample was valid. The window
    /// is reset in both cases.
    ///
    /// # Errors
    ///
    /// The returned `Result` is an error when the completed window held no
    /// valid samples.
    pub fn push(&mut self, sample: RawSample) -> Option<Result<f64>> {
        self.ticks += 1;
        if sample.valid {
            self.values.push(sample.value);
        }

        if self.ticks < self.size {
            return None;
        }

        let ticks = self.ticks;
        let reduced = self.reducer.reduce(&self.values);
        self.reset();

        Some(reduced.ok_or_else(|| WindowError::InsufficientData { ticks }.into()))
    }

    /// Discards the current partial window.
    pub fn reset(&mut self) {
        self.ticks = 0;
        self.values.clear();
    }

    /// Ticks per window.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Ticks observed in the current window.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Valid samples in the current window.
    pub fn valid_count(&self) -> usize {
        self.values.len()
    }

    /// The configured reducer.
    pub fn reducer(&self) -> Reducer {
        self.reducer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidemarkError;

    fn valid(v: f64) -> RawSample {
        RawSample::from_reading(Some(v))
    }

    #[test]
    fn test_mean_of_valid_samples_only() {
        let mut window = WindowAggregator::new(4, Reducer::Mean);

        assert!(window.push(valid(10.0)).is_none());
        assert!(window.push(RawSample::from_reading(None)).is_none());
        assert!(window.push(RawSample::from_reading(Some(0.0))).is_none());
        assert_eq!(window.valid_count(), 1);

        let value = window.push(valid(14.0)).unwrap().unwrap();
        assert_eq!(value, 12.0);
        assert_eq!(window.ticks(), 0);
    }

    #[test]
    fn test_all_invalid_window_is_insufficient_data() {
        let mut window = WindowAggregator::new(3, Reducer::Mean);
        window.push(RawSample::from_reading(None));
        window.push(RawSample::from_reading(Some(-1.0)));

        let err = window.push(RawSample::from_reading(None)).unwrap().unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Window(WindowError::InsufficientData { ticks: 3 })
        ));

        // Window restarts cleanly after the failure
        assert_eq!(window.ticks(), 0);
        window.push(valid(5.0));
        window.push(valid(5.0));
        assert_eq!(window.push(valid(5.0)).unwrap().unwrap(), 5.0);
    }

    #[test]
    fn test_median_reducer() {
        assert_eq!(Reducer::Median.reduce(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(Reducer::Median.reduce(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(Reducer::Median.reduce(&[]), None);
    }

    #[test]
    fn test_median_resists_spikes() {
        let values = [12.0, 12.0, 12.0, 0.5, 40.0];
        assert_eq!(Reducer::Median.reduce(&values), Some(12.0));
        assert!(Reducer::Mean.reduce(&values).unwrap() > 12.0);
    }

    #[test]
    fn test_mode_reducer() {
        let values = [12.0011, 12.0012, 11.998, 12.001, 11.998];
        // 12.001 occurs three times after rounding
        assert_eq!(Reducer::Mode.reduce(&values), Some(12.001));
    }

    #[test]
    fn test_survey_ranks_and_breaks_ties_by_first_seen() {
        let values = [4.0, 3.98, 3.98, 4.0, 4.02];
        let survey = survey(&values, 5).unwrap();

        assert_eq!(survey.mode, 4.0);
        assert_eq!(survey.total, 5);
        assert_eq!(survey.top, vec![(4.0, 2), (3.98, 2), (4.02, 1)]);

        let limited = super::survey(&values, 1).unwrap();
        assert_eq!(limited.top.len(), 1);

        assert!(super::survey(&[], 5).is_none());
    }

    #[test]
    fn test_zero_size_window_closes_every_tick() {
        let mut window = WindowAggregator::new(0, Reducer::Mean);
        assert_eq!(window.size(), 1);
        assert_eq!(window.push(valid(7.0)).unwrap().unwrap(), 7.0);
    }

    #[test]
    fn test_reset_discards_partial_window() {
        let mut window = WindowAggregator::new(2, Reducer::Mean);
        window.push(valid(100.0));
        window.reset();
        window.push(valid(1.0));
        assert_eq!(window.push(valid(3.0)).unwrap().unwrap(), 2.0);
    }
}
