//! Supervised-learning tensors from a time-ordered signal.
//!
//! The target column is cleaned, min-max scaled to `[0, 1]`, cut into
//! stride-1 windows and split chronologically into train / validation / test.

use crate::errors::{DatasetError, Result};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{info, warn};

/// Fewest windows that may be split.
pub const MIN_SPLIT_EXAMPLES: usize = 10;

/// Default share of windows used for testing.
pub const DEFAULT_TEST_FRACTION: f64 = 0.2;

/// Default share of windows used for validation.
pub const DEFAULT_VAL_FRACTION: f64 = 0.1;

/// Fitted min-max normalisation for a single column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    /// Smallest value seen during fitting
    pub data_min: f64,
    /// Largest value seen during fitting
    pub data_max: f64,
    /// Output range, `(0, 1)` unless configured otherwise
    pub feature_range: (f64, f64),
}

impl MinMaxScaler {
    /// Fit to the given values over `[0, 1]`.
    pub fn fit(values: &[f64]) -> Self {
        Self::fit_range(values, (0.0, 1.0))
    }

    pub fn fit_range(values: &[f64], feature_range: (f64, f64)) -> Self {
        let (data_min, data_max) = values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        if data_min > data_max {
            return Self {
                data_min: 0.0,
                data_max: 0.0,
                feature_range,
            };
        }

        Self {
            data_min,
            data_max,
            feature_range,
        }
    }

    /// A constant column has zero range and scales with unit denominator.
    fn data_range(&self) -> f64 {
        let range = self.data_max - self.data_min;
        if range == 0.0 {
            1.0
        } else {
            range
        }
    }

    pub fn transform_one(&self, value: f64) -> f64 {
        let (lo, hi) = self.feature_range;
        (value - self.data_min) / self.data_range() * (hi - lo) + lo
    }

    pub fn inverse_transform_one(&self, value: f64) -> f64 {
        let (lo, hi) = self.feature_range;
        (value - lo) / (hi - lo) * self.data_range() + self.data_min
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.transform_one(*v)).collect()
    }

    pub fn inverse_transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.inverse_transform_one(*v)).collect()
    }
}

/// Optional cleaning steps applied to the target before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleaningPolicy {
    /// Replace exact zeros with the mean of non-zero values. Meant for
    /// targets that measure a strictly positive quantity.
    #[serde(default)]
    pub replace_zeros: bool,
}

/// Windowed, scaled examples before splitting.
#[derive(Debug, Clone)]
pub struct PreparedSequences {
    /// One row of `window_size` scaled values per example
    pub x: Vec<Vec<f64>>,
    /// Scaled value following each window
    pub y: Vec<f64>,
    pub scaler: MinMaxScaler,
    pub window_size: usize,
}

impl PreparedSequences {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Build windows from a numeric column of `table`.
pub fn prepare_sequences(
    table: &Table,
    target_column: &str,
    window_size: usize,
    policy: CleaningPolicy,
) -> Result<PreparedSequences> {
    let raw = table.numeric_column(target_column)?;
    info!(
        column = target_column,
        window_size, "Preparing time series windows"
    );
    prepare_signal(&raw, target_column, window_size, policy)
}

/// Build windows from an ordered signal in which `None` marks a missing value.
pub fn prepare_signal(
    signal: &[Option<f64>],
    column: &str,
    window_size: usize,
    policy: CleaningPolicy,
) -> Result<PreparedSequences> {
    if window_size == 0 {
        return Err(DatasetError::Configuration(
            "window size must be at least 1".to_string(),
        ));
    }
    if signal.len() <= window_size {
        return Err(DatasetError::InsufficientData {
            required: window_size + 1,
            available: signal.len(),
        });
    }

    let cleaned = clean_signal(signal, column, policy);
    let scaler = MinMaxScaler::fit(&cleaned);
    let scaled: Vec<f64> = cleaned
        .iter()
        .map(|v| finite_or_zero(scaler.transform_one(*v)))
        .collect();

    let count = scaled.len() - window_size;
    let mut x = Vec::with_capacity(count);
    let mut y = Vec::with_capacity(count);
    for start in 0..count {
        x.push(scaled[start..start + window_size].to_vec());
        y.push(scaled[start + window_size]);
    }

    info!(examples = count, window_size, "Time series windows prepared");
    Ok(PreparedSequences {
        x,
        y,
        scaler,
        window_size,
    })
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Impute missing and infinite values, optionally replacing zeros.
fn clean_signal(signal: &[Option<f64>], column: &str, policy: CleaningPolicy) -> Vec<f64> {
    let present: Vec<f64> = signal
        .iter()
        .filter_map(|v| v.filter(|x| x.is_finite()))
        .collect();
    let missing = signal.len() - present.len();

    let fill = if present.is_empty() {
        warn!(
            column,
            "Target column has no usable values, imputing zeros"
        );
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    };

    if missing > 0 && !present.is_empty() {
        warn!(column, missing, fill, "Imputing missing target values with column mean");
    }

    let mut cleaned: Vec<f64> = signal
        .iter()
        .map(|v| v.filter(|x| x.is_finite()).unwrap_or(fill))
        .collect();

    if policy.replace_zeros {
        let non_zero: Vec<f64> = cleaned.iter().copied().filter(|v| *v != 0.0).collect();
        if !non_zero.is_empty() {
            let non_zero_mean = non_zero.iter().sum::<f64>() / non_zero.len() as f64;
            let zeros = cleaned.len() - non_zero.len();
            if zeros > 0 {
                info!(column, zeros, non_zero_mean, "Replacing zero values with non-zero mean");
                for v in cleaned.iter_mut().filter(|v| **v == 0.0) {
                    *v = non_zero_mean;
                }
            }
        }
    }

    cleaned
}

/// Positional ranges of each partition over the unsplit windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBoundaries {
    pub train: Range<usize>,
    pub val: Range<usize>,
    pub test: Range<usize>,
}

/// Train / validation / test tensors plus the scaler that produced them.
#[derive(Debug, Clone)]
pub struct SplitTensorSet {
    pub x_train: Vec<Vec<f64>>,
    pub x_val: Vec<Vec<f64>>,
    pub x_test: Vec<Vec<f64>>,
    pub y_train: Vec<f64>,
    pub y_val: Vec<f64>,
    pub y_test: Vec<f64>,
    pub scaler: MinMaxScaler,
    pub boundaries: SplitBoundaries,
}

/// Partition sizes for `n` examples.
///
/// The held-out tail is `ceil((test + val) * n)` examples, of which the
/// validation share is `val / (test + val)` rounded to the nearest example;
/// test gets the rest.
pub fn split_sizes(n: usize, test_fraction: f64, val_fraction: f64) -> Result<(usize, usize, usize)> {
    let valid = |f: f64| f.is_finite() && f >= 0.0;
    if !valid(test_fraction) || !valid(val_fraction) || test_fraction + val_fraction >= 1.0 {
        return Err(DatasetError::Configuration(format!(
            "invalid split fractions: test={test_fraction}, val={val_fraction}"
        )));
    }

    let holdout_fraction = test_fraction + val_fraction;
    let holdout = ((holdout_fraction * n as f64) - 1e-9).ceil().max(0.0) as usize;
    let holdout = holdout.min(n);
    let val = if holdout_fraction > 0.0 {
        ((holdout as f64) * val_fraction / holdout_fraction).round() as usize
    } else {
        0
    };
    let val = val.min(holdout);

    Ok((n - holdout, val, holdout - val))
}

/// Split windows in their original order. No shuffling takes place.
pub fn split_chronological(
    prepared: PreparedSequences,
    test_fraction: f64,
    val_fraction: f64,
) -> Result<SplitTensorSet> {
    let n = prepared.len();
    if n < MIN_SPLIT_EXAMPLES {
        return Err(DatasetError::InsufficientData {
            required: MIN_SPLIT_EXAMPLES,
            available: n,
        });
    }

    let (n_train, n_val, n_test) = split_sizes(n, test_fraction, val_fraction)?;
    let boundaries = SplitBoundaries {
        train: 0..n_train,
        val: n_train..n_train + n_val,
        test: n_train + n_val..n_train + n_val + n_test,
    };

    let PreparedSequences {
        mut x, mut y, scaler, ..
    } = prepared;

    let x_test = x.split_off(boundaries.test.start);
    let x_val = x.split_off(boundaries.val.start);
    let y_test = y.split_off(boundaries.test.start);
    let y_val = y.split_off(boundaries.val.start);

    info!(
        train = n_train,
        val = n_val,
        test = n_test,
        "Chronological split completed"
    );

    Ok(SplitTensorSet {
        x_train: x,
        x_val,
        x_test,
        y_train: y,
        y_val,
        y_test,
        scaler,
        boundaries,
    })
}
