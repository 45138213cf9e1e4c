//! Forecast error metrics on inverse-scaled values.

use crate::errors::{PipelineError, Result};
use mlops_dataset::DatasetError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub mse: f64,
    pub mae: f64,
    /// Percent; targets equal to zero are left out
    pub mape: f64,
    /// Percent, in `[0, 200]`
    pub smape: f64,
}

impl EvaluationMetrics {
    /// `100 - SMAPE`, rounded to one decimal.
    pub fn accuracy(&self) -> f64 {
        mlops_registry::train_info::accuracy_from_smape(self.smape)
    }
}

fn check(predictions: &[f64], targets: &[f64]) -> Result<()> {
    if predictions.len() != targets.len() {
        return Err(PipelineError::Configuration(format!(
            "{} predictions for {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    if targets.is_empty() {
        return Err(DatasetError::InsufficientData {
            required: 1,
            available: 0,
        }
        .into());
    }
    Ok(())
}

pub fn mse(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = targets.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / n
}

pub fn mae(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = targets.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n
}

pub fn mape(predictions: &[f64], targets: &[f64]) -> f64 {
    let terms: Vec<f64> = predictions
        .iter()
        .zip(targets)
        .filter(|(_, t)| **t != 0.0)
        .map(|(p, t)| ((t - p) / t).abs())
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    100.0 * terms.iter().sum::<f64>() / terms.len() as f64
}

/// `100/n * sum(2|p - t| / (|t| + |p|))`; a pair of zeros contributes 0.
pub fn smape(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = targets.len().max(1) as f64;
    let total: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| {
            let denom = t.abs() + p.abs();
            if denom == 0.0 {
                0.0
            } else {
                2.0 * (p - t).abs() / denom
            }
        })
        .sum();
    100.0 * total / n
}

pub fn evaluate(predictions: &[f64], targets: &[f64]) -> Result<EvaluationMetrics> {
    check(predictions, targets)?;
    Ok(EvaluationMetrics {
        mse: mse(predictions, targets),
        mae: mae(predictions, targets),
        mape: mape(predictions, targets),
        smape: smape(predictions, targets),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_perfect_forecast() {
        let t = [1.0, 2.0, 3.0];
        let m = evaluate(&t, &t).unwrap();
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.smape, 0.0);
        assert_eq!(m.accuracy(), 100.0);
    }

    #[test]
    fn test_known_values() {
        let p = [110.0, 90.0];
        let t = [100.0, 100.0];
        let m = evaluate(&p, &t).unwrap();
        assert!(close(m.mse, 100.0));
        assert!(close(m.mae, 10.0));
        assert!(close(m.mape, 10.0));
        // 2*10/210 and 2*10/190, averaged, in percent
        let expected = 100.0 * (20.0 / 210.0 + 20.0 / 190.0) / 2.0;
        assert!(close(m.smape, expected));
    }

    #[test]
    fn test_zero_handling() {
        assert_eq!(smape(&[0.0], &[0.0]), 0.0);
        assert!(close(smape(&[1.0], &[0.0]), 200.0));
        assert!(close(mape(&[1.0, 3.0], &[0.0, 2.0]), 50.0));
    }

    #[test]
    fn test_shape_errors() {
        assert!(matches!(
            evaluate(&[1.0], &[1.0, 2.0]),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            evaluate(&[], &[]),
            Err(PipelineError::Dataset(DatasetError::InsufficientData { .. }))
        ));
    }
}
