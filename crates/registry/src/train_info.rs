//! Training summary attached to registered versions as tags.

use crate::resources::ResourceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `"Train a%, Validate b%, Test c%"` from split example counts, each
/// percentage rounded to one decimal.
pub fn split_ratio_label(train: usize, val: usize, test: usize) -> String {
    let total = (train + val + test).max(1) as f64;
    let pct = |n: usize| (n as f64 / total * 1000.0).round() / 10.0;
    format!(
        "Train {:.1}%, Validate {:.1}%, Test {:.1}%",
        pct(train),
        pct(val),
        pct(test)
    )
}

/// Accuracy proxy derived from SMAPE, rounded to one decimal.
pub fn accuracy_from_smape(smape: f64) -> f64 {
    ((100.0 - smape) * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrainInfo {
    /// Wall-clock training duration in seconds
    pub training_time: f64,
    pub log_file: String,
    pub dataset_name: String,
    pub data_type: String,
    /// Number of windowed examples across all splits
    pub dataset_size: usize,
    pub dataset_split: String,
    pub dataset_format: String,
    pub task: String,
    pub model_type: String,
    pub train_epochs: u32,
    pub is_deployed: bool,
    pub health: String,
    pub resources: ResourceSnapshot,
}

impl ModelTrainInfo {
    pub fn to_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("training_time".into(), format!("{:.2}", self.training_time));
        tags.insert("log_file".into(), self.log_file.clone());
        tags.insert("dataset_name".into(), self.dataset_name.clone());
        tags.insert("data_type".into(), self.data_type.clone());
        tags.insert("dataset_size".into(), format!("{} row", self.dataset_size));
        tags.insert("dataset_split".into(), self.dataset_split.clone());
        tags.insert("dataset_format".into(), self.dataset_format.clone());
        tags.insert("task".into(), self.task.clone());
        tags.insert("model_type".into(), self.model_type.clone());
        tags.insert("train_epochs".into(), self.train_epochs.to_string());
        tags.insert("isDeployed".into(), self.is_deployed.to_string());
        tags.insert("health".into(), self.health.clone());
        tags.insert("cpu".into(), self.resources.cpu_health().to_string());
        tags.insert("memory".into(), self.resources.memory_health().to_string());
        tags.insert("gpu".into(), self.resources.gpu.clone());
        tags
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_info() -> ModelTrainInfo {
        ModelTrainInfo {
            training_time: 12.5,
            log_file: "/logs/train_flow/abc.log".into(),
            dataset_name: "sales".into(),
            data_type: "timeseries".into(),
            dataset_size: 490,
            dataset_split: split_ratio_label(343, 49, 98),
            dataset_format: "CSV/TXT".into(),
            task: "sales".into(),
            model_type: "GRU".into(),
            train_epochs: 20,
            is_deployed: false,
            health: "healthy".into(),
            resources: ResourceSnapshot {
                cpu_percent: 35.0,
                memory_percent: 91.0,
                gpu: "unavailable".into(),
            },
        }
    }

    #[test]
    fn test_split_label() {
        assert_eq!(
            split_ratio_label(343, 49, 98),
            "Train 70.0%, Validate 10.0%, Test 20.0%"
        );
        assert_eq!(split_ratio_label(0, 0, 0), "Train 0.0%, Validate 0.0%, Test 0.0%");
    }

    #[test]
    fn test_accuracy_rounding() {
        assert_eq!(accuracy_from_smape(12.34), 87.7);
        assert_eq!(accuracy_from_smape(0.0), 100.0);
    }

    #[test]
    fn test_tags() {
        let tags = sample_info().to_tags();
        assert_eq!(tags["dataset_size"], "490 row");
        assert_eq!(tags["cpu"], "fulfilled");
        assert_eq!(tags["memory"], "warning");
        assert_eq!(tags["isDeployed"], "false");
        assert_eq!(tags["training_time"], "12.50");
    }
}
