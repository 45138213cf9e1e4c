//! Experiment tracker interface.

use crate::errors::Result;
use crate::types::{
    Experiment, ModelStage, RegisteredModel, RegisteredModelVersion, RunInfo, RunStatus,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Operations consumed from an experiment tracking and model registry
/// backend.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Look up an experiment by name, creating it when absent.
    async fn create_experiment_if_absent(&self, name: &str) -> Result<Experiment>;

    async fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        description: &str,
    ) -> Result<RunInfo>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()>;

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: i64) -> Result<()>;

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Attach a local file to the run.
    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<RunInfo>;

    /// All runs of an experiment.
    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>>;

    async fn search_registered_models(&self) -> Result<Vec<RegisteredModel>>;

    /// All versions registered under `name`.
    async fn search_model_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>>;

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel>;

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<RegisteredModelVersion>;

    async fn update_model_version(&self, name: &str, version: u64, description: &str)
        -> Result<()>;

    async fn transition_stage(&self, name: &str, version: u64, stage: ModelStage) -> Result<()>;

    async fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<()>;

    async fn set_model_version_tag(
        &self,
        name: &str,
        version: u64,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;
}
