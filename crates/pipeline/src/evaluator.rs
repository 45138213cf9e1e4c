//! External inference adapter used by the eval stage.

use crate::errors::{PipelineError, Result};
use crate::trainer::{run_job_program, write_job};
use async_trait::async_trait;
use mlops_registry::Framework;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EVALUATION_JOB_FILE: &str = "evaluation_job.json";
pub const PREDICTIONS_FILE: &str = "predictions.npy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub run_name: String,
    pub model_name: String,
    pub model_type: String,
    pub framework: Framework,
    /// Trained run directory with weights and `<model_name>.yaml`
    pub model_dir: PathBuf,
    /// Dataset version folder; the evaluator predicts `X_test.npy`
    pub dataset_dir: PathBuf,
    pub work_dir: PathBuf,
}

#[async_trait]
pub trait ModelEvaluator: Send + Sync {
    /// Scaled one-step predictions, one per row of `X_test`.
    async fn predict(&self, job: &EvaluationJob) -> Result<Vec<f64>>;

    fn name(&self) -> &'static str;
}

/// Runs `<program> <args..> --job <work_dir>/evaluation_job.json` and reads
/// `<work_dir>/predictions.npy`.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

fn read_predictions(path: &Path) -> Result<Vec<f64>> {
    if !path.is_file() {
        return Err(PipelineError::ArtifactNotFound(path.display().to_string()));
    }
    Ok(mlops_dataset::npy::read_vector(path)?)
}

#[async_trait]
impl ModelEvaluator for CommandEvaluator {
    async fn predict(&self, job: &EvaluationJob) -> Result<Vec<f64>> {
        let job_file = job.work_dir.join(EVALUATION_JOB_FILE);
        let predictions = job.work_dir.join(PREDICTIONS_FILE);
        write_job(&job_file, job)?;
        let _ = fs::remove_file(&predictions);

        run_job_program("evaluator", &self.program, &self.args, &job_file).await?;

        let values = read_predictions(&predictions)?;
        info!(run = %job.run_name, predictions = values.len(), "Evaluator finished");
        Ok(values)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
