//! External training adapter.
//!
//! Model architectures and training loops live outside this workspace. A
//! trainer receives a [`TrainingJob`], writes its weights into the job's
//! model directory and reports a [`TrainingResult`].

use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use mlops_registry::Framework;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub const TRAINING_JOB_FILE: &str = "training_job.json";
pub const TRAINING_RESULT_FILE: &str = "training_result.json";

/// Work order handed to a trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub run_id: String,
    pub run_name: String,
    pub model_name: String,
    pub model_type: String,
    pub framework: Framework,
    pub epochs: u32,
    pub hparams: BTreeMap<String, Value>,
    pub dataset: String,
    pub dataset_version: String,
    /// Version folder holding `X_*.npy`, `y_*.npy` and the scaler
    pub dataset_dir: PathBuf,
    /// Where the weights go. Everything in it is part of the content hash.
    pub model_dir: PathBuf,
    /// Scratch space for job and result files, outside `model_dir`
    pub work_dir: PathBuf,
}

/// Reported by the trainer once the weights are saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub final_loss: f64,
    /// Validation SMAPE in percent
    pub smape: f64,
}

#[async_trait]
pub trait ModelTrainer: Send + Sync {
    async fn train(&self, job: &TrainingJob) -> Result<TrainingResult>;

    fn name(&self) -> &'static str;
}

/// Runs `<program> <args..> --job <work_dir>/training_job.json` and reads
/// `<work_dir>/training_result.json` back.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTrainer {
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

/// Serialize `job` to `path` as pretty JSON.
pub(crate) fn write_job<T: Serialize>(path: &Path, job: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    }
    let body = serde_json::to_string_pretty(job)?;
    fs::write(path, body).map_err(|e| PipelineError::io(path, e))
}

/// Run an external job program to completion. A non-zero exit is an
/// `ExternalService` error carrying the tail of stderr.
pub(crate) async fn run_job_program(
    service: &str,
    program: &Path,
    args: &[String],
    job_file: &Path,
) -> Result<()> {
    debug!(%service, program = %program.display(), ?args, job = %job_file.display(), "Starting job program");
    let output = Command::new(program)
        .args(args)
        .arg("--job")
        .arg(job_file)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PipelineError::external(service, format!("{}: {e}", program.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(PipelineError::external(
            service,
            format!("{} exited with {}: {}", program.display(), output.status, tail.join(" | ")),
        ));
    }
    Ok(())
}

#[async_trait]
impl ModelTrainer for CommandTrainer {
    async fn train(&self, job: &TrainingJob) -> Result<TrainingResult> {
        let job_file = job.work_dir.join(TRAINING_JOB_FILE);
        let result_file = job.work_dir.join(TRAINING_RESULT_FILE);
        fs::create_dir_all(&job.model_dir).map_err(|e| PipelineError::io(&job.model_dir, e))?;
        write_job(&job_file, job)?;
        // A stale result from an earlier attempt must not be mistaken for this one.
        let _ = fs::remove_file(&result_file);

        run_job_program("trainer", &self.program, &self.args, &job_file).await?;

        if !result_file.is_file() {
            return Err(PipelineError::ArtifactNotFound(
                result_file.display().to_string(),
            ));
        }
        let raw = fs::read_to_string(&result_file).map_err(|e| PipelineError::io(&result_file, e))?;
        let result: TrainingResult = serde_json::from_str(&raw)?;
        info!(
            run = %job.run_name,
            final_loss = result.final_loss,
            smape = result.smape,
            "Trainer finished"
        );
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_job(root: &Path) -> TrainingJob {
        TrainingJob {
            run_id: "r1".into(),
            run_name: "sales_model_ver001_GRU".into(),
            model_name: "sales".into(),
            model_type: "GRU".into(),
            framework: Framework::Tensorflow,
            epochs: 2,
            hparams: BTreeMap::new(),
            dataset: "sales".into(),
            dataset_version: "1.0.0".into(),
            dataset_dir: root.join("datasets/sales/versions/1.0.0"),
            model_dir: root.join("models/timeseries/sales_model_ver001_GRU"),
            work_dir: root.join("jobs/r1"),
        }
    }

    #[test]
    fn test_job_file_round_trip() {
        let dir = tempdir().unwrap();
        let job = sample_job(dir.path());
        let path = job.work_dir.join(TRAINING_JOB_FILE);
        write_job(&path, &job).unwrap();
        let back: TrainingJob =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_is_external_error() {
        let dir = tempdir().unwrap();
        let job = sample_job(dir.path());
        let trainer = CommandTrainer::new("false");
        match trainer.train(&job).await {
            Err(PipelineError::ExternalService { service, .. }) => assert_eq!(service, "trainer"),
            other => panic!("expected external error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_result_file() {
        let dir = tempdir().unwrap();
        let job = sample_job(dir.path());
        let trainer = CommandTrainer::new("true");
        assert!(matches!(
            trainer.train(&job).await,
            Err(PipelineError::ArtifactNotFound(_))
        ));
        assert!(job.work_dir.join(TRAINING_JOB_FILE).is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_result_read_back() {
        let dir = tempdir().unwrap();
        let job = sample_job(dir.path());
        let result_file = job.work_dir.join(TRAINING_RESULT_FILE);
        let script = format!(
            "echo '{{\"final_loss\": 0.5, \"smape\": 12.0}}' > {}",
            result_file.display()
        );
        let trainer = CommandTrainer::new("sh").with_args(["-c", script.as_str(), "trainer"]);
        let result = trainer.train(&job).await.unwrap();
        assert_eq!(result.final_loss, 0.5);
        assert_eq!(result.smape, 12.0);
    }
}
