//! Run lifecycle: data, train, eval and deploy in a fixed order.
//!
//! Each enabled stage reads the identifiers produced by the stages before it
//! (dataset version, run name, model version, metadata path) from the
//! [`PipelineReport`]. A skipped stage leaves the values taken from the
//! configuration in place. Only one run may be in flight; the orchestrator
//! is asked before anything is written.

use crate::config::{FlowModule, PipelineConfig, StageFlags};
use crate::deploy::{deploy_model, DeployOutcome, DeployRequest, ServingEndpoint};
use crate::errors::{PipelineError, Result};
use crate::evaluator::{EvaluationJob, ModelEvaluator};
use crate::metrics::{self, EvaluationMetrics};
use crate::orchestrator::Orchestrator;
use crate::trainer::{ModelTrainer, TrainingJob};
use mlops_dataset::{
    ingest_timeseries, DataType, DatasetVersion, IngestRequest, SnapshotStore, SplitTensorSet,
    VersionMetadata,
};
use mlops_registry::model_meta::{
    metadata_file_name, read_model_metadata, write_model_metadata,
};
use mlops_registry::resources::GPU_UNAVAILABLE;
use mlops_registry::train_info::accuracy_from_smape;
use mlops_registry::{
    registry_name, split_ratio_label, DatasetLineage, ModelMetadata, ModelRegistryManager,
    ModelTrainInfo, RegistrationOutcome, RegistrationRequest, ResourceSnapshot, RunStatus,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const DATASET_INFO_FILE: &str = "dataset_info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Data,
    Train,
    Eval,
    Deploy,
}

impl Stage {
    /// Execution order
    pub const ORDER: [Stage; 4] = [Stage::Data, Stage::Train, Stage::Eval, Stage::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Deploy => "deploy",
        }
    }

    fn enabled_in(&self, flags: &StageFlags) -> bool {
        match self {
            Self::Data => flags.data_flow,
            Self::Train => flags.train_flow,
            Self::Eval => flags.eval_flow,
            Self::Deploy => flags.deploy_flow,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run did, and the identifiers it threaded between stages
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: String,
    pub flow: FlowModule,
    pub executed: Vec<Stage>,
    pub skipped: Vec<Stage>,
    pub dataset: String,
    pub data_type: DataType,
    pub dataset_version: Option<DatasetVersion>,
    /// `Some(false)` when the data stage found the source already ingested
    pub dataset_created: Option<bool>,
    pub model_name: String,
    pub model_type: String,
    pub model_version: Option<u64>,
    pub run_name: Option<String>,
    pub training_run_id: Option<String>,
    pub evaluation_run_id: Option<String>,
    pub metadata_file: Option<PathBuf>,
    pub registration: Option<RegistrationOutcome>,
    pub metrics: Option<EvaluationMetrics>,
    pub deployment: Option<DeployOutcome>,
}

impl PipelineReport {
    fn new(run_id: &str, config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            flow: config.flow()?,
            executed: Vec::new(),
            skipped: Vec::new(),
            dataset: config.dataset.ds_name.clone(),
            data_type: config.data_type,
            dataset_version: None,
            dataset_created: None,
            model_name: config.model.model_name.clone(),
            model_type: config.model.model_type.clone(),
            model_version: config
                .model
                .model_version
                .filter(|v| *v > 0)
                .or(config.deploy.model_version.filter(|v| *v > 0)),
            run_name: None,
            training_run_id: None,
            evaluation_run_id: None,
            metadata_file: None,
            registration: None,
            metrics: None,
            deployment: None,
        })
    }
}

/// A started training run and the dataset version it trains on
struct TrainingRun {
    run_id: String,
    run_name: String,
    dataset_version: DatasetVersion,
    dataset_dir: PathBuf,
    dataset: VersionMetadata,
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 1000.0).round() / 1000.0
    }
}

async fn capture_resources() -> ResourceSnapshot {
    match tokio::task::spawn_blocking(ResourceSnapshot::capture).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Resource snapshot failed");
            ResourceSnapshot {
                cpu_percent: 0.0,
                memory_percent: 0.0,
                gpu: GPU_UNAVAILABLE.to_string(),
            }
        }
    }
}

fn health_of(resources: &ResourceSnapshot) -> String {
    if resources.cpu_health() == "fulfilled" && resources.memory_health() == "fulfilled" {
        "healthy".to_string()
    } else {
        "warning".to_string()
    }
}

/// Sequences the pipeline stages of one run
pub struct RunLifecycleCoordinator {
    config: PipelineConfig,
    store: SnapshotStore,
    registry: ModelRegistryManager,
    orchestrator: Arc<dyn Orchestrator>,
    trainer: Option<Arc<dyn ModelTrainer>>,
    evaluator: Option<Arc<dyn ModelEvaluator>>,
    serving: Option<Arc<dyn ServingEndpoint>>,
    log_file: Option<PathBuf>,
}

impl RunLifecycleCoordinator {
    pub fn new(
        config: PipelineConfig,
        store: SnapshotStore,
        registry: ModelRegistryManager,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            orchestrator,
            trainer: None,
            evaluator: None,
            serving: None,
            log_file: None,
        }
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn ModelTrainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ModelEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_serving(mut self, serving: Arc<dyn ServingEndpoint>) -> Self {
        self.serving = Some(serving);
        self
    }

    /// Log file recorded in run tags.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistryManager {
        &self.registry
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn log_file_label(&self) -> String {
        self.log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    /// `<model_root>/<data_type>/<run_name>`
    fn model_dir(&self, run_name: &str) -> PathBuf {
        self.config
            .storage
            .model_root()
            .join(self.config.data_type.to_string())
            .join(run_name)
    }

    fn work_dir(&self, run_id: &str) -> PathBuf {
        self.config.storage.log_root().join("jobs").join(run_id)
    }

    fn check_collaborators(&self, stages: &StageFlags) -> Result<()> {
        let missing = |what: &str| -> Result<()> {
            Err(PipelineError::Configuration(format!("no {what} configured")))
        };
        if stages.train_flow && self.trainer.is_none() {
            return missing("trainer");
        }
        if stages.eval_flow && self.evaluator.is_none() {
            return missing("evaluator");
        }
        if stages.deploy_flow && self.serving.is_none() {
            return missing("serving endpoint");
        }
        Ok(())
    }

    /// Execute every enabled stage in order.
    ///
    /// Fails with `PipelineBusy` before touching any store when the
    /// orchestrator reports another active run. The first failing stage
    /// aborts the run; its error is returned after the training run (if
    /// any) is tagged `failed`.
    pub async fn run(&self, run_id: &str) -> Result<PipelineReport> {
        self.config.validate()?;
        let stages = self.config.enabled_stages()?;
        self.check_collaborators(&stages)?;

        if self.orchestrator.is_any_run_active().await? {
            return Err(PipelineError::PipelineBusy(format!(
                "{} reports an active pipeline run",
                self.orchestrator.name()
            )));
        }
        let _claim = self.orchestrator.claim(run_id).await?;

        let mut report = PipelineReport::new(run_id, &self.config)?;
        info!(run_id, flow = %report.flow, dataset = %report.dataset, model = %report.model_name, "Pipeline started");

        for stage in Stage::ORDER {
            if !stage.enabled_in(&stages) {
                info!(%stage, "Stage skipped");
                report.skipped.push(stage);
                continue;
            }

            info!(%stage, "Stage started");
            let started = Instant::now();
            if let Err(err) = self.run_stage(stage, &mut report).await {
                error!(%stage, category = err.category(), error = %err, "Stage failed");
                self.tag_final_status(&report, "failed").await;
                return Err(err);
            }
            info!(%stage, elapsed_ms = started.elapsed().as_millis() as u64, "Stage finished");
            report.executed.push(stage);
        }

        self.tag_final_status(&report, "completed").await;
        info!(
            run_id,
            executed = report.executed.len(),
            model_version = ?report.model_version,
            "Pipeline finished"
        );
        Ok(report)
    }

    async fn run_stage(&self, stage: Stage, report: &mut PipelineReport) -> Result<()> {
        match stage {
            Stage::Data => self.data_stage(report),
            Stage::Train => self.train_stage(report).await,
            Stage::Eval => self.eval_stage(report).await,
            Stage::Deploy => self.deploy_stage(report).await,
        }
    }

    async fn tag_final_status(&self, report: &PipelineReport, status: &str) {
        let Some(run_id) = &report.training_run_id else {
            return;
        };
        if let Err(e) = self.registry.tracker().set_tag(run_id, "status", status).await {
            warn!(run_id = %run_id, error = %e, "Could not set final status tag");
        }
    }

    /// Dataset version a stage should read: the one produced by the data
    /// stage, otherwise the latest complete version on disk.
    fn current_dataset_version(&self, report: &PipelineReport) -> Result<DatasetVersion> {
        if let Some(version) = report.dataset_version {
            return Ok(version);
        }
        self.store
            .latest_complete_version(&report.dataset)?
            .ok_or_else(|| {
                PipelineError::ArtifactNotFound(format!(
                    "no complete version of dataset '{}' under {}",
                    report.dataset,
                    self.store.dataset_root(&report.dataset).display()
                ))
            })
    }

    fn data_stage(&self, report: &mut PipelineReport) -> Result<()> {
        let ds = &self.config.dataset;
        let source = ds.file_path.clone().ok_or_else(|| {
            PipelineError::Configuration("dataset.file_path is required".into())
        })?;

        let mut request =
            IngestRequest::new(&ds.ds_name, source, &ds.date_col, &ds.target_col, ds.time_step);
        request.data_type = self.config.data_type;
        request.test_fraction = ds.test_fraction;
        request.val_fraction = ds.val_fraction;
        request.cleaning = ds.cleaning.clone();
        request.author = ds.ds_author.clone();
        request.description = ds.ds_description.clone();
        request.tags = ds.dvc_tag.clone();

        let outcome = ingest_timeseries(&self.store, &request)?;
        info!(
            dataset = %outcome.dataset,
            version = %outcome.version,
            created = outcome.created,
            dir = %outcome.version_dir.display(),
            "Dataset ready"
        );
        report.dataset_version = Some(outcome.version);
        report.dataset_created = Some(outcome.created);
        Ok(())
    }

    async fn train_stage(&self, report: &mut PipelineReport) -> Result<()> {
        let trainer = self
            .trainer
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no trainer configured".into()))?;
        let dataset_version = self.current_dataset_version(report)?;
        let dataset = self.store.load_version_metadata(&report.dataset, &dataset_version)?;
        let dataset_dir = self.store.version_dir(&report.dataset, &dataset_version);
        report.dataset_version = Some(dataset_version);

        let model = &self.config.model;
        let experiment_cfg = &self.config.train.mlflow;
        let tracker = self.registry.tracker();
        let experiment = tracker
            .create_experiment_if_absent(&experiment_cfg.exp_name)
            .await?;
        let run_name = self
            .registry
            .next_run_name(&experiment.experiment_id, &model.model_name, &model.model_type)
            .await?;
        let run = tracker
            .start_run(&experiment.experiment_id, &run_name, &experiment_cfg.exp_desc)
            .await?;
        info!(run_id = %run.run_id, run = %run_name, experiment = %experiment.name, "Training run started");

        report.run_name = Some(run_name.clone());
        report.training_run_id = Some(run.run_id.clone());

        let training = TrainingRun {
            run_id: run.run_id,
            run_name,
            dataset_version,
            dataset_dir,
            dataset,
        };
        match self.train_in_run(trainer.as_ref(), &training, report).await {
            Ok(()) => {
                tracker.end_run(&training.run_id, RunStatus::Finished).await?;
                Ok(())
            }
            Err(err) => {
                if let Err(e) = tracker.end_run(&training.run_id, RunStatus::Failed).await {
                    warn!(run_id = %training.run_id, error = %e, "Could not close failed run");
                }
                Err(err)
            }
        }
    }

    fn write_dataset_info(&self, dir: &Path, run: &TrainingRun) -> Result<PathBuf> {
        let ds = &self.config.dataset;
        let split = &run.dataset.split_sizes;
        let total = split.train + split.val + split.test;
        let info = json!({
            "dataset_name": run.dataset.name,
            "dataset_version": run.dataset_version.to_string(),
            "data_type": self.config.data_type.to_string(),
            "dataset_path": run.dataset_dir.display().to_string(),
            "date_column": ds.date_col,
            "target_column": ds.target_col,
            "sequences": run.dataset.window_size,
            "num_samples": total,
            "train_samples": split.train,
            "val_samples": split.val,
            "test_samples": split.test,
            "train_ratio": ratio(split.train, total),
            "val_ratio": ratio(split.val, total),
            "test_ratio": ratio(split.test, total),
        });
        let path = dir.join(DATASET_INFO_FILE);
        fs::write(&path, serde_json::to_string_pretty(&info)?)
            .map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }

    async fn train_in_run(
        &self,
        trainer: &dyn ModelTrainer,
        run: &TrainingRun,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let model = &self.config.model;
        let hparams = &self.config.train.hparams;
        let data_type = self.config.data_type.to_string();
        let tracker = self.registry.tracker();
        let log_file = self.log_file_label();

        let mut params: BTreeMap<String, String> = hparams
            .as_map()
            .iter()
            .map(|(k, v)| (k.clone(), param_value(v)))
            .collect();
        params.insert("model_name".into(), model.model_name.clone());
        params.insert("model_type".into(), model.model_type.clone());
        params.insert("dataset".into(), report.dataset.clone());
        params.insert("dataset_version".into(), run.dataset_version.to_string());
        tracker.log_params(&run.run_id, &params).await?;

        let now = timestamp();
        let initial_tags = [
            ("model_type", model.model_type.clone()),
            ("log_file", log_file.clone()),
            ("framework", model.framework.to_string()),
            ("status", "training".to_string()),
            ("dataset", report.dataset.clone()),
            ("data_type", data_type.clone()),
            ("epochs", hparams.epochs.to_string()),
            ("learning_rate", hparams.learning_rate.to_string()),
            ("createdAt", now.clone()),
            ("updatedAt", now),
        ];
        for (key, value) in &initial_tags {
            tracker.set_tag(&run.run_id, key, value).await?;
        }

        let model_dir = self.model_dir(&run.run_name);
        fs::create_dir_all(&model_dir).map_err(|e| PipelineError::io(&model_dir, e))?;

        let info_path = self.write_dataset_info(&model_dir, run)?;
        tracker.log_artifact(&run.run_id, &info_path).await?;

        let split = &run.dataset.split_sizes;
        let split_label = split_ratio_label(split.train, split.val, split.test);
        let lineage = DatasetLineage {
            name: report.dataset.clone(),
            version: Some(run.dataset_version.to_string()),
            data_type: data_type.clone(),
            rows: Some(run.dataset.rows),
            split: Some(split_label.clone()),
            format: Some(run.dataset.format.clone()),
        };
        let metadata = ModelMetadata::new(&model.model_name, &model.model_type, model.framework, lineage)
            .with_hparams(hparams.as_map());
        let metadata_file = write_model_metadata(&model_dir, &metadata)?;
        report.metadata_file = Some(metadata_file.clone());

        let job = TrainingJob {
            run_id: run.run_id.clone(),
            run_name: run.run_name.clone(),
            model_name: model.model_name.clone(),
            model_type: model.model_type.clone(),
            framework: model.framework,
            epochs: hparams.epochs,
            hparams: hparams.as_map(),
            dataset: report.dataset.clone(),
            dataset_version: run.dataset_version.to_string(),
            dataset_dir: run.dataset_dir.clone(),
            model_dir: model_dir.clone(),
            work_dir: self.work_dir(&run.run_id),
        };
        let started = Instant::now();
        let result = trainer.train(&job).await?;
        let training_time = started.elapsed().as_secs_f64();

        let weights = model_dir.join(model.framework.weights_file());
        if !weights.is_file() {
            return Err(PipelineError::ArtifactNotFound(weights.display().to_string()));
        }

        let accuracy = accuracy_from_smape(result.smape);
        tracker
            .log_metric(&run.run_id, "final_loss", result.final_loss, 0)
            .await?;
        tracker.log_metric(&run.run_id, "smape", result.smape, 0).await?;
        tracker.log_metric(&run.run_id, "accuracy", accuracy, 0).await?;
        let final_tags = [
            ("accuracy", accuracy.to_string()),
            ("training_time", format!("{training_time:.2}")),
            ("final_loss", result.final_loss.to_string()),
            ("status", "trained".to_string()),
            ("updatedAt", timestamp()),
        ];
        for (key, value) in &final_tags {
            tracker.set_tag(&run.run_id, key, value).await?;
        }
        tracker.log_artifact(&run.run_id, &metadata_file).await?;
        info!(
            run = %run.run_name,
            final_loss = result.final_loss,
            smape = result.smape,
            training_time,
            "Training complete"
        );

        let resources = capture_resources().await;
        let train_info = ModelTrainInfo {
            training_time,
            log_file,
            dataset_name: report.dataset.clone(),
            data_type,
            dataset_size: split.train + split.val + split.test,
            dataset_split: split_label,
            dataset_format: run.dataset.format.clone(),
            task: report.dataset.clone(),
            model_type: model.model_type.clone(),
            train_epochs: hparams.epochs,
            is_deployed: false,
            health: health_of(&resources),
            resources,
        };
        let request = RegistrationRequest::for_run(
            &model_dir,
            &model.model_name,
            &run.run_id,
            model.framework,
            result.smape,
            result.final_loss,
            train_info,
        );
        let outcome = self.registry.register_if_changed(&request).await?;

        match &outcome {
            RegistrationOutcome::Unchanged { .. } => {
                report.model_version = self.unchanged_version(&request.registry_name).await?;
            }
            RegistrationOutcome::Failed { version, error } => {
                warn!(model = %request.registry_name, %error, "Registration incomplete; training result kept");
                if let Some(v) = version {
                    report.model_version = Some(v.version);
                }
            }
            other => report.model_version = other.version_number(),
        }
        report.registration = Some(outcome);
        Ok(())
    }

    /// Version that stands for an artifact identical to an earlier one.
    async fn unchanged_version(&self, registry_name: &str) -> Result<Option<u64>> {
        if let Some(version) = self.registry.recorded_version(registry_name)? {
            return Ok(Some(version));
        }
        Ok(self
            .registry
            .resolve_version(registry_name, None)
            .await
            .ok()
            .map(|v| v.version))
    }

    async fn eval_stage(&self, report: &mut PipelineReport) -> Result<()> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no evaluator configured".into()))?;
        let registry_name = registry_name(&report.model_name);
        let version = self
            .registry
            .resolve_version(&registry_name, report.model_version)
            .await?;
        let tracker = self.registry.tracker();
        let train_run = tracker.get_run(&version.run_id).await?;

        let model_dir = self.model_dir(&train_run.run_name);
        if !model_dir.is_dir() {
            return Err(PipelineError::ArtifactNotFound(model_dir.display().to_string()));
        }
        let metadata_file = model_dir.join(metadata_file_name(&report.model_name));
        let metadata = read_model_metadata(&metadata_file)?;

        let dataset_version = self.current_dataset_version(report)?;
        let tensors = self.store.load_tensors(&report.dataset, &dataset_version)?;

        let experiment_cfg = &self.config.evaluate.mlflow;
        let experiment = tracker
            .create_experiment_if_absent(&experiment_cfg.exp_name)
            .await?;
        let eval_name = format!("eval_{}", train_run.run_name);
        let run = tracker
            .start_run(&experiment.experiment_id, &eval_name, &experiment_cfg.exp_desc)
            .await?;
        report.evaluation_run_id = Some(run.run_id.clone());

        let job = EvaluationJob {
            run_name: train_run.run_name.clone(),
            model_name: metadata.model_name.clone(),
            model_type: metadata.model_type.clone(),
            framework: metadata.framework,
            model_dir,
            dataset_dir: self.store.version_dir(&report.dataset, &dataset_version),
            work_dir: self.work_dir(&run.run_id),
        };

        let evaluated = self
            .evaluate_in_run(evaluator.as_ref(), &run.run_id, &job, &tensors, &metadata_file, report)
            .await;
        let status = if evaluated.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = tracker.end_run(&run.run_id, status).await {
            warn!(run_id = %run.run_id, error = %e, "Could not close evaluation run");
        }
        let metrics = evaluated?;

        info!(
            model = %registry_name,
            version = version.version,
            mse = metrics.mse,
            mae = metrics.mae,
            mape = metrics.mape,
            smape = metrics.smape,
            "Evaluation complete"
        );
        report.dataset_version = Some(dataset_version);
        report.model_version = Some(version.version);
        report.run_name.get_or_insert(train_run.run_name);
        report.metadata_file.get_or_insert(metadata_file);
        report.metrics = Some(metrics);
        Ok(())
    }

    async fn evaluate_in_run(
        &self,
        evaluator: &dyn ModelEvaluator,
        run_id: &str,
        job: &EvaluationJob,
        tensors: &SplitTensorSet,
        metadata_file: &Path,
        report: &PipelineReport,
    ) -> Result<EvaluationMetrics> {
        let tracker = self.registry.tracker();
        let predictions = evaluator.predict(job).await?;

        let predicted = tensors.scaler.inverse_transform(&predictions);
        let actual = tensors.scaler.inverse_transform(&tensors.y_test);
        let metrics = metrics::evaluate(&predicted, &actual)?;

        for (key, value) in [
            ("mse", metrics.mse),
            ("mae", metrics.mae),
            ("mape", metrics.mape),
            ("smape", metrics.smape),
        ] {
            tracker.log_metric(run_id, key, value, 0).await?;
        }

        let now = timestamp();
        let tags = [
            ("model_type", job.model_type.clone()),
            ("train_run_name", job.run_name.clone()),
            ("framework", job.framework.to_string()),
            ("status", "evaluated".to_string()),
            ("accuracy", metrics.accuracy().to_string()),
            ("dataset", report.dataset.clone()),
            ("final_loss", metrics.mse.to_string()),
            ("createdAt", now.clone()),
            ("updatedAt", now),
        ];
        for (key, value) in &tags {
            tracker.set_tag(run_id, key, value).await?;
        }
        tracker.log_artifact(run_id, metadata_file).await?;
        Ok(metrics)
    }

    async fn deploy_stage(&self, report: &mut PipelineReport) -> Result<()> {
        let serving = self
            .serving
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no serving endpoint configured".into()))?;
        let request = DeployRequest {
            model_name: report.model_name.clone(),
            data_type: report.data_type,
            model_version: report.model_version,
        };
        let outcome = deploy_model(
            &self.registry,
            serving.as_ref(),
            &self.config.storage.model_root(),
            &request,
        )
        .await?;

        report.model_version = Some(outcome.model_version);
        report.run_name.get_or_insert_with(|| outcome.run_name.clone());
        report
            .metadata_file
            .get_or_insert_with(|| outcome.metadata_file.clone());
        report.deployment = Some(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    #[test]
    fn test_report_seeds_from_config() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.deploy.model_version = Some(3);
        let report = PipelineReport::new("r1", &config).unwrap();
        assert_eq!(report.flow, FlowModule::Full);
        assert_eq!(report.dataset, "sales");
        assert_eq!(report.model_version, Some(3));

        config.model.model_version = Some(0);
        config.deploy.model_version = None;
        let report = PipelineReport::new("r1", &config).unwrap();
        assert_eq!(report.model_version, None);
    }

    #[test]
    fn test_stage_order_and_flags() {
        let flags = StageFlags {
            data_flow: false,
            train_flow: true,
            eval_flow: false,
            deploy_flow: true,
        };
        let enabled: Vec<Stage> = Stage::ORDER
            .into_iter()
            .filter(|s| s.enabled_in(&flags))
            .collect();
        assert_eq!(enabled, vec![Stage::Train, Stage::Deploy]);
        assert_eq!(Stage::Eval.to_string(), "eval");
    }

    #[test]
    fn test_ratio_rounding() {
        assert_eq!(ratio(1, 3), 0.333);
        assert_eq!(ratio(0, 0), 0.0);
    }
}
