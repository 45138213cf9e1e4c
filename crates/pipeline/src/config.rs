//! Run configuration.
//!
//! A YAML or JSON document is parsed into typed sections, storage roots and
//! service URLs missing from the file are filled from the environment,
//! command-line overrides are applied, and the result is validated once
//! before any stage runs.

use crate::errors::{PipelineError, Result};
use mlops_dataset::features::{DEFAULT_TEST_FRACTION, DEFAULT_VAL_FRACTION};
use mlops_dataset::{CleaningPolicy, DataType};
use mlops_registry::{Framework, ModelStage};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_CENTRAL_STORAGE: &str = "CENTRAL_STORAGE_PATH";
pub const ENV_DATASET_STORAGE: &str = "DVC_DATA_STORAGE";
pub const ENV_MODEL_STORAGE: &str = "MODEL_STORAGE_PATH";
pub const ENV_LOG_PATH: &str = "PIPELINE_LOG_PATH";
pub const ENV_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";
pub const ENV_PREFECT_API: &str = "PREFECT_API_URL";

const DEFAULT_CENTRAL_STORAGE: &str = "central_storage";
const DEFAULT_SERVING_URL: &str = "http://nginx:90";

/// Which flow the run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowModule {
    /// All stages enabled by [`StageFlags`]
    Full,
    Data,
    Train,
    Eval,
    Deploy,
}

impl FlowModule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full_flow",
            Self::Data => "data_flow",
            Self::Train => "train_flow",
            Self::Eval => "eval_flow",
            Self::Deploy => "deploy_flow",
        }
    }
}

impl fmt::Display for FlowModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowModule {
    type Err = PipelineError;

    /// Accepts `full_flow` as well as the dotted `flows.full_flow` form.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        let name = name.strip_prefix("flows.").unwrap_or(name);
        match name {
            "full_flow" => Ok(Self::Full),
            "data_flow" => Ok(Self::Data),
            "train_flow" => Ok(Self::Train),
            "eval_flow" => Ok(Self::Eval),
            "deploy_flow" => Ok(Self::Deploy),
            other => Err(PipelineError::Configuration(format!(
                "unknown flow module '{other}'"
            ))),
        }
    }
}

/// Accepts `true`/`false` as well as `1`/`0`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(i) => Ok(i != 0),
    }
}

/// Per-stage enable flags for `full_flow`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    #[serde(default, deserialize_with = "flag")]
    pub data_flow: bool,
    #[serde(default, deserialize_with = "flag")]
    pub train_flow: bool,
    #[serde(default, deserialize_with = "flag")]
    pub eval_flow: bool,
    #[serde(default, deserialize_with = "flag")]
    pub deploy_flow: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            data_flow: true,
            train_flow: true,
            eval_flow: true,
            deploy_flow: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub ds_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default = "default_date_col")]
    pub date_col: String,
    #[serde(default)]
    pub target_col: String,
    /// Window length
    #[serde(default = "default_time_step")]
    pub time_step: usize,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,
    #[serde(default)]
    pub cleaning: CleaningPolicy,
    #[serde(default = "default_author")]
    pub ds_author: String,
    #[serde(default = "default_description")]
    pub ds_description: String,
    #[serde(default)]
    pub dvc_tag: Vec<String>,
    /// Track new versions with the data-versioning tool
    #[serde(default)]
    pub dvc_track: bool,
}

fn default_date_col() -> String {
    "date".to_string()
}

fn default_time_step() -> usize {
    30
}

fn default_test_fraction() -> f64 {
    DEFAULT_TEST_FRACTION
}

fn default_val_fraction() -> f64 {
    DEFAULT_VAL_FRACTION
}

fn default_author() -> String {
    "unknown".to_string()
}

fn default_description() -> String {
    "No description".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub model_type: String,
    /// `None` or `0` selects the latest registered version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u64>,
    #[serde(default = "default_framework")]
    pub framework: Framework,
}

fn default_framework() -> Framework {
    Framework::Tensorflow
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub exp_name: String,
    #[serde(default)]
    pub exp_desc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate", alias = "learningRate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size", alias = "batchSize")]
    pub batch_size: u32,
    /// Model-specific settings passed through to the trainer
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_epochs() -> u32 {
    10
}

fn default_learning_rate() -> f64 {
    0.001
}

fn default_batch_size() -> u32 {
    128
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            extra: BTreeMap::new(),
        }
    }
}

impl Hyperparameters {
    /// Every hyperparameter as a flat map, named as logged to the tracker.
    pub fn as_map(&self) -> BTreeMap<String, Value> {
        let mut map = self.extra.clone();
        map.insert("epochs".into(), Value::from(self.epochs));
        map.insert("learning_rate".into(), Value::from(self.learning_rate));
        map.insert("batch_size".into(), Value::from(self.batch_size));
        map
    }
}

/// External program run with `--job <file>` appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub mlflow: ExperimentConfig,
    #[serde(default)]
    pub hparams: Hyperparameters,
    /// Stage assigned to freshly registered versions
    #[serde(default = "default_initial_stage")]
    pub initial_stage: ModelStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<JobCommand>,
}

fn default_initial_stage() -> ModelStage {
    ModelStage::Staging
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateConfig {
    pub mlflow: ExperimentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<JobCommand>,
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            mlflow: ExperimentConfig {
                exp_name: "evaluation".to_string(),
                exp_desc: "Evaluation for latest model version".to_string(),
            },
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// `None` or `0` selects the latest registered version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u64>,
    #[serde(default = "default_serving_url")]
    pub service_url: String,
}

fn default_serving_url() -> String {
    DEFAULT_SERVING_URL.to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            model_version: None,
            service_url: default_serving_url(),
        }
    }
}

/// Filesystem roots. Anything left unset is filled from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_root: Option<PathBuf>,
}

impl StorageConfig {
    fn central(&self) -> PathBuf {
        self.central_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CENTRAL_STORAGE))
    }

    pub fn dataset_root(&self) -> PathBuf {
        self.dataset_root
            .clone()
            .unwrap_or_else(|| self.central().join("datasets"))
    }

    pub fn model_root(&self) -> PathBuf {
        self.model_root
            .clone()
            .unwrap_or_else(|| self.central().join("models"))
    }

    pub fn log_root(&self) -> PathBuf {
        self.log_root
            .clone()
            .unwrap_or_else(|| self.central().join("logs"))
    }

    /// State file of the local experiment tracker.
    pub fn tracking_state_path(&self) -> PathBuf {
        self.central().join("tracking").join("tracker_state.json")
    }
}

/// External services. A missing tracking URI selects the local tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_url: Option<String>,
}

/// Typed run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub flow_module: String,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default)]
    pub pipeline: StageFlags,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub evaluate: EvaluateConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

fn default_data_type() -> DataType {
    DataType::Timeseries
}

/// Values supplied on the command line, applied over the file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub exp_name: Option<String>,
    pub exp_desc: Option<String>,
    pub ds_name: Option<String>,
    pub data_type: Option<String>,
    pub ds_description: Option<String>,
    pub dvc_tag: Option<Vec<String>>,
    pub file_path: Option<PathBuf>,
    pub model_type: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<u64>,
    pub learning_rate: Option<f64>,
    pub batch_size: Option<u32>,
    pub epochs: Option<u32>,
    pub data_flow: Option<bool>,
    pub train_flow: Option<bool>,
    pub eval_flow: Option<bool>,
    pub deploy_flow: Option<bool>,
}

impl PipelineConfig {
    /// Parse a document, choosing YAML or JSON by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => Err(PipelineError::Configuration(format!(
                "unsupported config format {}; use YAML or JSON",
                path.display()
            ))),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Fill storage roots and service URLs missing from the file.
    pub fn apply_env_defaults(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let storage = &mut self.storage;
        if storage.central_root.is_none() {
            storage.central_root = non_empty(ENV_CENTRAL_STORAGE).map(PathBuf::from);
        }
        if storage.dataset_root.is_none() {
            storage.dataset_root = non_empty(ENV_DATASET_STORAGE).map(PathBuf::from);
        }
        if storage.model_root.is_none() {
            storage.model_root = non_empty(ENV_MODEL_STORAGE).map(PathBuf::from);
        }
        if storage.log_root.is_none() {
            storage.log_root = non_empty(ENV_LOG_PATH).map(PathBuf::from);
        }

        let tracking = &mut self.tracking;
        if tracking.tracking_uri.is_none() {
            tracking.tracking_uri = non_empty(ENV_TRACKING_URI);
        }
        if tracking.orchestrator_url.is_none() {
            tracking.orchestrator_url = non_empty(ENV_PREFECT_API);
        }
    }

    /// [`apply_env_defaults`](Self::apply_env_defaults) against the process
    /// environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_defaults(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, o: &ConfigOverrides) -> Result<()> {
        if let Some(v) = &o.exp_name {
            self.train.mlflow.exp_name = v.clone();
        }
        if let Some(v) = &o.exp_desc {
            self.train.mlflow.exp_desc = v.clone();
        }
        if let Some(v) = &o.ds_name {
            self.dataset.ds_name = v.clone();
        }
        if let Some(v) = &o.data_type {
            self.data_type = v.parse()?;
        }
        if let Some(v) = &o.ds_description {
            self.dataset.ds_description = v.clone();
        }
        if let Some(v) = &o.dvc_tag {
            self.dataset.dvc_tag = v.clone();
        }
        if let Some(v) = &o.file_path {
            self.dataset.file_path = Some(v.clone());
        }
        if let Some(v) = &o.model_type {
            self.model.model_type = v.clone();
        }
        if let Some(v) = &o.model_name {
            self.model.model_name = v.clone();
        }
        if let Some(v) = o.model_version {
            self.model.model_version = Some(v);
            self.deploy.model_version = Some(v);
        }
        if let Some(v) = o.learning_rate {
            self.train.hparams.learning_rate = v;
        }
        if let Some(v) = o.batch_size {
            self.train.hparams.batch_size = v;
        }
        if let Some(v) = o.epochs {
            self.train.hparams.epochs = v;
        }
        if let Some(v) = o.data_flow {
            self.pipeline.data_flow = v;
        }
        if let Some(v) = o.train_flow {
            self.pipeline.train_flow = v;
        }
        if let Some(v) = o.eval_flow {
            self.pipeline.eval_flow = v;
        }
        if let Some(v) = o.deploy_flow {
            self.pipeline.deploy_flow = v;
        }
        Ok(())
    }

    pub fn flow(&self) -> Result<FlowModule> {
        self.flow_module.parse()
    }

    /// Stages the configured flow will execute.
    pub fn enabled_stages(&self) -> Result<StageFlags> {
        let only = |data, train, eval, deploy| StageFlags {
            data_flow: data,
            train_flow: train,
            eval_flow: eval,
            deploy_flow: deploy,
        };
        Ok(match self.flow()? {
            FlowModule::Full => self.pipeline,
            FlowModule::Data => only(true, false, false, false),
            FlowModule::Train => only(false, true, false, false),
            FlowModule::Eval => only(false, false, true, false),
            FlowModule::Deploy => only(false, false, false, true),
        })
    }

    /// Check every key the enabled stages need.
    pub fn validate(&self) -> Result<()> {
        let stages = self.enabled_stages()?;
        let fail = |msg: String| Err(PipelineError::Configuration(msg));

        if !(stages.data_flow || stages.train_flow || stages.eval_flow || stages.deploy_flow) {
            return fail("no pipeline stage is enabled".into());
        }
        if self.data_type != DataType::Timeseries
            && (stages.data_flow || stages.train_flow || stages.eval_flow)
        {
            return fail(format!("unsupported data_type '{}'", self.data_type));
        }
        if self.dataset.ds_name.trim().is_empty()
            && (stages.data_flow || stages.train_flow || stages.eval_flow)
        {
            return fail("dataset.ds_name is required".into());
        }

        if stages.data_flow {
            if self.dataset.file_path.is_none() {
                return fail("dataset.file_path is required for the data stage".into());
            }
            if self.dataset.target_col.trim().is_empty() {
                return fail("dataset.target_col is required for the data stage".into());
            }
            if self.dataset.time_step == 0 {
                return fail("dataset.time_step must be positive".into());
            }
            let (t, v) = (self.dataset.test_fraction, self.dataset.val_fraction);
            if !(t >= 0.0 && v >= 0.0 && t + v < 1.0) {
                return fail(format!("invalid split fractions: test={t}, val={v}"));
            }
        }

        if (stages.train_flow || stages.eval_flow || stages.deploy_flow)
            && self.model.model_name.trim().is_empty()
        {
            return fail("model.model_name is required".into());
        }
        if stages.train_flow {
            if self.model.model_type.trim().is_empty() {
                return fail("model.model_type is required for the train stage".into());
            }
            if self.train.mlflow.exp_name.trim().is_empty() {
                return fail("train.mlflow.exp_name is required".into());
            }
            if self.train.hparams.epochs == 0 {
                return fail("train.hparams.epochs must be positive".into());
            }
        }
        if stages.eval_flow && self.evaluate.mlflow.exp_name.trim().is_empty() {
            return fail("evaluate.mlflow.exp_name is required".into());
        }
        if stages.deploy_flow && self.deploy.service_url.trim().is_empty() {
            return fail("deploy.service_url is required".into());
        }
        Ok(())
    }

    /// Load, fill from the environment, apply overrides and validate.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::from_path(path)?;
        config.apply_process_env();
        config.apply_overrides(overrides)?;
        config.validate()?;
        Ok(config)
    }
}
