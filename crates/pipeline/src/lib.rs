//! Pipeline run coordination.
//!
//! Loads the typed run configuration and drives the data, train, eval and
//! deploy stages against the dataset store, the model registry and the
//! external trainer, evaluator, orchestrator and serving collaborators.

pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod errors;
pub mod evaluator;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod trainer;

pub use config::{
    ConfigOverrides, FlowModule, JobCommand, PipelineConfig, StageFlags,
};
pub use coordinator::{PipelineReport, RunLifecycleCoordinator, Stage};
pub use deploy::{deploy_model, DeployOutcome, DeployRequest, HttpServingClient, ServingEndpoint};
pub use errors::{PipelineError, Result};
pub use evaluator::{CommandEvaluator, EvaluationJob, ModelEvaluator};
pub use logging::{open_run_log, run_log_path, RunLogFormat};
pub use metrics::EvaluationMetrics;
pub use orchestrator::{LockFileOrchestrator, Orchestrator, PrefectOrchestrator, RunClaim};
pub use trainer::{CommandTrainer, ModelTrainer, TrainingJob, TrainingResult};
