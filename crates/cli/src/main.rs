//! MLOps pipeline command line interface
//!
//! Loads a run configuration, applies command-line overrides and executes
//! the configured flow.

use anyhow::{Context, Result};
use clap::Parser;
use mlops_dataset::{DataTracker, DvcTracker, NoopTracker, SnapshotStore};
use mlops_pipeline::{
    open_run_log, CommandEvaluator, CommandTrainer, ConfigOverrides, HttpServingClient,
    LockFileOrchestrator, Orchestrator, PipelineConfig, PipelineReport, PrefectOrchestrator,
    RunLifecycleCoordinator, RunLogFormat,
};
use mlops_registry::{ExperimentTracker, LocalTracker, MlflowTracker, ModelRegistryManager};
use serde_json::json;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mlops")]
#[command(about = "Run the data, train, eval and deploy pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Run configuration file (YAML or JSON)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Identifier of this run; generated when absent
    #[arg(long)]
    run_id: Option<String>,

    /// Experiment name for training runs
    #[arg(long, alias = "exp_name")]
    exp_name: Option<String>,

    #[arg(long, alias = "exp_desc")]
    exp_desc: Option<String>,

    /// Dataset name
    #[arg(long, alias = "ds_name")]
    ds_name: Option<String>,

    /// `timeseries` or `image`
    #[arg(long, alias = "data_type")]
    data_type: Option<String>,

    #[arg(long, alias = "ds_description")]
    ds_description: Option<String>,

    /// Tags recorded on the new dataset version
    #[arg(long, alias = "dvc_tag", num_args = 1..)]
    dvc_tag: Option<Vec<String>>,

    /// Source file to ingest
    #[arg(long, alias = "file_path")]
    file_path: Option<PathBuf>,

    #[arg(long, alias = "model_type")]
    model_type: Option<String>,

    #[arg(long, alias = "model_name")]
    model_name: Option<String>,

    /// Registered version to evaluate or deploy (0 = latest)
    #[arg(long, alias = "model_version")]
    model_version: Option<u64>,

    #[arg(long, visible_alias = "learningRate", alias = "learning_rate")]
    learning_rate: Option<f64>,

    #[arg(long, visible_alias = "batchSize", alias = "batch_size")]
    batch_size: Option<u32>,

    #[arg(long)]
    epochs: Option<u32>,

    /// Enable the data stage (0/1)
    #[arg(long, alias = "data_flow", value_parser = parse_flag)]
    data_flow: Option<bool>,

    /// Enable the train stage (0/1)
    #[arg(long, alias = "train_flow", value_parser = parse_flag)]
    train_flow: Option<bool>,

    /// Enable the eval stage (0/1)
    #[arg(long, alias = "eval_flow", value_parser = parse_flag)]
    eval_flow: Option<bool>,

    /// Enable the deploy stage (0/1)
    #[arg(long, alias = "deploy_flow", value_parser = parse_flag)]
    deploy_flow: Option<bool>,

    /// Debug-level logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            exp_name: self.exp_name.clone(),
            exp_desc: self.exp_desc.clone(),
            ds_name: self.ds_name.clone(),
            data_type: self.data_type.clone(),
            ds_description: self.ds_description.clone(),
            dvc_tag: self.dvc_tag.clone(),
            file_path: self.file_path.clone(),
            model_type: self.model_type.clone(),
            model_name: self.model_name.clone(),
            model_version: self.model_version,
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            epochs: self.epochs,
            data_flow: self.data_flow,
            train_flow: self.train_flow,
            eval_flow: self.eval_flow,
            deploy_flow: self.deploy_flow,
        }
    }
}

fn parse_flag(raw: &str) -> std::result::Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(format!("expected 0 or 1, got '{other}'")),
    }
}

fn generate_run_id() -> String {
    format!(
        "{}-{}",
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    )
}

/// `RUST_LOG` when it parses, otherwise `debug` or `info`.
fn default_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn init_logging(verbose: bool, log_file: File) {
    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(fmt::layer())
        .with(
            fmt::layer()
                .event_format(RunLogFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
}

fn build_coordinator(config: PipelineConfig, log_path: PathBuf) -> Result<RunLifecycleCoordinator> {
    let tracker: Arc<dyn ExperimentTracker> = match &config.tracking.tracking_uri {
        Some(uri) => Arc::new(MlflowTracker::new(uri.as_str())?),
        None => {
            let path = config.storage.tracking_state_path();
            Arc::new(
                LocalTracker::open(path.clone())
                    .with_context(|| format!("Failed to open tracker state {}", path.display()))?,
            )
        }
    };
    let data_tracker: Arc<dyn DataTracker> = if config.dataset.dvc_track {
        Arc::new(DvcTracker::new())
    } else {
        Arc::new(NoopTracker)
    };
    let orchestrator: Arc<dyn Orchestrator> = match &config.tracking.orchestrator_url {
        Some(url) => Arc::new(PrefectOrchestrator::new(url.as_str())?),
        None => Arc::new(LockFileOrchestrator::in_dir(&config.storage.log_root())),
    };

    info!(
        tracker = tracker.backend(),
        orchestrator = orchestrator.name(),
        data_tracker = data_tracker.name(),
        "Collaborators ready"
    );

    let store = SnapshotStore::new(config.storage.dataset_root(), data_tracker);
    let registry = ModelRegistryManager::new(tracker, config.storage.model_root())
        .with_initial_stage(config.train.initial_stage);
    let serving = HttpServingClient::new(config.deploy.service_url.as_str())?;
    let trainer = config
        .train
        .command
        .as_ref()
        .map(|c| CommandTrainer::new(&c.program).with_args(c.args.iter().cloned()));
    let evaluator = config
        .evaluate
        .command
        .as_ref()
        .map(|c| CommandEvaluator::new(&c.program).with_args(c.args.iter().cloned()));

    let mut coordinator = RunLifecycleCoordinator::new(config, store, registry, orchestrator)
        .with_serving(Arc::new(serving))
        .with_log_file(log_path);
    if let Some(trainer) = trainer {
        coordinator = coordinator.with_trainer(Arc::new(trainer));
    }
    if let Some(evaluator) = evaluator {
        coordinator = coordinator.with_evaluator(Arc::new(evaluator));
    }
    Ok(coordinator)
}

fn summary(report: &PipelineReport) -> serde_json::Value {
    json!({
        "run_id": report.run_id,
        "flow": report.flow.as_str(),
        "executed": report.executed.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        "skipped": report.skipped.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        "dataset": report.dataset,
        "data_type": report.data_type.to_string(),
        "dataset_version": report.dataset_version.map(|v| v.to_string()),
        "model_name": report.model_name,
        "model_type": report.model_type,
        "model_version": report.model_version,
        "run_name": report.run_name,
        "metadata_file": report.metadata_file.as_ref().map(|p| p.display().to_string()),
        "metrics": report.metrics,
        "deployed": report.deployment.is_some(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(&cli.config, &cli.overrides())
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let flow = config.flow()?;
    let run_id = cli.run_id.clone().unwrap_or_else(generate_run_id);

    let (log_path, log_file) = open_run_log(&config.storage.log_root(), flow.as_str(), &run_id)
        .context("Failed to open run log")?;
    init_logging(cli.verbose, log_file);
    info!(
        run_id = %run_id,
        flow = %flow,
        config = %cli.config.display(),
        log = %log_path.display(),
        "mlops v{}",
        env!("CARGO_PKG_VERSION")
    );

    let coordinator = build_coordinator(config, log_path)?;
    match coordinator.run(&run_id).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&summary(&report))?);
            Ok(())
        }
        Err(err) => {
            error!(run_id = %run_id, category = err.category(), error = %err, "Pipeline failed");
            Err(err).context(format!("Pipeline run {run_id} failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_legacy_flag_spellings() {
        let cli = Cli::try_parse_from([
            "mlops",
            "--config",
            "run.yaml",
            "--ds_name",
            "sales",
            "--learningRate",
            "0.01",
            "--dvc_tag",
            "daily",
            "weekly",
            "--deploy_flow",
            "0",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.ds_name.as_deref(), Some("sales"));
        assert_eq!(overrides.learning_rate, Some(0.01));
        assert_eq!(
            overrides.dvc_tag,
            Some(vec!["daily".to_string(), "weekly".to_string()])
        );
        assert_eq!(overrides.deploy_flow, Some(false));
        assert_eq!(overrides.train_flow, None);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(parse_flag("1"), Ok(true));
        assert_eq!(parse_flag("False"), Ok(false));
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_invalid_rust_log_falls_back_to_default_level() {
        std::env::set_var("RUST_LOG", "sales=loud");
        let filter = default_filter(true).to_string();
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter, "debug");
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["mlops", "--epochs", "3"]).is_err());
    }
}
