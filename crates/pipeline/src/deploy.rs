//! Deployment of a registered model version to the serving container.
//!
//! The serving side loads weights and metadata from the shared model root;
//! deploying means validating the run directory, backing up its metadata
//! document and asking the service to reload that run.

use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use mlops_dataset::DataType;
use mlops_registry::model_meta::{metadata_file_name, read_model_metadata};
use mlops_registry::{registry_name, ModelRegistryManager, ModelStage};
use reqwest::StatusCode;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Model-serving container
#[async_trait]
pub trait ServingEndpoint: Send + Sync {
    /// `Ok` when the service answers its health check.
    async fn health_check(&self) -> Result<()>;

    /// Ask the service to load `run_name` described by `metadata_file`.
    async fn update_model(&self, run_name: &str, metadata_file: &str) -> Result<()>;

    fn base_url(&self) -> &str;
}

/// Serving container reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpServingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ServingEndpoint for HttpServingClient {
    async fn health_check(&self) -> Result<()> {
        let response = self.client.get(self.endpoint("health_check")).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(PipelineError::external(
                "serving",
                format!("health check returned {status}"),
            )),
        }
    }

    async fn update_model(&self, run_name: &str, metadata_file: &str) -> Result<()> {
        let url = self.endpoint(&format!("update_model/{run_name}/{metadata_file}"));
        let response = self.client.put(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PipelineError::external(
                "serving",
                format!("update_model rejected (status {status}): {body}"),
            ))
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub model_name: String,
    pub data_type: DataType,
    /// `None` or `0` deploys the latest registered version
    pub model_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployOutcome {
    pub registry_name: String,
    pub model_version: u64,
    pub run_name: String,
    pub model_dir: PathBuf,
    pub metadata_file: PathBuf,
    /// Metadata was missing and came back from its `.backup` copy
    pub restored_from_backup: bool,
    pub size_mb: f64,
}

fn backup_path(metadata: &Path) -> PathBuf {
    let mut name = metadata.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let meta = entry.metadata().map_err(|e| PipelineError::io(entry.path(), e))?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

/// Make sure the metadata document exists and parses, restoring it from its
/// backup when only the backup is left. Returns whether a restore happened.
fn ensure_metadata(path: &Path) -> Result<bool> {
    let backup = backup_path(path);
    let restored = if path.is_file() {
        false
    } else if backup.is_file() {
        fs::rename(&backup, path).map_err(|e| PipelineError::io(&backup, e))?;
        warn!(path = %path.display(), "Model metadata restored from backup");
        true
    } else {
        return Err(PipelineError::ArtifactNotFound(path.display().to_string()));
    };
    read_model_metadata(path)?;
    Ok(restored)
}

fn rollback(metadata: &Path) {
    let backup = backup_path(metadata);
    match fs::rename(&backup, metadata) {
        Ok(()) => warn!(path = %metadata.display(), "Rolled back model metadata"),
        Err(e) => error!(path = %metadata.display(), error = %e, "Rollback failed"),
    }
}

/// Deploy a registered version.
///
/// Nothing on disk changes until the service passes its health check. A
/// failed update (or a service left unhealthy by it) restores the metadata
/// backup and surfaces as `ExternalService`.
pub async fn deploy_model(
    registry: &ModelRegistryManager,
    serving: &dyn ServingEndpoint,
    model_root: &Path,
    request: &DeployRequest,
) -> Result<DeployOutcome> {
    let registry_name = registry_name(&request.model_name);
    let version = registry
        .resolve_version(&registry_name, request.model_version)
        .await?;
    let run = registry.tracker().get_run(&version.run_id).await?;
    let run_name = run.run_name;

    let model_dir = model_root
        .join(request.data_type.to_string())
        .join(&run_name);
    if !model_dir.is_dir() {
        return Err(PipelineError::ArtifactNotFound(model_dir.display().to_string()));
    }
    let file_name = metadata_file_name(&request.model_name);
    let metadata = model_dir.join(&file_name);
    let restored_from_backup = ensure_metadata(&metadata)?;

    serving.health_check().await?;

    let size_mb = dir_size(&model_dir)? as f64 / (1024.0 * 1024.0);
    info!(
        model = %registry_name,
        version = version.version,
        run = %run_name,
        dir = %model_dir.display(),
        size_mb,
        "Deploying model"
    );

    let backup = backup_path(&metadata);
    fs::copy(&metadata, &backup).map_err(|e| PipelineError::io(&backup, e))?;

    if let Err(err) = serving.update_model(&run_name, &file_name).await {
        error!(run = %run_name, error = %err, "Model update failed");
        rollback(&metadata);
        return Err(err);
    }
    if let Err(err) = serving.health_check().await {
        error!(run = %run_name, error = %err, "Service unhealthy after update");
        rollback(&metadata);
        return Err(err);
    }

    let tracker = registry.tracker();
    if let Err(e) = tracker
        .transition_stage(&registry_name, version.version, ModelStage::Production)
        .await
    {
        warn!(model = %registry_name, error = %e, "Could not move deployed version to Production");
    }
    if let Err(e) = tracker
        .set_model_version_tag(&registry_name, version.version, "isDeployed", "true")
        .await
    {
        warn!(model = %registry_name, error = %e, "Could not tag deployed version");
    }

    info!(model = %registry_name, version = version.version, url = serving.base_url(), "Model deployed");
    Ok(DeployOutcome {
        registry_name,
        model_version: version.version,
        run_name,
        model_dir,
        metadata_file: metadata,
        restored_from_backup,
        size_mb,
    })
}
