//! Workflow orchestrator adapters used for the single-run check.

use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::Deserialize;
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Held for the duration of a pipeline run. Dropping it releases the run.
#[derive(Debug, Default)]
pub struct RunClaim {
    lock: Option<(File, PathBuf)>,
}

impl RunClaim {
    /// Claim that holds nothing locally.
    pub fn unheld() -> Self {
        Self { lock: None }
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Some((file, path)) = self.lock.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %path.display(), error = %e, "failed to release run lock");
            }
            drop(file);
            let _ = fs::remove_file(&path);
        }
    }
}

/// Source of truth for whether a pipeline run is in flight
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn is_any_run_active(&self) -> Result<bool>;

    /// Mark `run_id` as in flight. Fails with `PipelineBusy` when another run
    /// already holds the claim.
    async fn claim(&self, run_id: &str) -> Result<RunClaim>;

    fn name(&self) -> &'static str;
}

/// Prefect server queried over its REST API
#[derive(Clone, Debug)]
pub struct PrefectOrchestrator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct FlowRun {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

impl PrefectOrchestrator {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
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
impl Orchestrator for PrefectOrchestrator {
    async fn is_any_run_active(&self) -> Result<bool> {
        let body = json!({
            "flow_runs": { "state": { "type": { "any_": ["RUNNING"] } } },
            "limit": 5,
        });
        let response = self
            .client
            .post(self.endpoint("flow_runs/filter"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::external(
                "prefect",
                format!("flow_runs/filter returned {status}: {text}"),
            ));
        }

        let runs: Vec<FlowRun> = response.json().await?;
        for run in &runs {
            debug!(id = %run.id, name = %run.name, "running flow run");
        }
        Ok(!runs.is_empty())
    }

    async fn claim(&self, _run_id: &str) -> Result<RunClaim> {
        // Prefect records the run itself once it starts.
        Ok(RunClaim::unheld())
    }

    fn name(&self) -> &'static str {
        "prefect"
    }
}

/// Exclusive lock on a file, for hosts without an orchestrator
#[derive(Clone, Debug)]
pub struct LockFileOrchestrator {
    path: PathBuf,
}

impl LockFileOrchestrator {
    pub const LOCK_FILE: &'static str = "pipeline.lock";

    /// Lock file `pipeline.lock` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(Self::LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Orchestrator for LockFileOrchestrator {
    async fn is_any_run_active(&self) -> Result<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(false)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(true),
            Err(e) => Err(PipelineError::io(&self.path, e)),
        }
    }

    async fn claim(&self, run_id: &str) -> Result<RunClaim> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let holder = fs::read_to_string(&self.path).unwrap_or_default();
                return Err(PipelineError::PipelineBusy(format!(
                    "run '{}' holds {}",
                    holder.trim(),
                    self.path.display()
                )));
            }
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        }

        file.set_len(0).map_err(|e| PipelineError::io(&self.path, e))?;
        file.write_all(run_id.as_bytes())
            .map_err(|e| PipelineError::io(&self.path, e))?;

        Ok(RunClaim {
            lock: Some((file, self.path.clone())),
        })
    }

    fn name(&self) -> &'static str {
        "lock-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lock_file_excludes_second_run() {
        let dir = tempdir().unwrap();
        let orchestrator = LockFileOrchestrator::in_dir(dir.path());
        assert!(!orchestrator.is_any_run_active().await.unwrap());

        let claim = orchestrator.claim("run-a").await.unwrap();
        assert!(claim.is_held());
        assert!(orchestrator.is_any_run_active().await.unwrap());

        match orchestrator.claim("run-b").await {
            Err(PipelineError::PipelineBusy(msg)) => assert!(msg.contains("run-a")),
            other => panic!("expected busy, got {other:?}"),
        }

        drop(claim);
        assert!(!orchestrator.is_any_run_active().await.unwrap());
        assert!(!orchestrator.path().exists());
        orchestrator.claim("run-c").await.unwrap();
    }

    #[test]
    fn test_prefect_endpoint() {
        let prefect = PrefectOrchestrator::new("http://prefect:4200/api/").unwrap();
        assert_eq!(
            prefect.endpoint("/flow_runs/filter"),
            "http://prefect:4200/api/flow_runs/filter"
        );
    }
}
