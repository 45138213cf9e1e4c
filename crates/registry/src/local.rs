//! File-backed experiment tracker.
//!
//! Keeps every experiment, run, registered model and version in one JSON
//! document. Without a path the state lives only in memory, which is what
//! tests use.

use crate::errors::{RegistryError, Result};
use crate::tracker::ExperimentTracker;
use crate::types::{
    Experiment, MetricPoint, ModelStage, RegisteredModel, RegisteredModelVersion, RunInfo,
    RunStatus,
};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    experiments: Vec<Experiment>,
    runs: Vec<RunInfo>,
    models: BTreeMap<String, RegisteredModel>,
    versions: Vec<RegisteredModelVersion>,
    sequence: u64,
}

impl LocalState {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut RunInfo> {
        self.runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| RegistryError::ArtifactNotFound(format!("run {run_id}")))
    }

    fn version_mut(&mut self, name: &str, version: u64) -> Result<&mut RegisteredModelVersion> {
        self.versions
            .iter_mut()
            .find(|v| v.name == name && v.version == version)
            .ok_or_else(|| {
                RegistryError::ArtifactNotFound(format!("model version {name} v{version}"))
            })
    }

    fn next_id(&mut self, seed: &str) -> String {
        self.sequence += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(seed.as_bytes());
        hasher.update(&self.sequence.to_le_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// Experiment tracker persisted to a local JSON file
pub struct LocalTracker {
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalTracker {
    /// Tracker that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Open (or start) the state document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| RegistryError::io(&path, e))?;
            serde_json::from_str(&raw).map_err(|e| RegistryError::MetadataCorruption {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            LocalState::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, state: &LocalState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RegistryError::io(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| RegistryError::io(&lock_path, e))?;

        let tmp = path.with_extension("json.tmp");
        let rendered = serde_json::to_string_pretty(state)?;
        let written = fs::write(&tmp, rendered)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| RegistryError::io(path, e));

        // unlock on every path, including a failed write
        let _ = FileExt::unlock(&lock);
        written
    }

    /// Apply `f` to the state and persist the result.
    fn mutate<T>(&self, f: impl FnOnce(&mut LocalState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&LocalState) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        f(&state)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ExperimentTracker for LocalTracker {
    async fn create_experiment_if_absent(&self, name: &str) -> Result<Experiment> {
        self.mutate(|state| {
            if let Some(existing) = state.experiments.iter().find(|e| e.name == name) {
                return Ok(existing.clone());
            }
            let experiment = Experiment {
                experiment_id: (state.experiments.len() + 1).to_string(),
                name: name.to_string(),
            };
            state.experiments.push(experiment.clone());
            debug!(experiment = name, "Created experiment");
            Ok(experiment)
        })
    }

    async fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        description: &str,
    ) -> Result<RunInfo> {
        self.mutate(|state| {
            if !state
                .experiments
                .iter()
                .any(|e| e.experiment_id == experiment_id)
            {
                return Err(RegistryError::ArtifactNotFound(format!(
                    "experiment {experiment_id}"
                )));
            }

            let run_id = state.next_id(&format!("{experiment_id}/{run_name}"));
            let mut tags = BTreeMap::new();
            tags.insert("mlflow.runName".to_string(), run_name.to_string());
            if !description.is_empty() {
                tags.insert("mlflow.note.content".to_string(), description.to_string());
            }

            let run = RunInfo {
                run_id,
                run_name: run_name.to_string(),
                experiment_id: experiment_id.to_string(),
                status: RunStatus::Running,
                tags,
                ..RunInfo::default()
            };
            state.runs.push(run.clone());
            Ok(run)
        })
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.mutate(|state| {
            state.run_mut(run_id)?.status = status;
            Ok(())
        })
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            run.params
                .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: i64) -> Result<()> {
        self.mutate(|state| {
            state
                .run_mut(run_id)?
                .metrics
                .entry(key.to_string())
                .or_default()
                .push(MetricPoint {
                    value,
                    step,
                    timestamp: now_millis(),
                });
            Ok(())
        })
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|state| {
            state
                .run_mut(run_id)?
                .tags
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(RegistryError::ArtifactNotFound(path.display().to_string()));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(state_path) = &self.path {
            let dest_dir = state_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("artifacts")
                .join(run_id);
            fs::create_dir_all(&dest_dir).map_err(|e| RegistryError::io(&dest_dir, e))?;
            let dest = dest_dir.join(&file_name);
            fs::copy(path, &dest).map_err(|e| RegistryError::io(&dest, e))?;
        }

        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            if !run.artifacts.contains(&file_name) {
                run.artifacts.push(file_name);
            }
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        self.read(|state| {
            state
                .runs
                .iter()
                .find(|r| r.run_id == run_id)
                .cloned()
                .ok_or_else(|| RegistryError::ArtifactNotFound(format!("run {run_id}")))
        })
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>> {
        self.read(|state| {
            Ok(state
                .runs
                .iter()
                .filter(|r| r.experiment_id == experiment_id)
                .cloned()
                .collect())
        })
    }

    async fn search_registered_models(&self) -> Result<Vec<RegisteredModel>> {
        self.read(|state| Ok(state.models.values().cloned().collect()))
    }

    async fn search_model_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>> {
        self.read(|state| {
            Ok(state
                .versions
                .iter()
                .filter(|v| v.name == name)
                .cloned()
                .collect())
        })
    }

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        self.mutate(|state| {
            if state.models.contains_key(name) {
                return Err(RegistryError::InvalidRegistration(format!(
                    "registered model '{name}' already exists"
                )));
            }
            let model = RegisteredModel {
                name: name.to_string(),
                tags: BTreeMap::new(),
            };
            state.models.insert(name.to_string(), model.clone());
            Ok(model)
        })
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<RegisteredModelVersion> {
        self.mutate(|state| {
            if !state.models.contains_key(name) {
                return Err(RegistryError::ArtifactNotFound(format!(
                    "registered model {name}"
                )));
            }
            let version = state
                .versions
                .iter()
                .filter(|v| v.name == name)
                .map(|v| v.version)
                .max()
                .unwrap_or(0)
                + 1;

            let created = RegisteredModelVersion {
                name: name.to_string(),
                version,
                source: source.to_string(),
                run_id: run_id.to_string(),
                stage: ModelStage::None,
                description: None,
                tags: BTreeMap::new(),
            };
            state.versions.push(created.clone());
            Ok(created)
        })
    }

    async fn update_model_version(
        &self,
        name: &str,
        version: u64,
        description: &str,
    ) -> Result<()> {
        self.mutate(|state| {
            state.version_mut(name, version)?.description = Some(description.to_string());
            Ok(())
        })
    }

    async fn transition_stage(&self, name: &str, version: u64, stage: ModelStage) -> Result<()> {
        self.mutate(|state| {
            state.version_mut(name, version)?.stage = stage;
            Ok(())
        })
    }

    async fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|state| {
            let model = state.models.get_mut(name).ok_or_else(|| {
                RegistryError::ArtifactNotFound(format!("registered model {name}"))
            })?;
            model.tags.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn set_model_version_tag(
        &self,
        name: &str,
        version: u64,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.mutate(|state| {
            state
                .version_mut(name, version)?
                .tags
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_versions_are_numbered_per_model() {
        let tracker = LocalTracker::in_memory();
        tracker.create_registered_model("a_model").await.unwrap();
        tracker.create_registered_model("b_model").await.unwrap();

        let a1 = tracker.create_model_version("a_model", "s1", "r1").await.unwrap();
        let a2 = tracker.create_model_version("a_model", "s2", "r2").await.unwrap();
        let b1 = tracker.create_model_version("b_model", "s3", "r3").await.unwrap();

        assert_eq!((a1.version, a2.version, b1.version), (1, 2, 1));
        assert!(tracker
            .create_model_version("missing", "s", "r")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_experiment_is_created_once() {
        let tracker = LocalTracker::in_memory();
        let first = tracker.create_experiment_if_absent("exp").await.unwrap();
        let second = tracker.create_experiment_if_absent("exp").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking").join("state.json");

        let run_id = {
            let tracker = LocalTracker::open(&path).unwrap();
            let exp = tracker.create_experiment_if_absent("exp").await.unwrap();
            let run = tracker
                .start_run(&exp.experiment_id, "sales_model_ver001_LSTM", "first")
                .await
                .unwrap();
            tracker.set_tag(&run.run_id, "status", "training").await.unwrap();
            tracker.log_metric(&run.run_id, "loss", 0.5, 1).await.unwrap();
            run.run_id
        };

        let reopened = LocalTracker::open(&path).unwrap();
        let run = reopened.get_run(&run_id).await.unwrap();
        assert_eq!(run.run_name, "sales_model_ver001_LSTM");
        assert_eq!(run.tags["status"], "training");
        assert_eq!(run.metrics["loss"][0].value, 0.5);
    }

    #[tokio::test]
    async fn test_corrupted_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            LocalTracker::open(&path),
            Err(RegistryError::MetadataCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_log_artifact_copies_file() {
        let dir = tempdir().unwrap();
        let tracker = LocalTracker::open(dir.path().join("state.json")).unwrap();
        let exp = tracker.create_experiment_if_absent("exp").await.unwrap();
        let run = tracker.start_run(&exp.experiment_id, "r", "").await.unwrap();

        let artifact = dir.path().join("dataset_info.json");
        fs::write(&artifact, "{}").unwrap();
        tracker.log_artifact(&run.run_id, &artifact).await.unwrap();

        assert!(dir
            .path()
            .join("artifacts")
            .join(&run.run_id)
            .join("dataset_info.json")
            .is_file());
        let run = tracker.get_run(&run.run_id).await.unwrap();
        assert_eq!(run.artifacts, vec!["dataset_info.json".to_string()]);
    }
}
