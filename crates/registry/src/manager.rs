//! Content-hash gated model registration.
//!
//! A trained artifact directory is registered as a new model version only
//! when its content hash differs from the last one recorded for the same
//! registered model. Registry failures after hashing are reported in the
//! outcome instead of failing the training run.

use crate::errors::{RegistryError, Result};
use crate::hash::content_hash;
use crate::model_meta::Framework;
use crate::tracker::ExperimentTracker;
use crate::train_info::{accuracy_from_smape, ModelTrainInfo};
use crate::types::{ModelStage, RegisteredModelVersion, CONTENT_HASH_TAG};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Out-of-band record of the last registered content hash per model.
pub const REGISTRY_STATE_FILE: &str = "registry_state.json";

/// Registered model name for a logical model name.
pub fn registry_name(model_name: &str) -> String {
    format!("{model_name}_model")
}

/// Artifact URI of a registered model inside its training run.
pub fn model_uri(run_id: &str, registry_name: &str) -> String {
    format!("runs:/{run_id}/{registry_name}")
}

/// Next `NNN` for `<model_name>_model_verNNN_*` given existing run names.
pub fn next_run_number<'a>(model_name: &str, run_names: impl IntoIterator<Item = &'a str>) -> u32 {
    let pattern = format!(r"^{}_model_ver(\d+)", regex::escape(model_name));
    let Ok(re) = Regex::new(&pattern) else {
        return 1;
    };
    run_names
        .into_iter()
        .filter_map(|name| re.captures(name))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

pub fn format_run_name(model_name: &str, number: u32, model_type: &str) -> String {
    format!("{model_name}_model_ver{number:03}_{model_type}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordedHash {
    content_hash: String,
    version: u64,
    run_id: String,
    recorded_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    models: BTreeMap<String, RecordedHash>,
}

/// Everything needed to register one training run's artifact
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub artifact_dir: PathBuf,
    /// Logical model name, e.g. `sales`
    pub model_name: String,
    /// Registry entry name, e.g. `sales_model`
    pub registry_name: String,
    pub run_id: String,
    pub source_uri: String,
    pub framework: Framework,
    pub smape: f64,
    pub final_loss: f64,
    pub train_info: ModelTrainInfo,
}

impl RegistrationRequest {
    /// Request with the registry name and source URI derived from
    /// `model_name` and `run_id`.
    pub fn for_run(
        artifact_dir: impl Into<PathBuf>,
        model_name: impl Into<String>,
        run_id: impl Into<String>,
        framework: Framework,
        smape: f64,
        final_loss: f64,
        train_info: ModelTrainInfo,
    ) -> Self {
        let model_name = model_name.into();
        let run_id = run_id.into();
        let registry_name = registry_name(&model_name);
        let source_uri = model_uri(&run_id, &registry_name);
        Self {
            artifact_dir: artifact_dir.into(),
            model_name,
            registry_name,
            run_id,
            source_uri,
            framework,
            smape,
            final_loss,
            train_info,
        }
    }

    fn version_description(&self, version: u64) -> String {
        format!(
            "Version {} of {} based on {} model trained on {}. Framework: {}, SMAPE: {:.2}",
            version,
            self.registry_name,
            self.train_info.model_type,
            self.train_info.dataset_name,
            self.framework,
            self.smape
        )
    }

    fn version_tags(&self, hash: &str) -> BTreeMap<String, String> {
        let mut tags = self.train_info.to_tags();
        tags.insert("model_name".into(), self.model_name.clone());
        tags.insert("framework".into(), self.framework.to_string());
        tags.insert("accuracy".into(), accuracy_from_smape(self.smape).to_string());
        tags.insert("final_loss".into(), self.final_loss.to_string());
        tags.insert(
            "createdAt".into(),
            chrono::Local::now().format("%Y-%m-%d").to_string(),
        );
        tags.insert(CONTENT_HASH_TAG.into(), hash.to_string());
        tags
    }
}

/// Result of [`ModelRegistryManager::register_if_changed`]
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    /// Artifact identical to the last registered one; nothing created
    Unchanged { content_hash: String },
    /// A version for this run and source already existed
    Existing(RegisteredModelVersion),
    /// A new version was created
    Registered(RegisteredModelVersion),
    /// A registry call failed; `version` is whatever was obtained first
    Failed {
        version: Option<RegisteredModelVersion>,
        error: String,
    },
}

impl RegistrationOutcome {
    pub fn version(&self) -> Option<&RegisteredModelVersion> {
        match self {
            Self::Existing(v) | Self::Registered(v) => Some(v),
            Self::Failed { version, .. } => version.as_ref(),
            Self::Unchanged { .. } => None,
        }
    }

    pub fn version_number(&self) -> Option<u64> {
        self.version().map(|v| v.version)
    }
}

/// Registers trained models and resolves registered versions
pub struct ModelRegistryManager {
    tracker: Arc<dyn ExperimentTracker>,
    state_path: PathBuf,
    initial_stage: ModelStage,
}

impl ModelRegistryManager {
    /// Manager keeping its hash record under `model_root`.
    pub fn new(tracker: Arc<dyn ExperimentTracker>, model_root: impl AsRef<Path>) -> Self {
        Self {
            tracker,
            state_path: model_root.as_ref().join(REGISTRY_STATE_FILE),
            initial_stage: ModelStage::Staging,
        }
    }

    pub fn with_initial_stage(mut self, stage: ModelStage) -> Self {
        self.initial_stage = stage;
        self
    }

    pub fn tracker(&self) -> &Arc<dyn ExperimentTracker> {
        &self.tracker
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn load_state(&self) -> Result<RegistryState> {
        if !self.state_path.exists() {
            return Ok(RegistryState::default());
        }
        let raw = fs::read_to_string(&self.state_path)
            .map_err(|e| RegistryError::io(&self.state_path, e))?;
        serde_json::from_str(&raw).map_err(|e| RegistryError::MetadataCorruption {
            path: self.state_path.clone(),
            reason: e.to_string(),
        })
    }

    fn save_state(&self, state: &RegistryState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, json).map_err(|e| RegistryError::io(&tmp, e))?;
        fs::rename(&tmp, &self.state_path).map_err(|e| RegistryError::io(&self.state_path, e))
    }

    /// Content hash recorded for the last registration of `registry_name`.
    pub fn recorded_hash(&self, registry_name: &str) -> Result<Option<String>> {
        Ok(self
            .load_state()?
            .models
            .get(registry_name)
            .map(|r| r.content_hash.clone()))
    }

    /// Version number of the last recorded registration of `registry_name`.
    pub fn recorded_version(&self, registry_name: &str) -> Result<Option<u64>> {
        Ok(self.load_state()?.models.get(registry_name).map(|r| r.version))
    }

    fn record_hash(&self, req: &RegistrationRequest, hash: &str, version: u64) -> Result<()> {
        let mut state = self.load_state()?;
        state.models.insert(
            req.registry_name.clone(),
            RecordedHash {
                content_hash: hash.to_string(),
                version,
                run_id: req.run_id.clone(),
                recorded_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save_state(&state)
    }

    /// Register `req.artifact_dir` unless its contents match the last
    /// registered artifact for the same model.
    ///
    /// Hashing and reading the local hash record fail the call. Registry
    /// failures do not; they come back as [`RegistrationOutcome::Failed`].
    /// A hash record that cannot be written after a successful registration
    /// is logged and the next run registers again.
    pub async fn register_if_changed(
        &self,
        req: &RegistrationRequest,
    ) -> Result<RegistrationOutcome> {
        if req.registry_name.is_empty() || req.run_id.is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "registry name and run id are required".into(),
            ));
        }

        let hash = content_hash(&req.artifact_dir)?;
        debug!(model = %req.registry_name, hash = %hash, "computed artifact hash");

        if self.recorded_hash(&req.registry_name)?.as_deref() == Some(hash.as_str()) {
            info!(
                model = %req.registry_name,
                run_id = %req.run_id,
                "model unchanged, skipping registration"
            );
            return Ok(RegistrationOutcome::Unchanged { content_hash: hash });
        }

        let mut partial = None;
        let outcome = match self.register_steps(req, &hash, &mut partial).await {
            Ok((version, true)) => RegistrationOutcome::Registered(version),
            Ok((version, false)) => RegistrationOutcome::Existing(version),
            Err(e) => {
                error!(
                    model = %req.registry_name,
                    run_id = %req.run_id,
                    source = %req.source_uri,
                    backend = self.tracker.backend(),
                    error = %e,
                    "model registration failed"
                );
                return Ok(RegistrationOutcome::Failed {
                    version: partial,
                    error: e.to_string(),
                });
            }
        };

        if let Some(version) = outcome.version_number() {
            if let Err(e) = self.record_hash(req, &hash, version) {
                warn!(
                    model = %req.registry_name,
                    version,
                    path = %self.state_path.display(),
                    error = %e,
                    "could not record content hash"
                );
            }
        }
        Ok(outcome)
    }

    async fn register_steps(
        &self,
        req: &RegistrationRequest,
        hash: &str,
        partial: &mut Option<RegisteredModelVersion>,
    ) -> Result<(RegisteredModelVersion, bool)> {
        let name = req.registry_name.as_str();
        let existing = self.tracker.search_model_versions(name).await?;

        let found = existing
            .iter()
            .find(|v| v.source == req.source_uri && v.run_id == req.run_id)
            .cloned();

        let (mut version, created) = match found {
            Some(v) => {
                info!(model = name, version = v.version, "model version already exists");
                (v, false)
            }
            None => {
                if existing.is_empty() {
                    let known = self
                        .tracker
                        .search_registered_models()
                        .await?
                        .into_iter()
                        .any(|m| m.name == name);
                    if !known {
                        self.tracker.create_registered_model(name).await?;
                        let summary = format!(
                            "In the latest experiment, the {} model is applied for {}",
                            req.train_info.model_type, name
                        );
                        self.tracker
                            .set_registered_model_tag(name, "description", &summary)
                            .await?;
                    }
                }
                let v = self
                    .tracker
                    .create_model_version(name, &req.source_uri, &req.run_id)
                    .await?;
                info!(model = name, version = v.version, "registered new model version");
                (v, true)
            }
        };
        *partial = Some(version.clone());

        let description = req.version_description(version.version);
        self.tracker
            .update_model_version(name, version.version, &description)
            .await?;
        version.description = Some(description);
        *partial = Some(version.clone());

        self.tracker
            .transition_stage(name, version.version, self.initial_stage)
            .await?;
        version.stage = self.initial_stage;
        *partial = Some(version.clone());

        for (key, value) in req.version_tags(hash) {
            self.tracker
                .set_model_version_tag(name, version.version, &key, &value)
                .await?;
            version.tags.insert(key, value);
        }
        info!(model = name, version = version.version, stage = %version.stage, "tags and metadata updated");

        Ok((version, created))
    }

    /// Registered version `requested`, or the highest version when
    /// `requested` is `None` or `0`.
    pub async fn resolve_version(
        &self,
        registry_name: &str,
        requested: Option<u64>,
    ) -> Result<RegisteredModelVersion> {
        let versions = self.tracker.search_model_versions(registry_name).await?;
        match requested.filter(|v| *v > 0) {
            Some(wanted) => versions
                .into_iter()
                .find(|v| v.version == wanted)
                .ok_or_else(|| {
                    RegistryError::ArtifactNotFound(format!(
                        "{registry_name} version {wanted}"
                    ))
                }),
            None => versions
                .into_iter()
                .max_by_key(|v| v.version)
                .ok_or_else(|| {
                    RegistryError::ArtifactNotFound(format!(
                        "{registry_name} has no registered versions"
                    ))
                }),
        }
    }

    /// Next run name `<model_name>_model_verNNN_<model_type>` within an
    /// experiment.
    pub async fn next_run_name(
        &self,
        experiment_id: &str,
        model_name: &str,
        model_type: &str,
    ) -> Result<String> {
        let runs = self.tracker.search_runs(experiment_id).await?;
        let number = next_run_number(model_name, runs.iter().map(|r| r.run_name.as_str()));
        if number > 999 {
            warn!(model = model_name, number, "run number exceeds three digits");
        }
        Ok(format_run_name(model_name, number, model_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTracker;
    use crate::train_info::tests::sample_info;
    use tempfile::tempdir;

    #[test]
    fn test_naming_helpers() {
        assert_eq!(registry_name("sales"), "sales_model");
        assert_eq!(model_uri("abc", "sales_model"), "runs:/abc/sales_model");
        assert_eq!(format_run_name("sales", 7, "GRU"), "sales_model_ver007_GRU");
    }

    #[test]
    fn test_next_run_number() {
        let names = [
            "sales_model_ver001_GRU",
            "sales_model_ver004_LSTM",
            "sales.x_model_ver009_GRU",
            "other_model_ver010_GRU",
            "sales_model_verabc_GRU",
        ];
        assert_eq!(next_run_number("sales", names), 5);
        assert_eq!(next_run_number("sales.x", names), 10);
        assert_eq!(next_run_number("fresh", names), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_next_run_number_exceeds_existing(numbers in proptest::collection::vec(1u32..5000, 0..20)) {
            let names: Vec<String> = numbers
                .iter()
                .map(|n| format_run_name("sales", *n, "LSTM"))
                .collect();
            let next = next_run_number("sales", names.iter().map(String::as_str));
            proptest::prop_assert!(numbers.iter().all(|n| next > *n));
            proptest::prop_assert!(!names.contains(&format_run_name("sales", next, "LSTM")));
        }
    }

    #[tokio::test]
    async fn test_resolve_version() {
        let root = tempdir().unwrap();
        let tracker = Arc::new(LocalTracker::in_memory());
        tracker.create_registered_model("sales_model").await.unwrap();
        for run in ["r1", "r2", "r3"] {
            tracker
                .create_model_version("sales_model", &model_uri(run, "sales_model"), run)
                .await
                .unwrap();
        }
        let manager = ModelRegistryManager::new(tracker, root.path());

        assert_eq!(manager.resolve_version("sales_model", None).await.unwrap().version, 3);
        assert_eq!(manager.resolve_version("sales_model", Some(0)).await.unwrap().version, 3);
        assert_eq!(manager.resolve_version("sales_model", Some(2)).await.unwrap().run_id, "r2");
        assert!(matches!(
            manager.resolve_version("sales_model", Some(9)).await,
            Err(RegistryError::ArtifactNotFound(_))
        ));
        assert!(matches!(
            manager.resolve_version("absent_model", None).await,
            Err(RegistryError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_sets_description_stage_and_tags() {
        let root = tempdir().unwrap();
        let artifact = root.path().join("sales_model_ver001_GRU");
        fs::create_dir_all(&artifact).unwrap();
        fs::write(artifact.join("trained_model.h5"), b"weights").unwrap();

        let tracker = Arc::new(LocalTracker::in_memory());
        let manager = ModelRegistryManager::new(tracker.clone(), root.path());
        let req = RegistrationRequest::for_run(
            &artifact,
            "sales",
            "run-1",
            Framework::Tensorflow,
            12.34,
            0.05,
            sample_info(),
        );

        let outcome = manager.register_if_changed(&req).await.unwrap();
        let version = match outcome {
            RegistrationOutcome::Registered(version) => version,
            other => panic!("expected a new version, got {other:?}"),
        };
        assert_eq!(version.version, 1);
        assert_eq!(version.stage, ModelStage::Staging);
        assert_eq!(
            version.description.as_deref(),
            Some("Version 1 of sales_model based on GRU model trained on sales. Framework: tensorflow, SMAPE: 12.34")
        );
        assert_eq!(version.tags["accuracy"], "87.7");
        assert_eq!(version.tags["dataset_size"], "490 row");

        let stored = tracker.search_model_versions("sales_model").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content_hash(), version.content_hash());
        assert_eq!(
            manager.recorded_hash("sales_model").unwrap().as_deref(),
            version.content_hash()
        );
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let root = tempdir().unwrap();
        let artifact = root.path().join("run");
        fs::create_dir_all(&artifact).unwrap();
        fs::write(artifact.join("trained_model.pth"), b"w").unwrap();
        fs::write(root.path().join(REGISTRY_STATE_FILE), b"{ not json").unwrap();

        let manager = ModelRegistryManager::new(Arc::new(LocalTracker::in_memory()), root.path());
        let req = RegistrationRequest::for_run(
            &artifact,
            "sales",
            "run-1",
            Framework::Pytorch,
            10.0,
            0.1,
            sample_info(),
        );
        assert!(matches!(
            manager.register_if_changed(&req).await,
            Err(RegistryError::MetadataCorruption { .. })
        ));
    }
}
