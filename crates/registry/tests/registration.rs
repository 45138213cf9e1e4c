use async_trait::async_trait;
use mlops_registry::{
    ExperimentTracker, Experiment, Framework, LocalTracker, ModelRegistryManager, ModelStage,
    ModelTrainInfo, RegisteredModel, RegisteredModelVersion, RegistrationOutcome,
    RegistrationRequest, RegistryError, ResourceSnapshot, Result, RunInfo, RunStatus,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn train_info() -> ModelTrainInfo {
    ModelTrainInfo {
        training_time: 3.0,
        log_file: "train.log".into(),
        dataset_name: "sales".into(),
        data_type: "timeseries".into(),
        dataset_size: 100,
        dataset_split: mlops_registry::split_ratio_label(70, 10, 20),
        dataset_format: "CSV/TXT".into(),
        task: "sales".into(),
        model_type: "LSTM".into(),
        train_epochs: 5,
        is_deployed: false,
        health: "healthy".into(),
        resources: ResourceSnapshot {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            gpu: "unavailable".into(),
        },
    }
}

fn write_artifact(dir: &Path, weights: &[u8]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("trained_model.h5"), weights).unwrap();
    fs::write(dir.join("sales.yaml"), "model_name: sales\n").unwrap();
}

fn request(dir: &Path, run_id: &str) -> RegistrationRequest {
    RegistrationRequest::for_run(dir, "sales", run_id, Framework::Tensorflow, 8.0, 0.02, train_info())
}

#[tokio::test]
async fn identical_artifact_registers_once() {
    let root = tempdir().unwrap();
    let artifact = root.path().join("models/timeseries/sales_model_ver001_LSTM");
    write_artifact(&artifact, b"weights-v1");

    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), root.path().join("models"));

    let first = manager.register_if_changed(&request(&artifact, "run-1")).await.unwrap();
    assert!(matches!(first, RegistrationOutcome::Registered(_)));

    let second = manager.register_if_changed(&request(&artifact, "run-2")).await.unwrap();
    assert!(matches!(second, RegistrationOutcome::Unchanged { .. }));
    assert_eq!(second.version_number(), None);

    let versions = tracker.search_model_versions("sales_model").await.unwrap();
    assert_eq!(versions.len(), 1);
}

#[tokio::test]
async fn changed_artifact_gets_new_version() {
    let root = tempdir().unwrap();
    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), root.path());

    let first_dir = root.path().join("sales_model_ver001_LSTM");
    write_artifact(&first_dir, b"weights-v1");
    let first = manager.register_if_changed(&request(&first_dir, "run-1")).await.unwrap();
    assert_eq!(first.version_number(), Some(1));

    let second_dir = root.path().join("sales_model_ver002_LSTM");
    write_artifact(&second_dir, b"weights-v2");
    let second = manager.register_if_changed(&request(&second_dir, "run-2")).await.unwrap();
    assert_eq!(second.version_number(), Some(2));

    let models = tracker.search_registered_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(
        models[0].tags["description"],
        "In the latest experiment, the LSTM model is applied for sales_model"
    );
    assert_eq!(manager.resolve_version("sales_model", None).await.unwrap().run_id, "run-2");
}

#[tokio::test]
async fn retry_for_same_run_reuses_existing_version() {
    let root = tempdir().unwrap();
    let artifact = root.path().join("run");
    write_artifact(&artifact, b"weights");

    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), root.path());
    let req = request(&artifact, "run-1");
    manager.register_if_changed(&req).await.unwrap();

    // Losing the local hash record forces the registry lookup path.
    fs::remove_file(manager.state_path()).unwrap();
    let again = manager.register_if_changed(&req).await.unwrap();
    match again {
        RegistrationOutcome::Existing(v) => assert_eq!(v.version, 1),
        other => panic!("expected existing version, got {other:?}"),
    }
    assert_eq!(tracker.search_model_versions("sales_model").await.unwrap().len(), 1);
}

#[tokio::test]
async fn archived_initial_stage_policy() {
    let root = tempdir().unwrap();
    let artifact = root.path().join("run");
    write_artifact(&artifact, b"weights");

    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), root.path())
        .with_initial_stage(ModelStage::Archived);
    manager.register_if_changed(&request(&artifact, "run-1")).await.unwrap();

    let stored = tracker.search_model_versions("sales_model").await.unwrap();
    assert_eq!(stored[0].stage, ModelStage::Archived);
}

#[tokio::test]
async fn missing_artifact_directory_is_fatal() {
    let root = tempdir().unwrap();
    let manager = ModelRegistryManager::new(Arc::new(LocalTracker::in_memory()), root.path());
    let result = manager
        .register_if_changed(&request(&root.path().join("absent"), "run-1"))
        .await;
    assert!(matches!(result, Err(RegistryError::ArtifactNotFound(_))));
}

/// Delegates to a local tracker but rejects stage transitions.
struct FlakyTracker {
    inner: LocalTracker,
}

#[async_trait]
impl ExperimentTracker for FlakyTracker {
    async fn create_experiment_if_absent(&self, name: &str) -> Result<Experiment> {
        self.inner.create_experiment_if_absent(name).await
    }
    async fn start_run(&self, exp: &str, name: &str, desc: &str) -> Result<RunInfo> {
        self.inner.start_run(exp, name, desc).await
    }
    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.inner.end_run(run_id, status).await
    }
    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        self.inner.log_params(run_id, params).await
    }
    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: i64) -> Result<()> {
        self.inner.log_metric(run_id, key, value, step).await
    }
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.inner.set_tag(run_id, key, value).await
    }
    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<()> {
        self.inner.log_artifact(run_id, path).await
    }
    async fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        self.inner.get_run(run_id).await
    }
    async fn search_runs(&self, exp: &str) -> Result<Vec<RunInfo>> {
        self.inner.search_runs(exp).await
    }
    async fn search_registered_models(&self) -> Result<Vec<RegisteredModel>> {
        self.inner.search_registered_models().await
    }
    async fn search_model_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>> {
        self.inner.search_model_versions(name).await
    }
    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        self.inner.create_registered_model(name).await
    }
    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<RegisteredModelVersion> {
        self.inner.create_model_version(name, source, run_id).await
    }
    async fn update_model_version(&self, name: &str, version: u64, desc: &str) -> Result<()> {
        self.inner.update_model_version(name, version, desc).await
    }
    async fn transition_stage(&self, _: &str, _: u64, _: ModelStage) -> Result<()> {
        Err(RegistryError::external("mlflow", "503 Service Unavailable"))
    }
    async fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.inner.set_registered_model_tag(name, key, value).await
    }
    async fn set_model_version_tag(
        &self,
        name: &str,
        version: u64,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.inner.set_model_version_tag(name, version, key, value).await
    }
    fn backend(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn registry_failure_returns_partial_result() {
    let root = tempdir().unwrap();
    let artifact = root.path().join("run");
    write_artifact(&artifact, b"weights");

    let tracker = Arc::new(FlakyTracker {
        inner: LocalTracker::in_memory(),
    });
    let manager = ModelRegistryManager::new(tracker, root.path());

    let outcome = manager.register_if_changed(&request(&artifact, "run-1")).await.unwrap();
    match outcome {
        RegistrationOutcome::Failed { version, error } => {
            let version = version.expect("version created before the failure");
            assert_eq!(version.version, 1);
            assert!(version.description.is_some());
            assert!(error.contains("503"));
        }
        other => panic!("expected failure outcome, got {other:?}"),
    }
    // Nothing recorded, so the next attempt retries registration.
    assert_eq!(manager.recorded_hash("sales_model").unwrap(), None);
}

#[tokio::test]
async fn run_names_increment_within_experiment() {
    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), tempdir().unwrap().path());
    let exp = tracker.create_experiment_if_absent("forecast").await.unwrap();

    let first = manager.next_run_name(&exp.experiment_id, "sales", "GRU").await.unwrap();
    assert_eq!(first, "sales_model_ver001_GRU");
    tracker.start_run(&exp.experiment_id, &first, "").await.unwrap();

    let second = manager.next_run_name(&exp.experiment_id, "sales", "LSTM").await.unwrap();
    assert_eq!(second, "sales_model_ver002_LSTM");
}

#[tokio::test]
async fn unwritable_hash_record_keeps_registration() {
    let root = tempdir().unwrap();
    let artifact = root.path().join("run");
    write_artifact(&artifact, b"weights");
    // A regular file where the model root directory should be.
    let blocked_root = root.path().join("models");
    fs::write(&blocked_root, b"not a directory").unwrap();

    let tracker = Arc::new(LocalTracker::in_memory());
    let manager = ModelRegistryManager::new(tracker.clone(), &blocked_root);

    let outcome = manager.register_if_changed(&request(&artifact, "run-1")).await.unwrap();
    assert!(matches!(outcome, RegistrationOutcome::Registered(_)));
    assert_eq!(outcome.version_number(), Some(1));
    assert_eq!(tracker.search_model_versions("sales_model").await.unwrap().len(), 1);
    assert_eq!(manager.recorded_hash("sales_model").unwrap(), None);
}
