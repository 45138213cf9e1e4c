//! MLflow REST client.
//!
//! Talks to the tracking server's `/api/2.0/mlflow/` endpoints. Artifacts are
//! uploaded through the artifact proxy at `/api/2.0/mlflow-artifacts/`.

use crate::errors::{RegistryError, Result};
use crate::tracker::ExperimentTracker;
use crate::types::{
    Experiment, MetricPoint, ModelStage, RegisteredModel, RegisteredModelVersion, RunInfo,
    RunStatus,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "mlflow";
const MAX_RESULTS: u32 = 1000;

/// Experiment tracker backed by an MLflow tracking server
#[derive(Clone, Debug)]
pub struct MlflowTracker {
    client: reqwest::Client,
    base_url: String,
}

impl MlflowTracker {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/api/2.0/mlflow/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::external(
            SERVICE,
            format!("{path} failed (status {status}): {body}"),
        ))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(path, "GET mlflow");
        let response = self.client.get(self.endpoint(path)).query(query).send().await?;
        Self::decode(path, response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        debug!(path, "POST mlflow");
        let response = self.client.post(self.endpoint(path)).json(body).send().await?;
        Self::decode(path, response).await
    }

    async fn patch<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        debug!(path, "PATCH mlflow");
        let response = self.client.patch(self.endpoint(path)).json(body).send().await?;
        Self::decode(path, response).await
    }
}

// Wire types. MLflow omits empty fields, so everything defaults.

#[derive(Debug, Default, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

fn into_map(pairs: Vec<KeyValue>) -> BTreeMap<String, String> {
    pairs.into_iter().map(|kv| (kv.key, kv.value)).collect()
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentDto {
    experiment_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: ExperimentDto,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunInfoDto {
    run_id: String,
    #[serde(default)]
    run_name: String,
    #[serde(default)]
    experiment_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetricDto {
    key: String,
    value: f64,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    step: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RunDataDto {
    #[serde(default)]
    metrics: Vec<MetricDto>,
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct RunDto {
    info: RunInfoDto,
    #[serde(default)]
    data: RunDataDto,
}

impl From<RunDto> for RunInfo {
    fn from(dto: RunDto) -> Self {
        let mut metrics: BTreeMap<String, Vec<MetricPoint>> = BTreeMap::new();
        for m in dto.data.metrics {
            metrics.entry(m.key).or_default().push(MetricPoint {
                value: m.value,
                step: m.step,
                timestamp: m.timestamp,
            });
        }
        let tags = into_map(dto.data.tags);
        let run_name = if dto.info.run_name.is_empty() {
            tags.get("mlflow.runName").cloned().unwrap_or_default()
        } else {
            dto.info.run_name
        };

        RunInfo {
            run_id: dto.info.run_id,
            run_name,
            experiment_id: dto.info.experiment_id,
            status: RunStatus::parse_lenient(&dto.info.status),
            params: into_map(dto.data.params),
            tags,
            metrics,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: RunDto,
}

#[derive(Debug, Default, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<RunDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisteredModelDto {
    name: String,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

impl From<RegisteredModelDto> for RegisteredModel {
    fn from(dto: RegisteredModelDto) -> Self {
        RegisteredModel {
            name: dto.name,
            tags: into_map(dto.tags),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchModelsResponse {
    #[serde(default)]
    registered_models: Vec<RegisteredModelDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateModelResponse {
    registered_model: RegisteredModelDto,
}

#[derive(Debug, Deserialize)]
struct ModelVersionDto {
    name: String,
    version: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    current_stage: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

impl TryFrom<ModelVersionDto> for RegisteredModelVersion {
    type Error = RegistryError;

    fn try_from(dto: ModelVersionDto) -> Result<Self> {
        let version = dto.version.parse::<u64>().map_err(|_| {
            RegistryError::external(SERVICE, format!("non-numeric model version '{}'", dto.version))
        })?;
        Ok(RegisteredModelVersion {
            name: dto.name,
            version,
            source: dto.source,
            run_id: dto.run_id,
            stage: dto.current_stage.parse().unwrap_or_default(),
            description: dto.description.filter(|d| !d.is_empty()),
            tags: into_map(dto.tags),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchVersionsResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersionDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateVersionResponse {
    model_version: ModelVersionDto,
}

#[derive(Debug, Default, Deserialize)]
struct Empty {}

#[async_trait]
impl ExperimentTracker for MlflowTracker {
    async fn create_experiment_if_absent(&self, name: &str) -> Result<Experiment> {
        let response = self
            .client
            .get(self.endpoint("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await?;

        if response.status() != StatusCode::NOT_FOUND {
            let found: ExperimentResponse =
                Self::decode("experiments/get-by-name", response).await?;
            return Ok(Experiment {
                experiment_id: found.experiment.experiment_id,
                name: found.experiment.name,
            });
        }

        let created: CreateExperimentResponse = self
            .post("experiments/create", &json!({ "name": name }))
            .await?;
        Ok(Experiment {
            experiment_id: created.experiment_id,
            name: name.to_string(),
        })
    }

    async fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        description: &str,
    ) -> Result<RunInfo> {
        let mut tags = vec![json!({ "key": "mlflow.runName", "value": run_name })];
        if !description.is_empty() {
            tags.push(json!({ "key": "mlflow.note.content", "value": description }));
        }
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": chrono::Utc::now().timestamp_millis(),
            "tags": tags,
        });
        let created: RunResponse = self.post("runs/create", &body).await?;
        Ok(created.run.into())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let body = json!({
            "run_id": run_id,
            "status": status.as_str(),
            "end_time": chrono::Utc::now().timestamp_millis(),
        });
        let _: Value = self.post("runs/update", &body).await?;
        Ok(())
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        if params.is_empty() {
            return Ok(());
        }
        let params: Vec<Value> = params
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        let _: Empty = self
            .post("runs/log-batch", &json!({ "run_id": run_id, "params": params }))
            .await?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: i64) -> Result<()> {
        let body = json!({
            "run_id": run_id,
            "key": key,
            "value": value,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "step": step,
        });
        let _: Empty = self.post("runs/log-metric", &body).await?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let body = json!({ "run_id": run_id, "key": key, "value": value });
        let _: Empty = self.post("runs/set-tag", &body).await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RegistryError::io(path, e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RegistryError::ArtifactNotFound(path.display().to_string()))?;

        let run = self.get_run(run_id).await?;
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}/artifacts/{}",
            self.base_url.trim_end_matches('/'),
            run.experiment_id,
            run_id,
            file_name
        );
        let response = self.client.put(url).body(bytes).send().await?;
        let _: Value = Self::decode("mlflow-artifacts/artifacts", response).await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let response: RunResponse = self
            .get("runs/get", &[("run_id", run_id.to_string())])
            .await?;
        Ok(response.run.into())
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>> {
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({
                "experiment_ids": [experiment_id],
                "max_results": MAX_RESULTS,
            });
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }
            let page: SearchRunsResponse = self.post("runs/search", &body).await?;
            runs.extend(page.runs.into_iter().map(RunInfo::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(runs)
    }

    async fn search_registered_models(&self) -> Result<Vec<RegisteredModel>> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("max_results", MAX_RESULTS.to_string())];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let page: SearchModelsResponse = self.get("registered-models/search", &query).await?;
            models.extend(page.registered_models.into_iter().map(RegisteredModel::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(models)
    }

    async fn search_model_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("filter", filter.clone()),
                ("max_results", MAX_RESULTS.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let page: SearchVersionsResponse = self.get("model-versions/search", &query).await?;
            for dto in page.model_versions {
                versions.push(RegisteredModelVersion::try_from(dto)?);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(versions)
    }

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        let created: CreateModelResponse = self
            .post("registered-models/create", &json!({ "name": name }))
            .await?;
        Ok(created.registered_model.into())
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<RegisteredModelVersion> {
        let body = json!({ "name": name, "source": source, "run_id": run_id });
        let created: CreateVersionResponse = self.post("model-versions/create", &body).await?;
        created.model_version.try_into()
    }

    async fn update_model_version(
        &self,
        name: &str,
        version: u64,
        description: &str,
    ) -> Result<()> {
        let body = json!({
            "name": name,
            "version": version.to_string(),
            "description": description,
        });
        let _: Value = self.patch("model-versions/update", &body).await?;
        Ok(())
    }

    async fn transition_stage(&self, name: &str, version: u64, stage: ModelStage) -> Result<()> {
        let body = json!({
            "name": name,
            "version": version.to_string(),
            "stage": stage.as_str(),
            "archive_existing_versions": false,
        });
        let _: Value = self.post("model-versions/transition-stage", &body).await?;
        Ok(())
    }

    async fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let body = json!({ "name": name, "key": key, "value": value });
        let _: Empty = self.post("registered-models/set-tag", &body).await?;
        Ok(())
    }

    async fn set_model_version_tag(
        &self,
        name: &str,
        version: u64,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let body = json!({
            "name": name,
            "version": version.to_string(),
            "key": key,
            "value": value,
        });
        let _: Empty = self.post("model-versions/set-tag", &body).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "mlflow"
    }
}
