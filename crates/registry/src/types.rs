//! Type definitions for experiment tracking and the model registry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::RegistryError;

/// Tag key under which the artifact content hash is recorded.
pub const CONTENT_HASH_TAG: &str = "content_hash";

/// Lifecycle label of a registered model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ModelStage {
    /// Freshly created, no stage assigned
    #[default]
    None,
    /// Candidate awaiting promotion
    Staging,
    /// Serving production traffic
    Production,
    /// Retired
    Archived,
}

impl ModelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Staging => "Staging",
            Self::Production => "Production",
            Self::Archived => "Archived",
        }
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStage {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            other => Err(RegistryError::InvalidRegistration(format!(
                "unknown model stage '{other}'"
            ))),
        }
    }
}

/// Status of a tracked run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    #[default]
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Scheduled => "SCHEDULED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }

    /// Parse a tracker status, treating unknown values as `Running`.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "SCHEDULED" => Self::Scheduled,
            "FINISHED" => Self::Finished,
            "FAILED" => Self::Failed,
            "KILLED" => Self::Killed,
            _ => Self::Running,
        }
    }
}

/// Experiment grouping related runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
}

/// One logged metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub step: i64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// A tracked training, evaluation or deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunInfo {
    pub run_id: String,
    pub run_name: String,
    pub experiment_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    /// Artifact paths relative to the run's artifact root
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// A named registry entry grouping model versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One version of a registered model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModelVersion {
    /// Registry entry name
    pub name: String,
    /// Registry-assigned number, starting at 1
    pub version: u64,
    /// Artifact location the version points to
    pub source: String,
    /// Training run that produced the artifact
    pub run_id: String,
    pub stage: ModelStage,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RegisteredModelVersion {
    /// Digest of the artifact directory, when recorded.
    pub fn content_hash(&self) -> Option<&str> {
        self.tags.get(CONTENT_HASH_TAG).map(String::as_str)
    }
}
