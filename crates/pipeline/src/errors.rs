//! Error types for pipeline execution

use mlops_dataset::DatasetError;
use mlops_registry::RegistryError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while configuring or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or invalid run configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another pipeline run is in flight
    #[error("Pipeline busy: {0}")]
    PipelineBusy(String),

    /// Expected model, metadata or dataset artifact is absent
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Orchestrator, trainer, evaluator or serving endpoint failed
    #[error("{service} failed: {reason}")]
    ExternalService { service: String, reason: String },

    /// Dataset store error
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Registry or experiment tracker error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// I/O error with the path that triggered it
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn external(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::ExternalService {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Category name of the error.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::PipelineBusy(_) => "busy",
            Self::ArtifactNotFound(_) => "artifact_not_found",
            Self::ExternalService { .. } => "external_service",
            Self::Dataset(e) => match e {
                DatasetError::Configuration(_)
                | DatasetError::UnsupportedFormat(_)
                | DatasetError::InvalidVersion(_) => "configuration",
                DatasetError::InsufficientData { .. } => "insufficient_data",
                DatasetError::MetadataCorruption { .. } => "metadata_corruption",
                DatasetError::ArtifactNotFound(_) => "artifact_not_found",
                DatasetError::ExternalTool { .. } => "external_service",
                _ => "data",
            },
            Self::Registry(e) => match e {
                RegistryError::ArtifactNotFound(_) => "artifact_not_found",
                RegistryError::ExternalService { .. } => "external_service",
                RegistryError::MetadataCorruption { .. } => "metadata_corruption",
                RegistryError::InvalidRegistration(_) => "configuration",
                _ => "registry",
            },
            Self::Io { .. } => "io",
            Self::Serialization(_) | Self::Yaml(_) => "serialization",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::external("http", err)
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_component_errors() {
        let err = PipelineError::from(DatasetError::InsufficientData {
            required: 11,
            available: 5,
        });
        assert_eq!(err.category(), "insufficient_data");

        let err = PipelineError::from(RegistryError::ArtifactNotFound("sales_model v3".into()));
        assert_eq!(err.category(), "artifact_not_found");
        assert!(err.to_string().contains("sales_model v3"));

        assert_eq!(PipelineError::PipelineBusy("x".into()).category(), "busy");
    }
}
