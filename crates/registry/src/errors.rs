//! Error types for the model registry

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while registering or resolving models
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Registered model or version not found
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Invalid registration request
    #[error("Invalid model registration: {0}")]
    InvalidRegistration(String),

    /// Tracking server or serving endpoint call failed
    #[error("{service} request failed: {reason}")]
    ExternalService { service: String, reason: String },

    /// Persisted registry document could not be parsed
    #[error("Metadata corrupted at {}: {reason}", path.display())]
    MetadataCorruption { path: PathBuf, reason: String },

    /// I/O error with the path that triggered it
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RegistryError {
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
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        Self::external("http", err)
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
