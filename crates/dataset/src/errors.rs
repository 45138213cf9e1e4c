//! Error types for the versioned dataset store

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while versioning, materializing or splitting datasets
#[derive(Error, Debug)]
pub enum DatasetError {
    /// Missing or invalid run configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not enough rows or examples to form a window or split
    #[error("Insufficient data: need at least {required} samples, got {available}")]
    InsufficientData { required: usize, available: usize },

    /// An existing metadata document could not be parsed
    #[error("Metadata corrupted at {}: {reason}", path.display())]
    MetadataCorruption { path: PathBuf, reason: String },

    /// Expected file or folder is absent
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// Source file type is not one of csv / txt / xlsx
    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    /// Target column cannot be coerced to numbers
    #[error("Column '{column}' is not numeric: {detail}")]
    NonNumeric { column: String, detail: String },

    /// Malformed version string
    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    /// Tabular source could not be parsed
    #[error("Failed to read {}: {reason}", path.display())]
    Source { path: PathBuf, reason: String },

    /// Tensor file is not a supported `.npy` layout
    #[error("Invalid tensor file {}: {reason}", path.display())]
    Tensor { path: PathBuf, reason: String },

    /// Data-versioning tool invocation failed
    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// I/O error with the path that triggered it
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatasetError {
    /// Wrap an I/O error with the path involved.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether the error indicates that a stage cannot proceed for lack of data.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

/// Result type for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;
