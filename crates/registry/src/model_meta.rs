//! Per-run model metadata document (`<model_name>.yaml`).

use crate::errors::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Training framework that produced the weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Pytorch,
    Tensorflow,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pytorch => "pytorch",
            Self::Tensorflow => "tensorflow",
        }
    }

    /// File name of the saved weights inside the run directory.
    pub fn weights_file(&self) -> &'static str {
        match self {
            Self::Pytorch => "trained_model.pth",
            Self::Tensorflow => "trained_model.h5",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pytorch" | "torch" => Ok(Self::Pytorch),
            "tensorflow" | "keras" => Ok(Self::Tensorflow),
            other => Err(RegistryError::InvalidRegistration(format!(
                "unsupported framework '{other}'"
            ))),
        }
    }
}

/// Dataset a model was trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatasetLineage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    /// e.g. "Train 70%, Validate 10%, Test 20%"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Metadata written next to the trained weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub model_type: String,
    pub framework: Framework,
    #[serde(default)]
    pub hparams: BTreeMap<String, Value>,
    pub dataset: DatasetLineage,
    /// `%Y-%m-%d`
    pub created_date: String,
}

impl ModelMetadata {
    pub fn new(
        model_name: impl Into<String>,
        model_type: impl Into<String>,
        framework: Framework,
        dataset: DatasetLineage,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_type: model_type.into(),
            framework,
            hparams: BTreeMap::new(),
            dataset,
            created_date: chrono::Local::now().format("%Y-%m-%d").to_string(),
        }
    }

    pub fn with_hparams(mut self, hparams: BTreeMap<String, Value>) -> Self {
        self.hparams = hparams;
        self
    }
}

pub fn metadata_file_name(model_name: &str) -> String {
    format!("{model_name}.yaml")
}

/// Write `<dir>/<model_name>.yaml`, returning its path.
pub fn write_model_metadata(dir: &Path, metadata: &ModelMetadata) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;
    let path = dir.join(metadata_file_name(&metadata.model_name));
    let yaml = serde_yaml::to_string(metadata)?;
    fs::write(&path, yaml).map_err(|e| RegistryError::io(&path, e))?;
    Ok(path)
}

pub fn read_model_metadata(path: &Path) -> Result<ModelMetadata> {
    if !path.is_file() {
        return Err(RegistryError::ArtifactNotFound(path.display().to_string()));
    }
    let raw = fs::read_to_string(path).map_err(|e| RegistryError::io(path, e))?;
    serde_yaml::from_str(&raw).map_err(|e| RegistryError::MetadataCorruption {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> ModelMetadata {
        let mut hparams = BTreeMap::new();
        hparams.insert("epochs".to_string(), Value::from(20));
        hparams.insert("learningRate".to_string(), Value::from(0.001));
        ModelMetadata::new(
            "sales",
            "GRU",
            Framework::Pytorch,
            DatasetLineage {
                name: "sales".into(),
                version: Some("1.0.2".into()),
                data_type: "timeseries".into(),
                ..Default::default()
            },
        )
        .with_hparams(hparams)
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let meta = sample();
        let path = write_model_metadata(dir.path(), &meta).unwrap();
        assert_eq!(path.file_name().unwrap(), "sales.yaml");

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("framework: pytorch"));
        assert_eq!(read_model_metadata(&path).unwrap(), meta);
    }

    #[test]
    fn test_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sales.yaml");
        assert!(matches!(
            read_model_metadata(&path),
            Err(RegistryError::ArtifactNotFound(_))
        ));

        fs::write(&path, "model_name: [unterminated").unwrap();
        assert!(matches!(
            read_model_metadata(&path),
            Err(RegistryError::MetadataCorruption { .. })
        ));
    }

    #[test]
    fn test_framework_parsing() {
        assert_eq!("PyTorch".parse::<Framework>().unwrap(), Framework::Pytorch);
        assert_eq!(Framework::Tensorflow.weights_file(), "trained_model.h5");
        assert!("jax".parse::<Framework>().is_err());
    }
}
