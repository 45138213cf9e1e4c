//! Per-version and dataset-level metadata documents.

use crate::errors::{DatasetError, Result};
use crate::serialize::{to_storage_json, write_storage_json};
use crate::stats::{DatasetStatistics, FeatureInfo, QualityMetrics};
use crate::version::{compare_version_strings, DatasetVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key under which the version history is stored.
pub const VERSIONS_KEY: &str = "versions";

/// File name of the dataset-level aggregate document.
pub fn global_metadata_file_name(dataset: &str) -> String {
    format!("metadata_{dataset}.json")
}

/// File name of a per-version document.
pub fn version_metadata_file_name(dataset: &str, version: &DatasetVersion) -> String {
    format!("metadata_{dataset}_{version}.json")
}

/// One line of version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub changes: String,
    #[serde(default)]
    pub author: String,
}

/// Row counts of each partition.
///
/// `holdout` counts the leading rows that only ever serve as window context
/// and never appear as a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSizes {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    pub holdout: usize,
}

/// Kind of data held by a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Timeseries,
    Image,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeseries => write!(f, "timeseries"),
            Self::Image => write!(f, "image"),
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeseries" => Ok(Self::Timeseries),
            "image" => Ok(Self::Image),
            other => Err(DatasetError::Configuration(format!(
                "unsupported data_type '{other}'"
            ))),
        }
    }
}

/// Metadata document of one immutable dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub version: DatasetVersion,
    pub created_date: String,
    pub author: String,
    pub change_description: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Size of the copied source file in bytes
    pub size: u64,
    pub last_modified: String,
    pub rows: usize,
    pub columns: usize,
    pub format: String,
    pub source_file: String,
    /// blake3 digest of the source file
    pub source_hash: String,
    pub date_column: String,
    pub target_column: String,
    pub window_size: usize,
    pub status: String,
    pub progress: u8,
    pub features: Vec<FeatureInfo>,
    pub statistics: DatasetStatistics,
    pub quality: QualityMetrics,
    pub split_sizes: SplitSizes,
    #[serde(rename = "columns_list")]
    pub columns_list: Vec<String>,
    pub time_range: String,
    pub sample_rate: String,
    /// First rows of the source as row objects
    #[serde(default)]
    pub data: Value,
    pub versions: Vec<VersionEntry>,
}

impl VersionMetadata {
    /// History entry describing this version.
    pub fn entry(&self) -> VersionEntry {
        VersionEntry {
            version: self.version.to_string(),
            date: self.created_date.clone(),
            changes: self.change_description.clone(),
            author: self.author.clone(),
        }
    }
}

/// Read a per-version document.
pub fn load_version_metadata(path: &Path) -> Result<VersionMetadata> {
    let raw = read_document(path)?;
    serde_json::from_str(&raw).map_err(|e| corruption(path, e))
}

fn read_document(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DatasetError::ArtifactNotFound(path.to_path_buf())
        } else {
            DatasetError::io(path, e)
        }
    })
}

fn corruption(path: &Path, reason: impl ToString) -> DatasetError {
    DatasetError::MetadataCorruption {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Read the dataset-level document, or an empty one when it does not exist.
///
/// Unparseable content is an error; it is never replaced with an empty
/// document.
pub fn load_global_metadata(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = read_document(path)?;
    match serde_json::from_str::<Value>(&raw).map_err(|e| corruption(path, e))? {
        Value::Object(map) => Ok(map),
        other => Err(corruption(
            path,
            format!("expected a JSON object, found {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Normalise a stored history list. Older documents may hold bare version
/// strings instead of entry objects.
fn history_entries(path: &Path, value: Option<&Value>) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(version) => {
                    let mut entry = Map::new();
                    entry.insert("version".to_string(), Value::String(version.clone()));
                    Ok(Value::Object(entry))
                }
                Value::Object(map) if map.get("version").map_or(false, Value::is_string) => {
                    Ok(item.clone())
                }
                _ => Err(corruption(path, "version history entry without a version")),
            })
            .collect(),
        Some(other) => Err(corruption(
            path,
            format!("'versions' must be an array, found {}", json_kind(other)),
        )),
    }
}

fn entry_version(entry: &Value) -> &str {
    entry.get("version").and_then(Value::as_str).unwrap_or_default()
}

/// Merge a per-version document into `<dataset_root>/metadata_<dataset>.json`.
///
/// Every field except `versions` overwrites the stored one. The history is
/// merged by version string (an incoming entry replaces a stored entry with
/// the same version) and sorted in ascending semantic order. A malformed
/// stored document fails with [`DatasetError::MetadataCorruption`] and is
/// left untouched on disk.
pub fn merge_global_metadata(
    dataset_root: &Path,
    dataset_name: &str,
    version_doc: &VersionMetadata,
) -> Result<Value> {
    let path = dataset_root.join(global_metadata_file_name(dataset_name));
    let mut global = load_global_metadata(&path)?;
    let mut history = history_entries(&path, global.get(VERSIONS_KEY))?;
    let previous = history.len();

    let incoming = match to_storage_json(version_doc)? {
        Value::Object(map) => map,
        _ => return Err(corruption(&path, "version document is not an object")),
    };

    for (key, value) in incoming {
        if key == VERSIONS_KEY {
            for entry in history_entries(&path, Some(&value))? {
                let version = entry_version(&entry).to_string();
                match history.iter_mut().find(|e| entry_version(e) == version) {
                    Some(existing) => *existing = entry,
                    None => history.push(entry),
                }
            }
        } else {
            global.insert(key, value);
        }
    }

    history.sort_by(|a, b| compare_version_strings(entry_version(a), entry_version(b)));
    global.insert(VERSIONS_KEY.to_string(), Value::Array(history));

    let document = Value::Object(global);
    write_storage_json(&path, &document)?;

    let total = document[VERSIONS_KEY].as_array().map_or(0, Vec::len);
    if total > previous {
        info!(dataset = dataset_name, versions = total, "Global metadata updated");
    } else {
        debug!(dataset = dataset_name, versions = total, "Global metadata refreshed");
    }
    Ok(document)
}

/// Path of the per-version document inside `version_dir`.
pub fn version_metadata_path(
    version_dir: &Path,
    dataset: &str,
    version: &DatasetVersion,
) -> PathBuf {
    version_dir.join(version_metadata_file_name(dataset, version))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    pub(crate) fn sample_metadata(version: &str) -> VersionMetadata {
        VersionMetadata {
            id: "sales".into(),
            name: "sales".into(),
            data_type: DataType::Timeseries,
            version: version.parse().unwrap(),
            created_date: "2024-05-01".into(),
            author: "tester".into(),
            change_description: format!("ingest {version}"),
            description: "daily sales".into(),
            tags: vec!["retail".into()],
            size: 42,
            last_modified: "2024-05-01".into(),
            rows: 100,
            columns: 2,
            format: "CSV/TXT".into(),
            source_file: "sales.csv".into(),
            source_hash: "abc".into(),
            date_column: "date".into(),
            target_column: "sales".into(),
            window_size: 10,
            status: "completed".into(),
            progress: 100,
            features: Vec::new(),
            statistics: DatasetStatistics::default(),
            quality: QualityMetrics::default(),
            split_sizes: SplitSizes::default(),
            columns_list: vec!["date".into(), "sales".into()],
            time_range: "Unknown".into(),
            sample_rate: "Unknown".into(),
            data: json!([]),
            versions: Vec::new(),
        }
        .with_own_entry()
    }

    impl VersionMetadata {
        fn with_own_entry(mut self) -> Self {
            self.versions = vec![self.entry()];
            self
        }
    }

    fn versions_of(doc: &Value) -> Vec<String> {
        doc["versions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["version"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_merge_into_empty() {
        let dir = tempdir().unwrap();
        let doc = merge_global_metadata(dir.path(), "sales", &sample_metadata("1.0.0")).unwrap();

        assert_eq!(versions_of(&doc), vec!["1.0.0"]);
        assert_eq!(doc["rows"], json!(100));
        assert!(dir.path().join("metadata_sales.json").exists());
    }

    #[test]
    fn test_merge_keeps_history_sorted_semantically() {
        let dir = tempdir().unwrap();
        for v in ["1.0.2", "1.0.10", "1.0.9", "1.0.0"] {
            merge_global_metadata(dir.path(), "sales", &sample_metadata(v)).unwrap();
        }

        let stored = load_global_metadata(&dir.path().join("metadata_sales.json")).unwrap();
        assert_eq!(
            versions_of(&Value::Object(stored.clone())),
            vec!["1.0.0", "1.0.2", "1.0.9", "1.0.10"]
        );
        // last write wins for plain fields
        assert_eq!(stored["version"], json!("1.0.0"));
    }

    #[test]
    fn test_merge_deduplicates() {
        let dir = tempdir().unwrap();
        merge_global_metadata(dir.path(), "sales", &sample_metadata("1.0.0")).unwrap();
        let doc = merge_global_metadata(dir.path(), "sales", &sample_metadata("1.0.0")).unwrap();
        assert_eq!(versions_of(&doc).len(), 1);
    }

    #[test]
    fn test_merge_accepts_legacy_string_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata_sales.json");
        fs::write(&path, r#"{"versions": ["1.0.1", "1.0.0"], "legacy": true}"#).unwrap();

        let doc = merge_global_metadata(dir.path(), "sales", &sample_metadata("1.0.2")).unwrap();
        assert_eq!(versions_of(&doc), vec!["1.0.0", "1.0.1", "1.0.2"]);
        assert_eq!(doc["legacy"], json!(true));
    }

    #[test]
    fn test_malformed_global_metadata_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata_sales.json");
        let truncated = r#"{"versions": [{"version": "1.0.0"}"#;
        fs::write(&path, truncated).unwrap();

        let err = merge_global_metadata(dir.path(), "sales", &sample_metadata("1.0.1")).unwrap_err();
        assert!(matches!(err, DatasetError::MetadataCorruption { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), truncated);
    }

    #[test]
    fn test_version_metadata_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let meta = sample_metadata("2.0.0");
        let path = version_metadata_path(dir.path(), "sales", &meta.version);
        write_storage_json(&path, &meta).unwrap();

        assert!(path.ends_with("metadata_sales_2.0.0.json"));
        assert_eq!(load_version_metadata(&path).unwrap(), meta);
    }
}
