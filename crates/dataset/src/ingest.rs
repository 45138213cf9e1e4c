//! Time-series ingestion: source file in, complete dataset version out.

use crate::errors::{DatasetError, Result};
use crate::features::{
    prepare_sequences, split_chronological, CleaningPolicy, DEFAULT_TEST_FRACTION,
    DEFAULT_VAL_FRACTION,
};
use crate::metadata::{DataType, SplitSizes, VersionEntry, VersionMetadata};
use crate::serialize::serialize_for_storage;
use crate::snapshot::{fingerprint_file, SnapshotStore};
use crate::stats;
use crate::table::{SourceFormat, Table};
use crate::version::DatasetVersion;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Rows of the source kept in the version metadata as a preview.
pub const PREVIEW_ROWS: usize = 50;

/// Everything needed to turn a source file into a dataset version.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub dataset: String,
    pub data_type: DataType,
    pub source: PathBuf,
    pub date_column: String,
    pub target_column: String,
    /// Window length (`time_step`)
    pub window_size: usize,
    pub test_fraction: f64,
    pub val_fraction: f64,
    pub cleaning: CleaningPolicy,
    pub author: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl IngestRequest {
    pub fn new(
        dataset: impl Into<String>,
        source: impl Into<PathBuf>,
        date_column: impl Into<String>,
        target_column: impl Into<String>,
        window_size: usize,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            data_type: DataType::Timeseries,
            source: source.into(),
            date_column: date_column.into(),
            target_column: target_column.into(),
            window_size,
            test_fraction: DEFAULT_TEST_FRACTION,
            val_fraction: DEFAULT_VAL_FRACTION,
            cleaning: CleaningPolicy::default(),
            author: "unknown".to_string(),
            description: "No description".to_string(),
            tags: Vec::new(),
        }
    }
}

/// Result of an ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub dataset: String,
    pub version: DatasetVersion,
    pub version_dir: PathBuf,
    /// `false` when an existing version already held this exact source
    pub created: bool,
}

/// Ingest a time-series source into `store`.
///
/// When the latest complete version was built from a byte-identical source,
/// nothing is written and that version is returned. Errors in loading,
/// cleaning or splitting surface before any folder is created.
pub fn ingest_timeseries(store: &SnapshotStore, request: &IngestRequest) -> Result<IngestOutcome> {
    if request.data_type != DataType::Timeseries {
        return Err(DatasetError::Configuration(format!(
            "ingestion supports timeseries datasets only, got '{}'",
            request.data_type
        )));
    }
    if request.dataset.trim().is_empty() {
        return Err(DatasetError::Configuration("dataset name is empty".to_string()));
    }

    let source = request.source.as_path();
    if !source.is_file() {
        return Err(DatasetError::ArtifactNotFound(source.to_path_buf()));
    }
    let format = SourceFormat::from_path(source)?;
    let source_hash = fingerprint_file(source)?;
    let dataset = request.dataset.as_str();

    if let Some(latest) = store.latest_complete_version(dataset)? {
        let existing = store.load_version_metadata(dataset, &latest)?;
        if existing.source_hash == source_hash {
            let version_dir = store.version_dir(dataset, &latest);
            info!(
                dataset,
                version = %latest,
                path = %version_dir.display(),
                "Source unchanged, reusing existing version"
            );
            return Ok(IngestOutcome {
                dataset: dataset.to_string(),
                version: latest,
                version_dir,
                created: false,
            });
        }
    }

    info!(dataset, source = %source.display(), "Loading time series source");
    let mut table = Table::load(source)?;
    let date_idx = require_column(&table, &request.date_column)?;
    require_column(&table, &request.target_column)?;
    table.sort_by_column(date_idx);

    let prepared = prepare_sequences(
        &table,
        &request.target_column,
        request.window_size,
        request.cleaning,
    )?;
    let split = split_chronological(prepared, request.test_fraction, request.val_fraction)?;

    let version = store.next_version(dataset)?;
    let metadata = build_metadata(request, &table, format, &source_hash, version, &split)?;

    let window_size = request.window_size;
    let version_dir = store.materialize_with(dataset, &version, source, &metadata, |dir| {
        SnapshotStore::write_tensors(dir, &split, window_size)
    })?;
    store.merge_global_metadata(dataset, &metadata)?;

    info!(
        dataset,
        %version,
        rows = metadata.rows,
        train = metadata.split_sizes.train,
        val = metadata.split_sizes.val,
        test = metadata.split_sizes.test,
        "Dataset version created"
    );

    Ok(IngestOutcome {
        dataset: dataset.to_string(),
        version,
        version_dir,
        created: true,
    })
}

fn require_column(table: &Table, name: &str) -> Result<usize> {
    table.column_index(name).ok_or_else(|| {
        DatasetError::Configuration(format!(
            "column '{name}' not found; available: {}",
            table.columns.join(", ")
        ))
    })
}

fn build_metadata(
    request: &IngestRequest,
    table: &Table,
    format: SourceFormat,
    source_hash: &str,
    version: DatasetVersion,
    split: &crate::features::SplitTensorSet,
) -> Result<VersionMetadata> {
    let source = request.source.as_path();
    let file_meta = fs::metadata(source).map_err(|e| DatasetError::io(source, e))?;
    let last_modified = file_meta
        .modified()
        .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| "N/A".to_string());
    let today = Local::now().format("%Y-%m-%d").to_string();
    let change_description = if version == crate::version::INITIAL_VERSION {
        "Initial dataset setup.".to_string()
    } else {
        "Updated dataset version.".to_string()
    };
    let coverage = stats::time_coverage(table, &request.date_column);

    let entry = VersionEntry {
        version: version.to_string(),
        date: today.clone(),
        changes: change_description.clone(),
        author: request.author.clone(),
    };

    Ok(VersionMetadata {
        id: request.dataset.clone(),
        name: request.dataset.clone(),
        data_type: request.data_type,
        version,
        created_date: today,
        author: request.author.clone(),
        change_description,
        description: request.description.clone(),
        tags: request.tags.clone(),
        size: file_meta.len(),
        last_modified,
        rows: table.len(),
        columns: table.column_count(),
        format: format.label().to_string(),
        source_file: file_name(source),
        source_hash: source_hash.to_string(),
        date_column: request.date_column.clone(),
        target_column: request.target_column.clone(),
        window_size: request.window_size,
        status: "completed".to_string(),
        progress: 100,
        features: stats::features(table),
        statistics: stats::statistics(table),
        quality: stats::quality(table),
        split_sizes: SplitSizes {
            train: split.y_train.len(),
            val: split.y_val.len(),
            test: split.y_test.len(),
            holdout: request.window_size,
        },
        columns_list: table.columns.clone(),
        time_range: coverage.time_range,
        sample_rate: coverage.sample_rate,
        data: serialize_for_storage(table.head(PREVIEW_ROWS)),
        versions: vec![entry],
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_series(path: &Path, rows: usize, offset: f64) {
        let mut file = fs::File::create(path).unwrap();
        writeln!(file, "date,load").unwrap();
        for i in 0..rows {
            let day = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
                + chrono::Duration::days(i as i64);
            writeln!(file, "{day},{}", (i as f64).sin() + offset).unwrap();
        }
    }

    #[test]
    fn test_missing_target_column_is_configuration_error() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("load.csv");
        write_series(&source, 30, 5.0);

        let store = SnapshotStore::untracked(dir.path().join("store"));
        let request = IngestRequest::new("load", &source, "date", "power", 5);
        let err = ingest_timeseries(&store, &request).unwrap_err();
        assert!(matches!(err, DatasetError::Configuration(_)));
        assert!(store.list_versions("load").unwrap().is_empty());
    }

    #[test]
    fn test_image_data_type_rejected() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("load.csv");
        write_series(&source, 30, 5.0);

        let store = SnapshotStore::untracked(dir.path().join("store"));
        let mut request = IngestRequest::new("load", &source, "date", "load", 5);
        request.data_type = DataType::Image;
        assert!(matches!(
            ingest_timeseries(&store, &request),
            Err(DatasetError::Configuration(_))
        ));
    }

    #[test]
    fn test_changed_source_creates_next_version() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("load.csv");
        let store = SnapshotStore::untracked(dir.path().join("store"));

        write_series(&source, 40, 5.0);
        let request = IngestRequest::new("load", &source, "date", "load", 5);
        let first = ingest_timeseries(&store, &request).unwrap();

        write_series(&source, 41, 5.0);
        let second = ingest_timeseries(&store, &request).unwrap();

        assert!(first.created && second.created);
        assert_eq!(first.version.to_string(), "1.0.0");
        assert_eq!(second.version.to_string(), "1.0.1");

        let global: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(store.global_metadata_path("load")).unwrap(),
        )
        .unwrap();
        assert_eq!(global["versions"].as_array().unwrap().len(), 2);
        assert_eq!(global["version"], "1.0.1");
        assert_eq!(global["rows"], 41);
    }
}
