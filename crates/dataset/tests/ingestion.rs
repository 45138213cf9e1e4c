use mlops_dataset::{
    ingest_timeseries, merge_global_metadata, npy, prepare_signal, snapshot::TENSOR_FILES,
    CleaningPolicy, DatasetError, IngestRequest, SnapshotStore,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_csv(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("energy.csv");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "timestamp,consumption,region").unwrap();
    let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    // written newest first to exercise sorting
    for i in (0..rows).rev() {
        let ts = start + chrono::Duration::hours(i as i64);
        let region = if i % 3 == 0 { "north" } else { "south" };
        writeln!(
            file,
            "{},{},{}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            100.0 + (i as f64 / 7.0).sin() * 20.0,
            region
        )
        .unwrap();
    }
    path
}

fn setup(rows: usize) -> (TempDir, SnapshotStore, IngestRequest) {
    let dir = TempDir::new().unwrap();
    let source = write_csv(dir.path(), rows);
    let store = SnapshotStore::untracked(dir.path().join("datasets"));
    let request = IngestRequest::new("energy", source, "timestamp", "consumption", 10);
    (dir, store, request)
}

#[test]
fn fresh_ingestion_creates_first_version() {
    let (_dir, store, request) = setup(500);
    let outcome = ingest_timeseries(&store, &request).unwrap();

    assert!(outcome.created);
    assert_eq!(outcome.version.to_string(), "1.0.0");
    assert!(outcome.version_dir.ends_with("energy/versions/1.0.0"));

    let npy_count = fs::read_dir(&outcome.version_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |x| x == "npy"))
        .count();
    assert_eq!(npy_count, 6);
    assert!(outcome.version_dir.join("scaler.json").is_file());
    assert!(outcome.version_dir.join("energy.csv").is_file());

    let meta = store.load_version_metadata("energy", &outcome.version).unwrap();
    assert_eq!(meta.rows, 500);
    assert_eq!(meta.columns, 3);
    assert_eq!(meta.format, "CSV/TXT");
    assert_eq!(meta.split_sizes.train, 343);
    assert_eq!(meta.split_sizes.val, 49);
    assert_eq!(meta.split_sizes.test, 98);
    assert_eq!(meta.split_sizes.holdout, 10);
    assert_eq!(meta.time_range, "2024-01-01 00:00:00 ~ 2024-01-21 19:00:00");
    assert_eq!(meta.sample_rate, "0 days 01:00:00");
    assert_eq!(meta.data.as_array().unwrap().len(), 50);
    assert_eq!(meta.data[0]["timestamp"], "2024-01-01 00:00:00");

    let raw = fs::read_to_string(store.global_metadata_path("energy")).unwrap();
    let global: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(global["versions"][0]["version"], "1.0.0");
}

#[test]
fn repeated_ingestion_of_unchanged_source_reuses_version() {
    let (_dir, store, request) = setup(120);
    let first = ingest_timeseries(&store, &request).unwrap();
    let second = ingest_timeseries(&store, &request).unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.version_dir, second.version_dir);
    assert_eq!(store.list_versions("energy").unwrap().len(), 1);
}

#[test]
fn stored_tensors_load_back_in_order() {
    let (_dir, store, request) = setup(200);
    let outcome = ingest_timeseries(&store, &request).unwrap();
    let set = store.load_tensors("energy", &outcome.version).unwrap();

    assert_eq!(set.x_train.len(), set.y_train.len());
    assert_eq!(set.x_train.len() + set.x_val.len() + set.x_test.len(), 190);
    assert!(set.x_train.iter().all(|row| row.len() == 10));
    assert!(set
        .y_train
        .iter()
        .chain(&set.y_val)
        .chain(&set.y_test)
        .all(|v| (0.0..=1.0).contains(v)));

    // each target is the last element of the following window
    assert_eq!(set.y_train[0], set.x_train[1][9]);

    let y_test = npy::read_vector(&outcome.version_dir.join(TENSOR_FILES[5])).unwrap();
    assert_eq!(y_test, set.y_test);
}

#[test]
fn too_few_rows_is_insufficient_data() {
    let (_dir, store, request) = setup(5);
    let err = ingest_timeseries(&store, &request).unwrap_err();
    assert!(err.is_insufficient_data());
    assert!(store.list_versions("energy").unwrap().is_empty());
}

#[test]
fn short_signal_is_insufficient_data() {
    let signal: Vec<Option<f64>> = (0..5).map(|v| Some(v as f64)).collect();
    let err = prepare_signal(&signal, "x", 10, CleaningPolicy::default()).unwrap_err();
    assert!(matches!(
        err,
        DatasetError::InsufficientData {
            required: 11,
            available: 5
        }
    ));
}

#[test]
fn malformed_global_metadata_blocks_merge() {
    let (_dir, store, request) = setup(60);
    let outcome = ingest_timeseries(&store, &request).unwrap();
    let meta = store.load_version_metadata("energy", &outcome.version).unwrap();

    let global_path = store.global_metadata_path("energy");
    fs::write(&global_path, "{\"versions\": [").unwrap();

    let err = merge_global_metadata(&store.dataset_root("energy"), "energy", &meta).unwrap_err();
    assert!(matches!(err, DatasetError::MetadataCorruption { .. }));
    assert_eq!(fs::read_to_string(&global_path).unwrap(), "{\"versions\": [");
}

#[test]
fn unsupported_source_format() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("energy.parquet");
    fs::write(&source, b"PAR1").unwrap();
    let store = SnapshotStore::untracked(dir.path().join("datasets"));
    let request = IngestRequest::new("energy", source, "timestamp", "consumption", 10);

    assert!(matches!(
        ingest_timeseries(&store, &request),
        Err(DatasetError::UnsupportedFormat(_))
    ));
}
