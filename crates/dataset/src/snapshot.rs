//! Filesystem-backed store of immutable dataset versions.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<dataset>/
//!   metadata_<dataset>.json
//!   versions/<major.minor.patch>/
//!     metadata_<dataset>_<version>.json
//!     <original file>
//!     X_train.npy X_val.npy X_test.npy y_train.npy y_val.npy y_test.npy
//!     scaler.json
//! ```
//!
//! A version folder counts as complete only once its metadata document
//! exists; the document is always the last file written.

use crate::errors::{DatasetError, Result};
use crate::features::{MinMaxScaler, SplitBoundaries, SplitTensorSet};
use crate::metadata::{self, load_version_metadata, version_metadata_path, VersionMetadata};
use crate::npy;
use crate::serialize::write_storage_json;
use crate::tracking::{track_best_effort, DataTracker, NoopTracker};
use crate::version::{self, DatasetVersion};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const VERSIONS_DIR: &str = "versions";
pub const SCALER_FILE: &str = "scaler.json";

/// Names of the six split tensor files.
pub const TENSOR_FILES: [&str; 6] = [
    "X_train.npy",
    "X_val.npy",
    "X_test.npy",
    "y_train.npy",
    "y_val.npy",
    "y_test.npy",
];

const HASH_CHUNK: usize = 8192;

/// blake3 digest of a file, hex encoded.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buf).map_err(|e| DatasetError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Store of dataset versions rooted at one directory.
#[derive(Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    tracker: Arc<dyn DataTracker>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("root", &self.root)
            .field("tracker", &self.tracker.name())
            .finish()
    }
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, tracker: Arc<dyn DataTracker>) -> Self {
        Self {
            root: root.into(),
            tracker,
        }
    }

    /// Store without a data-versioning tool.
    pub fn untracked(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(NoopTracker))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_root(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    pub fn versions_dir(&self, dataset: &str) -> PathBuf {
        self.dataset_root(dataset).join(VERSIONS_DIR)
    }

    pub fn version_dir(&self, dataset: &str, version: &DatasetVersion) -> PathBuf {
        self.versions_dir(dataset).join(version.to_string())
    }

    pub fn global_metadata_path(&self, dataset: &str) -> PathBuf {
        self.dataset_root(dataset)
            .join(metadata::global_metadata_file_name(dataset))
    }

    /// Names of every folder under `versions/`, well-formed or not.
    fn version_folder_names(&self, dataset: &str) -> Result<Vec<String>> {
        let dir = self.versions_dir(dataset);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| DatasetError::io(&dir, e))? {
            let entry = entry.map_err(|e| DatasetError::io(&dir, e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// All version folders in ascending order, complete or not.
    pub fn list_versions(&self, dataset: &str) -> Result<Vec<DatasetVersion>> {
        let mut versions = version::parse_versions(self.version_folder_names(dataset)?);
        versions.sort();
        Ok(versions)
    }

    pub fn is_complete(&self, dataset: &str, version: &DatasetVersion) -> bool {
        version_metadata_path(&self.version_dir(dataset, version), dataset, version).is_file()
    }

    /// Version the next snapshot of `dataset` will receive. Incomplete
    /// folders count, so a half-written version string is never reused.
    pub fn next_version(&self, dataset: &str) -> Result<DatasetVersion> {
        Ok(version::next_version(self.version_folder_names(dataset)?))
    }

    /// Greatest version folder present, or the `1.0.0` sentinel.
    pub fn latest_version(&self, dataset: &str) -> Result<DatasetVersion> {
        Ok(version::latest_version(self.version_folder_names(dataset)?))
    }

    /// Greatest version whose metadata document exists.
    pub fn latest_complete_version(&self, dataset: &str) -> Result<Option<DatasetVersion>> {
        Ok(self
            .list_versions(dataset)?
            .into_iter()
            .rev()
            .find(|v| self.is_complete(dataset, v)))
    }

    /// Create `versions/<version>/` with a copy of `source` and its metadata.
    ///
    /// An existing version folder is returned untouched.
    pub fn materialize_version(
        &self,
        dataset: &str,
        version: &DatasetVersion,
        source: &Path,
        metadata: &VersionMetadata,
    ) -> Result<PathBuf> {
        self.materialize_with(dataset, version, source, metadata, |_| Ok(Vec::new()))
    }

    /// Like [`Self::materialize_version`], with `write_artifacts` called after
    /// the source copy and before the metadata document. It returns the
    /// files it wrote so they can be tracked.
    pub fn materialize_with<F>(
        &self,
        dataset: &str,
        version: &DatasetVersion,
        source: &Path,
        metadata: &VersionMetadata,
        write_artifacts: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<Vec<PathBuf>>,
    {
        let dir = self.version_dir(dataset, version);
        if dir.exists() {
            info!(
                dataset,
                %version,
                path = %dir.display(),
                "Version already materialized"
            );
            return Ok(dir);
        }

        if !source.is_file() {
            return Err(DatasetError::ArtifactNotFound(source.to_path_buf()));
        }
        crate::table::SourceFormat::from_path(source)?;
        let file_name = source
            .file_name()
            .ok_or_else(|| DatasetError::Configuration(format!(
                "source path has no file name: {}",
                source.display()
            )))?;

        fs::create_dir_all(&dir).map_err(|e| DatasetError::io(&dir, e))?;
        let copied = dir.join(file_name);
        fs::copy(source, &copied).map_err(|e| DatasetError::io(&copied, e))?;

        let mut written = vec![copied];
        written.extend(write_artifacts(&dir)?);

        let meta_path = version_metadata_path(&dir, dataset, version);
        write_storage_json(&meta_path, metadata)?;
        written.push(meta_path);

        track_best_effort(self.tracker.as_ref(), &self.dataset_root(dataset), &written);
        info!(dataset, %version, path = %dir.display(), "Version materialized");
        Ok(dir)
    }

    /// Merge a version document into the dataset-level aggregate.
    pub fn merge_global_metadata(&self, dataset: &str, metadata: &VersionMetadata) -> Result<Value> {
        let root = self.dataset_root(dataset);
        let document = metadata::merge_global_metadata(&root, dataset, metadata)?;
        track_best_effort(
            self.tracker.as_ref(),
            &root,
            &[self.global_metadata_path(dataset)],
        );
        Ok(document)
    }

    pub fn load_version_metadata(
        &self,
        dataset: &str,
        version: &DatasetVersion,
    ) -> Result<VersionMetadata> {
        load_version_metadata(&version_metadata_path(
            &self.version_dir(dataset, version),
            dataset,
            version,
        ))
    }

    /// Write split tensors and the fitted scaler into `dir`.
    pub fn write_tensors(dir: &Path, set: &SplitTensorSet, window_size: usize) -> Result<Vec<PathBuf>> {
        let [xtr, xva, xte, ytr, yva, yte] = TENSOR_FILES.map(|name| dir.join(name));

        npy::write_matrix(&xtr, &set.x_train, window_size)?;
        npy::write_matrix(&xva, &set.x_val, window_size)?;
        npy::write_matrix(&xte, &set.x_test, window_size)?;
        npy::write_vector(&ytr, &set.y_train)?;
        npy::write_vector(&yva, &set.y_val)?;
        npy::write_vector(&yte, &set.y_test)?;

        let scaler_path = dir.join(SCALER_FILE);
        write_storage_json(&scaler_path, &set.scaler)?;

        debug!(dir = %dir.display(), "Split tensors written");
        Ok(vec![xtr, xva, xte, ytr, yva, yte, scaler_path])
    }

    pub fn load_scaler(&self, dataset: &str, version: &DatasetVersion) -> Result<MinMaxScaler> {
        let path = self.version_dir(dataset, version).join(SCALER_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DatasetError::ArtifactNotFound(path.clone())
            } else {
                DatasetError::io(&path, e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| DatasetError::MetadataCorruption {
            path,
            reason: e.to_string(),
        })
    }

    /// Load the split tensors of a complete version.
    pub fn load_tensors(&self, dataset: &str, version: &DatasetVersion) -> Result<SplitTensorSet> {
        if !self.is_complete(dataset, version) {
            return Err(DatasetError::ArtifactNotFound(self.version_dir(dataset, version)));
        }

        let dir = self.version_dir(dataset, version);
        let x_train = npy::read_matrix(&dir.join(TENSOR_FILES[0]))?;
        let x_val = npy::read_matrix(&dir.join(TENSOR_FILES[1]))?;
        let x_test = npy::read_matrix(&dir.join(TENSOR_FILES[2]))?;
        let y_train = npy::read_vector(&dir.join(TENSOR_FILES[3]))?;
        let y_val = npy::read_vector(&dir.join(TENSOR_FILES[4]))?;
        let y_test = npy::read_vector(&dir.join(TENSOR_FILES[5]))?;
        let scaler = self.load_scaler(dataset, version)?;

        let (a, b, c) = (y_train.len(), y_val.len(), y_test.len());
        Ok(SplitTensorSet {
            x_train,
            x_val,
            x_test,
            y_train,
            y_val,
            y_test,
            scaler,
            boundaries: SplitBoundaries {
                train: 0..a,
                val: a..a + b,
                test: a + b..a + b + c,
            },
        })
    }
}
