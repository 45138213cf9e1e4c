//! Versioned dataset store for time-series training data.
//!
//! Datasets are stored as a sequence of immutable `major.minor.patch`
//! snapshots. Each snapshot holds the copied source file, chronological
//! train/validation/test windows, the fitted scaler and a metadata document;
//! a dataset-level document aggregates the version history.

pub mod errors;
pub mod features;
pub mod ingest;
pub mod metadata;
pub mod npy;
pub mod serialize;
pub mod snapshot;
pub mod stats;
pub mod table;
pub mod tracking;
pub mod version;

pub use errors::{DatasetError, Result};
pub use features::{
    prepare_sequences, prepare_signal, split_chronological, CleaningPolicy, MinMaxScaler,
    PreparedSequences, SplitBoundaries, SplitTensorSet,
};
pub use ingest::{ingest_timeseries, IngestOutcome, IngestRequest};
pub use metadata::{
    merge_global_metadata, DataType, SplitSizes, VersionEntry, VersionMetadata,
};
pub use serialize::{serialize_for_storage, StorageValue};
pub use snapshot::{fingerprint_file, SnapshotStore};
pub use table::{Cell, SourceFormat, Table};
pub use tracking::{DataTracker, DvcTracker, NoopTracker};
pub use version::{latest_version, next_version, DatasetVersion};
