//! Model registration for trained artifacts.
//!
//! Wraps an experiment tracker (MLflow over REST, or a local JSON file) with
//! content-hash gated registration, version resolution and run naming.

pub mod errors;
pub mod hash;
pub mod local;
pub mod manager;
pub mod mlflow;
pub mod model_meta;
pub mod resources;
pub mod tracker;
pub mod train_info;
pub mod types;

pub use errors::{RegistryError, Result};
pub use hash::content_hash;
pub use local::LocalTracker;
pub use manager::{
    model_uri, registry_name, ModelRegistryManager, RegistrationOutcome, RegistrationRequest,
};
pub use mlflow::MlflowTracker;
pub use model_meta::{DatasetLineage, Framework, ModelMetadata};
pub use resources::ResourceSnapshot;
pub use tracker::ExperimentTracker;
pub use train_info::{split_ratio_label, ModelTrainInfo};
pub use types::{
    Experiment, ModelStage, RegisteredModel, RegisteredModelVersion, RunInfo, RunStatus,
};
