//! # hl-tracking
//!
//! Experiment tracking and model registry access for Hyperlift.
//!
//! Defines the [`TrackingStore`] and [`ModelRegistry`] traits with two
//! implementations: a filesystem-backed store for local work and tests, and a
//! REST client for an MLflow tracking server.

mod local;
mod mlflow;
mod store;
mod types;

pub use local::LocalTrackingStore;
pub use mlflow::MlflowClient;
pub use store::{ModelRegistry, TrackingStore};
pub use types::{
    runs_uri, Experiment, ModelUri, ModelVersion, Run, RunInfo, RunSearch, RunStatus,
};
