//! Tracking and registry abstractions.
//!
//! Implementations may talk to an MLflow server over REST (see
//! [`crate::MlflowClient`]) or keep everything on the local filesystem (see
//! [`crate::LocalTrackingStore`]).

use async_trait::async_trait;
use hl_models::Regressor;
use hl_types::HlResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{Experiment, ModelVersion, Run, RunInfo, RunSearch, RunStatus};

/// Experiment and run bookkeeping.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Look up an experiment by name, creating it if absent.
    async fn get_or_create_experiment(&self, name: &str) -> HlResult<Experiment>;

    async fn get_experiment_by_name(&self, name: &str) -> HlResult<Option<Experiment>>;

    /// Open a new run in `experiment_id`.
    async fn start_run(&self, experiment_id: &str) -> HlResult<RunInfo>;

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HlResult<()>;

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> HlResult<()>;

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> HlResult<()>;

    /// Upload a single file under the run's artifact root, optionally inside
    /// `artifact_dir`.
    async fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> HlResult<()>;

    /// Upload every file of a saved model directory under `artifact_path`.
    async fn log_model(&self, run_id: &str, model_dir: &Path, artifact_path: &str)
        -> HlResult<()>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> HlResult<()>;

    async fn get_run(&self, run_id: &str) -> HlResult<Run>;

    async fn search_runs(&self, search: &RunSearch) -> HlResult<Vec<Run>>;
}

/// Named, versioned models pointing back at run artifacts.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Every version registered under `name` (any order).
    async fn search_model_versions(&self, name: &str) -> HlResult<Vec<ModelVersion>>;

    /// Register the model logged at `artifact_path` in `run_id` as the next
    /// version of `name`.
    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> HlResult<ModelVersion>;

    /// Copy the files behind `model_uri` into `dst`, returning the directory
    /// that holds them.
    async fn download_artifacts(&self, model_uri: &str, dst: &Path) -> HlResult<PathBuf>;

    /// Download `model_uri` into `scratch` and deserialize it.
    async fn load_model(&self, model_uri: &str, scratch: &Path) -> HlResult<Box<dyn Regressor>> {
        let dir = self.download_artifacts(model_uri, scratch).await?;
        hl_models::load_model(&dir)
    }
}
