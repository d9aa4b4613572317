//! Process settings loaded from the environment (and an optional `.env`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_EXPERIMENT: &str = "model-hyperopt";
pub const DEFAULT_METRIC: &str = "val_mse";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Where Hyperlift finds its external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// MLflow-compatible tracking server. When unset the filesystem store
    /// under `tracking_dir` is used.
    pub tracking_uri: Option<String>,
    pub tracking_dir: PathBuf,
    /// Root directory holding one sub-directory per artifact bucket.
    pub artifact_root: PathBuf,
    /// Local scratch space for downloaded model artifacts.
    pub scratch_dir: PathBuf,
    pub region: String,
    pub experiment_name: String,
    pub metric_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking_uri: None,
            tracking_dir: PathBuf::from("./mlruns"),
            artifact_root: PathBuf::from("./buckets"),
            scratch_dir: PathBuf::from("./model_artifacts"),
            region: DEFAULT_REGION.to_string(),
            experiment_name: DEFAULT_EXPERIMENT.to_string(),
            metric_name: DEFAULT_METRIC.to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from environment variables.
    ///
    /// Recognized variables:
    /// - `MLFLOW_TRACKING_URI`: remote tracking server (http/https only)
    /// - `HYPERLIFT_TRACKING_DIR`: filesystem tracking store (default `./mlruns`)
    /// - `HYPERLIFT_ARTIFACT_ROOT`: bucket root directory (default `./buckets`)
    /// - `HYPERLIFT_SCRATCH_DIR`: download scratch directory
    /// - `AWS_DEFAULT_REGION`: bucket region (default `us-east-1`)
    /// - `HYPERLIFT_EXPERIMENT`, `HYPERLIFT_METRIC`
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tracking_uri = non_empty("MLFLOW_TRACKING_URI")
            .filter(|uri| uri.starts_with("http://") || uri.starts_with("https://"));

        Self {
            tracking_uri,
            tracking_dir: non_empty("HYPERLIFT_TRACKING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.tracking_dir),
            artifact_root: non_empty("HYPERLIFT_ARTIFACT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_root),
            scratch_dir: non_empty("HYPERLIFT_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            region: non_empty("AWS_DEFAULT_REGION").unwrap_or(defaults.region),
            experiment_name: non_empty("HYPERLIFT_EXPERIMENT").unwrap_or(defaults.experiment_name),
            metric_name: non_empty("HYPERLIFT_METRIC").unwrap_or(defaults.metric_name),
        }
    }
}
