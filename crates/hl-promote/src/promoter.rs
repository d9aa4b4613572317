//! Republishes the latest registered model version to an artifact bucket.

use hl_engine::latest_version;
use hl_tracking::ModelRegistry;
use hl_types::{ExternalServiceError, HlResult, Service, DEFAULT_REGION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::store::ArtifactStore;

/// Copies `models:/<name>/<latest>` into `<bucket>/models/<name>/<version>/artifacts`.
pub struct ModelPromoter {
    registry: Arc<dyn ModelRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    bucket: String,
    region: String,
    scratch_dir: PathBuf,
}

impl ModelPromoter {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            artifacts,
            bucket: bucket.into(),
            region: DEFAULT_REGION.to_string(),
            scratch_dir: PathBuf::from("model_artifacts"),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Promote the numerically greatest version of `model_name` and return
    /// the destination URI. Promoting the same version again overwrites the
    /// same objects.
    pub async fn promote(&self, model_name: &str) -> HlResult<String> {
        let version = latest_version(self.registry.as_ref(), model_name).await?;
        let model_uri = version.model_uri();
        info!(model_uri = %model_uri, run_id = %version.run_id, "Promoting model version");

        let local_dir = self.scratch_dir.join(model_uri.flattened());
        let local_dir = self
            .registry
            .download_artifacts(&model_uri.to_string(), &local_dir)
            .await?;

        self.artifacts
            .ensure_bucket(&self.bucket, &self.region)
            .await?;

        let prefix = destination_prefix(model_name, version.version);
        let uploaded = self.upload_dir(&local_dir, &prefix).await?;

        let destination = self.artifacts.location(&self.bucket, &prefix);
        info!(destination = %destination, files = uploaded, "Model promoted");
        Ok(destination)
    }

    async fn upload_dir(&self, local_dir: &Path, prefix: &str) -> HlResult<usize> {
        let files = list_files(local_dir)?;
        for (path, relative) in &files {
            let key = format!("{prefix}/{relative}");
            debug!(file = %path.display(), key = %key, "Uploading artifact");
            self.artifacts.upload_file(path, &self.bucket, &key).await?;
        }
        Ok(files.len())
    }
}

impl std::fmt::Debug for ModelPromoter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPromoter")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

/// Key prefix a promoted version lives under.
pub fn destination_prefix(model_name: &str, version: u64) -> String {
    format!("models/{model_name}/{version}/artifacts")
}

/// Every regular file under `root` with its `/`-joined path relative to it.
fn list_files(root: &Path) -> HlResult<Vec<(PathBuf, String)>> {
    let walk_error = |e: walkdir::Error| ExternalServiceError::call(Service::Filesystem, "list_files", e);
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ExternalServiceError::call(Service::Filesystem, "list_files", e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.into_path(), relative));
    }
    Ok(files)
}
