//! Batch scoring with the latest registered model.

use hl_data::{PredictionTable, Split, SplitLoader};
use hl_engine::latest_version;
use hl_tracking::ModelRegistry;
use hl_types::{HlResult, DEFAULT_REGION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::store::ArtifactStore;

/// Scores a test split and uploads the predictions as Parquet.
pub struct ModelApplier {
    registry: Arc<dyn ModelRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    region: String,
    scratch_dir: PathBuf,
    target_column: Option<String>,
}

impl ModelApplier {
    pub fn new(registry: Arc<dyn ModelRegistry>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            artifacts,
            region: DEFAULT_REGION.to_string(),
            scratch_dir: PathBuf::from("model_artifacts"),
            target_column: None,
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

    pub fn with_target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = Some(column.into());
        self
    }

    /// Predict the `test` split under `test_data_path` with the latest
    /// version of `model_name` and upload `<run_id>.parquet` to `dest_bucket`.
    /// Returns the object's URI.
    pub async fn apply(
        &self,
        test_data_path: &Path,
        model_name: &str,
        dest_bucket: &str,
    ) -> HlResult<String> {
        let mut loader = SplitLoader::new(test_data_path);
        if let Some(column) = &self.target_column {
            loader = loader.with_target_column(column);
        }
        let dataset = loader.load(Split::Test)?;

        let version = latest_version(self.registry.as_ref(), model_name).await?;
        let model_uri = version.model_uri();
        let model = self
            .registry
            .load_model(
                &model_uri.to_string(),
                &self.scratch_dir.join(model_uri.flattened()),
            )
            .await?;

        let predictions = model.predict(&dataset.features)?;
        let table = PredictionTable::new(&dataset, &predictions.to_vec(), &version.run_id)?;
        let parquet = table.to_parquet_bytes()?;

        self.artifacts
            .ensure_bucket(dest_bucket, &self.region)
            .await?;
        let key = format!("{}.parquet", version.run_id);
        self.artifacts.put_object(dest_bucket, &key, parquet).await?;

        let output = self.artifacts.location(dest_bucket, &key);
        info!(
            model_uri = %model_uri,
            rows = table.len(),
            output = %output,
            "Wrote predictions"
        );
        Ok(output)
    }
}

impl std::fmt::Debug for ModelApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelApplier")
            .field("region", &self.region)
            .field("scratch_dir", &self.scratch_dir)
            .field("target_column", &self.target_column)
            .finish()
    }
}
