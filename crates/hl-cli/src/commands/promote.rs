//! `hyperlift promote` and `hyperlift apply`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hl_promote::{ArtifactStore, LocalBucketStore, ModelApplier, ModelPromoter};
use hl_types::Settings;

use super::backends;

fn artifact_store(settings: &Settings) -> Arc<dyn ArtifactStore> {
    Arc::new(LocalBucketStore::new(settings.artifact_root.clone()))
}

pub async fn promote(settings: &Settings, model_name: &str, bucket: &str) -> Result<()> {
    let backends = backends(settings).await?;
    let promoter = ModelPromoter::new(backends.registry, artifact_store(settings), bucket)
        .with_region(settings.region.clone())
        .with_scratch_dir(settings.scratch_dir.clone());

    let destination = promoter
        .promote(model_name)
        .await
        .with_context(|| format!("Failed to promote '{model_name}' to bucket '{bucket}'"))?;
    println!("{destination}");
    Ok(())
}

pub async fn apply(
    settings: &Settings,
    test_data_path: &Path,
    model_name: &str,
    dest_bucket: &str,
    target_column: Option<String>,
) -> Result<()> {
    let backends = backends(settings).await?;
    let mut applier = ModelApplier::new(backends.registry, artifact_store(settings))
        .with_region(settings.region.clone())
        .with_scratch_dir(settings.scratch_dir.clone());
    if let Some(column) = target_column {
        applier = applier.with_target_column(column);
    }

    let output = applier
        .apply(test_data_path, model_name, dest_bucket)
        .await
        .with_context(|| format!("Failed to apply '{model_name}' to {}", test_data_path.display()))?;
    println!("{output}");
    Ok(())
}
