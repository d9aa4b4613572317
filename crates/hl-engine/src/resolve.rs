//! Post-hoc lookup of the best run and its registered model.

use hl_tracking::{ModelRegistry, ModelVersion, Run, RunSearch, RunStatus, TrackingStore};
use hl_types::{ConfigurationError, HlResult, ModelFamily, ResolutionError, FAMILY_KEY};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::recorder::MODEL_TAG;

/// The best run of an experiment joined to its registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestModelReference {
    pub run_id: String,
    pub model_name: String,
    pub version: u64,
    pub loss: f64,
}

/// Lowest-`metric` run of `experiment` (earliest start wins ties).
pub async fn resolve_best_run(
    store: &dyn TrackingStore,
    experiment: &str,
    metric: &str,
) -> HlResult<Run> {
    let exp = store
        .get_experiment_by_name(experiment)
        .await?
        .ok_or_else(|| ResolutionError::ExperimentNotFound {
            name: experiment.to_string(),
        })?;

    let search = RunSearch::in_experiment(exp.experiment_id)
        .with_status(RunStatus::Finished)
        .order_by_metric(metric, true)
        .max_results(1);
    let best = store
        .search_runs(&search)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ResolutionError::NoRuns {
            experiment: experiment.to_string(),
            metric: metric.to_string(),
        })?;

    info!(
        experiment,
        run_id = best.run_id(),
        loss = best.metric(metric),
        "Resolved best run"
    );
    Ok(best)
}

/// Best run of `experiment` together with the `model_name` version registered
/// from it.
pub async fn resolve_best_model(
    store: &dyn TrackingStore,
    registry: &dyn ModelRegistry,
    experiment: &str,
    model_name: &str,
    metric: &str,
) -> HlResult<BestModelReference> {
    let best = resolve_best_run(store, experiment, metric).await?;
    let version = registry
        .search_model_versions(model_name)
        .await?
        .into_iter()
        .filter(|v| v.run_id == best.run_id())
        .max_by_key(|v| v.version)
        .ok_or_else(|| ResolutionError::NotRegistered {
            model: model_name.to_string(),
            run_id: best.run_id().to_string(),
        })?;

    Ok(BestModelReference {
        run_id: version.run_id,
        model_name: version.name,
        version: version.version,
        loss: best.metric(metric).unwrap_or(f64::NAN),
    })
}

/// Model family a run was recorded with, from its tag or its `type` param.
pub fn run_family(run: &Run) -> HlResult<ModelFamily> {
    let raw = run
        .tags
        .get(MODEL_TAG)
        .or_else(|| run.params.get(FAMILY_KEY))
        .ok_or_else(|| {
            ConfigurationError::Invalid(format!("run {} has no model family", run.run_id()))
        })?;
    Ok(raw.parse::<ModelFamily>()?)
}

/// Register the best run's model as the next version of `model_name`.
pub async fn register_best_run(
    store: &dyn TrackingStore,
    registry: &dyn ModelRegistry,
    experiment: &str,
    model_name: &str,
    metric: &str,
) -> HlResult<ModelVersion> {
    let best = resolve_best_run(store, experiment, metric).await?;
    let family = run_family(&best)?;
    registry
        .register_model(model_name, best.run_id(), family.model_artifact_path())
        .await
}

/// Numerically greatest version of `model_name`.
pub async fn latest_version(registry: &dyn ModelRegistry, model_name: &str) -> HlResult<ModelVersion> {
    let versions = registry.search_model_versions(model_name).await?;
    select_latest(versions).ok_or_else(|| {
        ResolutionError::NoModelVersions {
            model: model_name.to_string(),
        }
        .into()
    })
}

/// Highest version number wins, regardless of listing order.
pub fn select_latest(versions: Vec<ModelVersion>) -> Option<ModelVersion> {
    versions.into_iter().max_by_key(|v| v.version)
}
