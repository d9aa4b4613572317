//! Persists completed trials as tracking runs.

use hl_models::{save_model, Regressor};
use hl_types::{Configuration, ExternalServiceError, HlResult, Service, TrialArtifact};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use hl_tracking::{RunStatus, TrackingStore};

/// Tag holding the model family of a run.
pub const MODEL_TAG: &str = "model";

/// Writes one run per completed trial.
#[derive(Clone)]
pub struct TrialRecorder {
    store: Arc<dyn TrackingStore>,
    experiment_id: String,
    metric_name: String,
    scratch_root: PathBuf,
}

impl TrialRecorder {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        experiment_id: impl Into<String>,
        metric_name: impl Into<String>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            experiment_id: experiment_id.into(),
            metric_name: metric_name.into(),
            scratch_root: scratch_root.into(),
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Record a trial and return its run id. If any step fails the run is
    /// closed as failed and the error is returned. The loss metric is
    /// written after the model.
    pub async fn record(
        &self,
        configuration: &Configuration,
        loss: f64,
        artifacts: &[TrialArtifact],
        model: &dyn Regressor,
    ) -> HlResult<String> {
        let run = self.store.start_run(&self.experiment_id).await?;
        let run_id = run.run_id;

        match self
            .log_trial(&run_id, configuration, loss, artifacts, model)
            .await
        {
            Ok(()) => {
                self.store.end_run(&run_id, RunStatus::Finished).await?;
                debug!(run_id = %run_id, loss, "Recorded trial");
                Ok(run_id)
            }
            Err(e) => {
                if let Err(close_err) = self.store.end_run(&run_id, RunStatus::Failed).await {
                    warn!(run_id = %run_id, error = %close_err, "Could not mark run as failed");
                }
                Err(e)
            }
        }
    }

    async fn log_trial(
        &self,
        run_id: &str,
        configuration: &Configuration,
        loss: f64,
        artifacts: &[TrialArtifact],
        model: &dyn Regressor,
    ) -> HlResult<()> {
        let family = model.family();
        self.store
            .set_tag(run_id, MODEL_TAG, family.as_str())
            .await?;
        self.store
            .log_params(run_id, &configuration.to_logged_params())
            .await?;

        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(|e| ExternalServiceError::call(Service::Filesystem, "record_trial", e))?;
        let scratch = tempfile::Builder::new()
            .prefix("trial-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| ExternalServiceError::call(Service::Filesystem, "record_trial", e))?;

        for artifact in artifacts {
            let path = scratch.path().join(&artifact.file_name);
            tokio::fs::write(&path, serde_json::to_vec_pretty(artifact)?).await?;
            self.store.log_artifact(run_id, &path, None).await?;
        }

        let model_dir = scratch.path().join(family.model_artifact_path());
        save_model(model, &model_dir, Some(run_id))?;
        self.store
            .log_model(run_id, &model_dir, family.model_artifact_path())
            .await?;

        // A run with a metric always has its model.
        self.store
            .log_metric(run_id, &self.metric_name, loss)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for TrialRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialRecorder")
            .field("experiment_id", &self.experiment_id)
            .field("metric_name", &self.metric_name)
            .field("scratch_root", &self.scratch_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hl_models::{ModelSpec, RidgeParams};
    use hl_tracking::{LocalTrackingStore, RunSearch};
    use hl_types::{HlError, ParameterValue};
    use ndarray::array;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_tag_params_metric_artifacts_and_model() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalTrackingStore::open(dir.path().join("mlruns")).await.unwrap());
        let experiment = store.get_or_create_experiment("model-hyperopt").await.unwrap();
        let recorder = TrialRecorder::new(
            store.clone(),
            &experiment.experiment_id,
            "val_mse",
            dir.path().join("scratch"),
        );

        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), ParameterValue::Float(0.5));
        params.insert("random_state".to_string(), ParameterValue::Int(42));
        let config = Configuration::new("Ridge", params);

        let mut model = ModelSpec::Ridge(RidgeParams {
            alpha: 0.5,
            random_state: 42,
        })
        .build();
        model
            .fit(&array![[1.0], [2.0], [3.0]], &array![2.0, 4.0, 6.0])
            .unwrap();
        let artifact = model.interpretability(&["distance".to_string()]).unwrap();

        let run_id = recorder
            .record(&config, 1.25, &[artifact], model.as_ref())
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.tags[MODEL_TAG], "Ridge");
        assert_eq!(run.params["type"], "Ridge");
        assert_eq!(run.params["random_state"], "42");
        assert_eq!(run.metric("val_mse"), Some(1.25));

        let artifacts = store.artifact_dir(&run_id).await.unwrap();
        assert!(artifacts.join("ridge_coefficients.json").exists());
        assert!(artifacts.join("ridge_model/MLmodel").exists());
        assert!(artifacts.join("ridge_model/model.json").exists());

        let reloaded = hl_models::load_model(&artifacts.join("ridge_model")).unwrap();
        let pred = reloaded.predict(&array![[4.0]]).unwrap();
        assert!((pred[0] - model.predict(&array![[4.0]]).unwrap()[0]).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unwritable_scratch_fails_the_run_without_a_metric() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalTrackingStore::open(dir.path().join("mlruns")).await.unwrap());
        let experiment = store.get_or_create_experiment("model-hyperopt").await.unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let recorder = TrialRecorder::new(
            store.clone(),
            &experiment.experiment_id,
            "val_mse",
            blocker.join("scratch"),
        );

        let mut model = ModelSpec::Ridge(RidgeParams {
            alpha: 0.5,
            random_state: 42,
        })
        .build();
        model
            .fit(&array![[1.0], [2.0], [3.0]], &array![2.0, 4.0, 6.0])
            .unwrap();
        let config = Configuration::new("Ridge", BTreeMap::new());

        let err = recorder
            .record(&config, 0.5, &[], model.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HlError::ExternalService(ExternalServiceError::CallFailed {
                service: Service::Filesystem,
                ..
            })
        ));

        let runs = store
            .search_runs(&RunSearch::in_experiment(&experiment.experiment_id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].info.status, RunStatus::Failed);
        assert_eq!(runs[0].metric("val_mse"), None);
    }
}
