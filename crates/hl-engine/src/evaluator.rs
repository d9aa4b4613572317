//! Trains and scores one configuration.

use async_trait::async_trait;
use hl_models::{mean_squared_error, ModelSpec, Regressor};
use hl_optimizer::{Objective, TrialOutcome};
use hl_types::{Configuration, Dataset, HlResult};
use tracing::{debug, info};

use crate::recorder::TrialRecorder;

/// [`Objective`] that fits the configured model on the training split, scores
/// it on the validation split and records the trial.
#[derive(Debug)]
pub struct ObjectiveEvaluator {
    train: Dataset,
    validation: Dataset,
    recorder: Option<TrialRecorder>,
}

impl ObjectiveEvaluator {
    pub fn new(train: Dataset, validation: Dataset) -> Self {
        Self {
            train,
            validation,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: TrialRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Fit and score without recording. Returns the outcome (validation loss
    /// plus interpretability artifacts) and the fitted model.
    pub fn train_and_score(
        &self,
        config: &Configuration,
    ) -> HlResult<(TrialOutcome, Box<dyn Regressor>)> {
        let spec = ModelSpec::try_from(config)?;
        let family = spec.family();
        let mut model = spec.build();

        model.fit(&self.train.features, &self.train.targets)?;
        let predictions = model.predict(&self.validation.features)?;
        let loss = mean_squared_error(&self.validation.targets, &predictions)?;

        let mut outcome = TrialOutcome::new(loss);
        if let Some(artifact) = model.interpretability(&self.train.feature_names) {
            outcome = outcome.with_artifact(artifact);
        }
        debug!(family = %family, loss, "Scored configuration");
        Ok((outcome, model))
    }
}

#[async_trait]
impl Objective for ObjectiveEvaluator {
    async fn evaluate(&mut self, trial_number: usize, config: &Configuration) -> HlResult<TrialOutcome> {
        let (mut outcome, model) = self.train_and_score(config)?;

        if let Some(recorder) = &self.recorder {
            let run_id = recorder
                .record(config, outcome.loss, &outcome.artifacts, model.as_ref())
                .await?;
            outcome = outcome.with_run_id(run_id);
        }
        info!(
            trial = trial_number,
            configuration = %config,
            loss = outcome.loss,
            "Evaluated configuration"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hl_tracking::{LocalTrackingStore, RunSearch, TrackingStore};
    use hl_types::{ConfigurationError, HlError, ParameterValue, TrainingError};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn linear_dataset(n: usize, offset: f64) -> Dataset {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let x = i as f64 + offset;
                vec![x, (x * 0.7).sin()]
            })
            .collect();
        let targets = rows.iter().map(|r| 2.0 * r[0] - r[1] + 1.0).collect();
        Dataset::from_rows(vec!["distance".into(), "hour".into()], rows, targets).unwrap()
    }

    fn ridge(alpha: f64) -> Configuration {
        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), ParameterValue::Float(alpha));
        params.insert("random_state".to_string(), ParameterValue::Int(42));
        Configuration::new("Ridge", params)
    }

    async fn recording_evaluator(
        dir: &std::path::Path,
        train: Dataset,
    ) -> (Arc<LocalTrackingStore>, String, ObjectiveEvaluator) {
        let store = Arc::new(LocalTrackingStore::open(dir.join("mlruns")).await.unwrap());
        let exp = store.get_or_create_experiment("model-hyperopt").await.unwrap();
        let recorder =
            TrialRecorder::new(store.clone(), &exp.experiment_id, "val_mse", dir.join("scratch"));
        let evaluator =
            ObjectiveEvaluator::new(train, linear_dataset(10, 0.5)).with_recorder(recorder);
        (store, exp.experiment_id, evaluator)
    }

    async fn run_count(store: &LocalTrackingStore, experiment_id: &str) -> usize {
        store
            .search_runs(&RunSearch::in_experiment(experiment_id))
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn ridge_trial_is_scored_and_recorded() {
        let dir = tempdir().unwrap();
        let (store, exp_id, mut evaluator) =
            recording_evaluator(dir.path(), linear_dataset(40, 0.0)).await;

        let outcome = evaluator.evaluate(0, &ridge(0.001)).await.unwrap();
        assert!(outcome.loss < 1e-3, "loss {}", outcome.loss);
        assert_eq!(outcome.artifacts.len(), 1);

        let run_id = outcome.run_id.unwrap();
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.metric("val_mse"), Some(outcome.loss));
        assert_eq!(run_count(&store, &exp_id).await, 1);
    }

    #[tokio::test]
    async fn unknown_family_is_fatal_and_records_nothing() {
        let dir = tempdir().unwrap();
        let (store, exp_id, mut evaluator) =
            recording_evaluator(dir.path(), linear_dataset(20, 0.0)).await;

        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), ParameterValue::Float(0.1));
        let lasso = Configuration::new("Lasso", params);

        let err = evaluator.evaluate(0, &lasso).await.unwrap_err();
        assert!(matches!(
            err,
            HlError::Configuration(ConfigurationError::UnknownFamily { .. })
        ));
        assert!(err.is_fatal());
        assert_eq!(run_count(&store, &exp_id).await, 0);
    }

    #[tokio::test]
    async fn nan_features_fail_training_and_record_nothing() {
        let dir = tempdir().unwrap();
        let mut train = linear_dataset(20, 0.0);
        train.features[[3, 1]] = f64::NAN;
        let (store, exp_id, mut evaluator) = recording_evaluator(dir.path(), train).await;

        let err = evaluator.evaluate(0, &ridge(0.1)).await.unwrap_err();
        assert!(matches!(
            err,
            HlError::Training(TrainingError::NonFinite { .. })
        ));
        assert_eq!(run_count(&store, &exp_id).await, 0);
    }

    #[tokio::test]
    async fn gradient_boosting_emits_feature_importance() {
        let mut params = BTreeMap::new();
        params.insert("max_depth".to_string(), ParameterValue::Int(3));
        params.insert("n_estimators".to_string(), ParameterValue::Int(20));
        params.insert("learning_rate".to_string(), ParameterValue::Float(0.3));
        params.insert("subsample".to_string(), ParameterValue::Float(1.0));
        params.insert("colsample_bytree".to_string(), ParameterValue::Float(1.0));
        params.insert("random_state".to_string(), ParameterValue::Int(42));
        let config = Configuration::new("XGBRegressor", params);

        let mut evaluator = ObjectiveEvaluator::new(linear_dataset(40, 0.0), linear_dataset(10, 0.5));
        let outcome = evaluator.evaluate(0, &config).await.unwrap();
        assert!(outcome.loss.is_finite());
        assert!(outcome.run_id.is_none());
        assert_eq!(outcome.artifacts[0].file_name, "feature_importance.json");
        assert_eq!(outcome.artifacts[0].values.len(), 2);
    }
}
