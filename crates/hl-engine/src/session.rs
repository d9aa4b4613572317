//! A full search: load the splits, then tune and record every trial.

use hl_data::SplitLoader;
use hl_optimizer::{Optimizer, OptimizerConfig, SearchOutcome, SearchSpace};
use hl_tracking::TrackingStore;
use hl_types::{HlResult, DEFAULT_EXPERIMENT, DEFAULT_METRIC};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::evaluator::ObjectiveEvaluator;
use crate::recorder::TrialRecorder;

/// Parameters of one search invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Directory holding the `train` and `val` splits.
    pub data_path: PathBuf,
    pub target_column: Option<String>,
    pub budget: usize,
    pub seed: u64,
    pub experiment: String,
    pub metric: String,
    pub optimizer: OptimizerConfig,
    pub space: SearchSpace,
    /// Where per-trial model files are staged before upload.
    pub scratch_dir: PathBuf,
}

impl SearchRequest {
    pub fn new(data_path: impl Into<PathBuf>, budget: usize) -> Self {
        Self {
            data_path: data_path.into(),
            target_column: None,
            budget,
            seed: 42,
            experiment: DEFAULT_EXPERIMENT.to_string(),
            metric: DEFAULT_METRIC.to_string(),
            optimizer: OptimizerConfig::default(),
            space: SearchSpace::default_regression(),
            scratch_dir: std::env::temp_dir().join("hyperlift"),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = experiment.into();
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = metric.into();
        self
    }

    pub fn with_target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = Some(column.into());
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

/// Runs a [`SearchRequest`] against a tracking store.
pub struct SearchSession {
    store: Arc<dyn TrackingStore>,
    request: SearchRequest,
}

impl SearchSession {
    pub fn new(store: Arc<dyn TrackingStore>, request: SearchRequest) -> Self {
        Self { store, request }
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    pub async fn run(&self) -> HlResult<SearchOutcome> {
        let request = &self.request;
        info!(
            data = %request.data_path.display(),
            experiment = %request.experiment,
            budget = request.budget,
            "Starting hyperparameter search"
        );

        let mut loader = SplitLoader::new(&request.data_path);
        if let Some(column) = &request.target_column {
            loader = loader.with_target_column(column);
        }
        let (train, validation) = loader.load_train_val()?;

        let experiment = self
            .store
            .get_or_create_experiment(&request.experiment)
            .await?;
        let recorder = TrialRecorder::new(
            self.store.clone(),
            experiment.experiment_id,
            &request.metric,
            &request.scratch_dir,
        );
        let mut evaluator = ObjectiveEvaluator::new(train, validation).with_recorder(recorder);

        let optimizer = Optimizer::new(request.optimizer.clone());
        optimizer
            .run(&request.space, &mut evaluator, request.budget, request.seed)
            .await
    }
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("request", &self.request)
            .finish()
    }
}

/// Convenience wrapper around [`SearchSession::run`].
pub async fn run_search(
    store: Arc<dyn TrackingStore>,
    request: SearchRequest,
) -> HlResult<SearchOutcome> {
    SearchSession::new(store, request).run().await
}
