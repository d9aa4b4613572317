//! `hyperlift search`

use std::path::PathBuf;

use anyhow::{Context, Result};
use hl_engine::{run_search, SearchRequest};
use hl_optimizer::OptimizerConfig;
use hl_types::Settings;
use tracing::info;

use super::backends;

pub struct SearchArgs {
    pub data_path: PathBuf,
    pub num_trials: usize,
    pub seed: u64,
    pub experiment: Option<String>,
    pub startup_trials: usize,
    pub target_column: Option<String>,
}

impl SearchArgs {
    fn into_request(self, settings: &Settings) -> SearchRequest {
        let mut request = SearchRequest::new(self.data_path, self.num_trials)
            .with_seed(self.seed)
            .with_experiment(
                self.experiment
                    .unwrap_or_else(|| settings.experiment_name.clone()),
            )
            .with_metric(settings.metric_name.clone())
            .with_optimizer(OptimizerConfig::default().with_startup(self.startup_trials))
            .with_scratch_dir(settings.scratch_dir.join("trials"));
        if let Some(column) = self.target_column {
            request = request.with_target_column(column);
        }
        request
    }
}

/// Runs the search. Results land in the tracking store; the best trial is
/// also printed.
pub async fn run(settings: &Settings, args: SearchArgs) -> Result<()> {
    let backends = backends(settings).await?;
    let request = args.into_request(settings);
    let experiment = request.experiment.clone();

    let outcome = run_search(backends.tracking, request)
        .await
        .with_context(|| format!("Search in experiment '{experiment}' failed"))?;

    info!(
        trials = outcome.trials_evaluated(),
        best_loss = outcome.best.loss,
        "Search complete"
    );
    println!("{}", serde_json::to_string_pretty(&outcome.best)?);
    Ok(())
}
