//! Sequential search driver.

use async_trait::async_trait;
use chrono::Utc;
use hl_types::{config_error, Configuration, HlResult, TrainingError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::search::SearchSpace;
use crate::tpe::TpeSampler;
use crate::trial::{History, Trial, TrialOutcome};

/// Evaluates one configuration. Errors abort the whole search.
#[async_trait]
pub trait Objective: Send {
    async fn evaluate(&mut self, trial_number: usize, config: &Configuration)
        -> HlResult<TrialOutcome>;
}

/// Adapts a plain loss function into an [`Objective`].
pub struct FnObjective<F>(pub F);

impl<F> FnObjective<F>
where
    F: FnMut(&Configuration) -> HlResult<f64> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Objective for FnObjective<F>
where
    F: FnMut(&Configuration) -> HlResult<f64> + Send,
{
    async fn evaluate(
        &mut self,
        _trial_number: usize,
        config: &Configuration,
    ) -> HlResult<TrialOutcome> {
        (self.0)(config).map(TrialOutcome::new)
    }
}

/// TPE tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Prior draws before the density model kicks in.
    pub n_startup: usize,
    /// Fraction parameter for the good/other split.
    pub gamma: f64,
    /// Candidates scored per dimension.
    pub n_ei_candidates: usize,
    /// Weight of the prior component in every density.
    pub prior_weight: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_startup: 20,
            gamma: 0.25,
            n_ei_candidates: 24,
            prior_weight: 1.0,
        }
    }
}

impl OptimizerConfig {
    /// At least one prior draw always opens the search.
    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n.max(1);
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    pub fn with_ei_candidates(mut self, n: usize) -> Self {
        self.n_ei_candidates = n.max(1);
        self
    }

    pub fn with_prior_weight(mut self, weight: f64) -> Self {
        self.prior_weight = weight;
        self
    }
}

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Lowest-loss trial of this invocation.
    pub best: Trial,
    pub history: History,
}

impl SearchOutcome {
    pub fn trials_evaluated(&self) -> usize {
        self.history.len()
    }
}

/// Per-invocation state; dropped once the budget is spent.
struct OptimizerState {
    history: History,
    rng: ChaCha8Rng,
    remaining: usize,
}

impl OptimizerState {
    fn new(budget: usize, seed: u64) -> Self {
        Self {
            history: History::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            remaining: budget,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    sampler: TpeSampler,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            sampler: TpeSampler::new(config),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        self.sampler.config()
    }

    /// Evaluate `budget` configurations one after another and return the best.
    /// The same `seed` and objective reproduce the same sequence of proposals.
    pub async fn run<O>(
        &self,
        space: &SearchSpace,
        objective: &mut O,
        budget: usize,
        seed: u64,
    ) -> HlResult<SearchOutcome>
    where
        O: Objective + ?Sized,
    {
        if budget == 0 {
            return Err(config_error!("search budget must be at least 1").into());
        }
        space.validate()?;

        info!(budget, seed, families = space.families().len(), "Starting search");
        let mut state = OptimizerState::new(budget, seed);

        while state.remaining > 0 {
            let number = state.history.len();
            let config = self
                .sampler
                .propose(space, &state.history, &mut state.rng);
            let started_at = Utc::now();

            let outcome = match objective.evaluate(number, &config).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(trial = number, config = %config, error = %e, "Trial failed, aborting search");
                    return Err(e);
                }
            };
            if !outcome.loss.is_finite() {
                error!(
                    trial = number,
                    config = %config,
                    loss = outcome.loss,
                    "Non-finite loss, aborting search"
                );
                return Err(TrainingError::NonFinite {
                    what: "loss".to_string(),
                    row: number,
                }
                .into());
            }

            let trial = Trial::new(number, config, outcome, started_at);
            info!(
                trial = number,
                family = trial.family(),
                loss = trial.loss,
                run_id = trial.run_id.as_deref().unwrap_or("-"),
                "Trial completed"
            );
            state.history.push(trial);
            state.remaining -= 1;
        }

        let best = state
            .history
            .best()
            .cloned()
            .ok_or_else(|| config_error!("search finished without trials"))?;
        info!(
            trial = best.number,
            loss = best.loss,
            configuration = %best.configuration,
            "Search finished"
        );
        Ok(SearchOutcome {
            best,
            history: state.history,
        })
    }
}
