//! Tree-structured Parzen Estimator.
//!
//! Completed trials are split by loss into a "good" and an "other" group.
//! Each group gets a density per dimension (a categorical posterior for the
//! family, an adaptive Parzen mixture for numeric parameters) and candidates
//! drawn from the good density are ranked by `log l(x) - log g(x)`.
//! Parameter densities are conditioned on the family: only trials of the
//! chosen family contribute observations.

use hl_types::{Configuration, ParameterValue};
use rand::Rng;
use rand_distr::{Distribution as _, Normal};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::debug;

use crate::optimizer::OptimizerConfig;
use crate::search::{categorical, Distribution, FamilySpace, SearchSpace};
use crate::trial::{History, Trial};

/// Upper bound on the size of the good group.
const MAX_GOOD: usize = 25;
/// Rejection attempts before a truncated draw falls back to the component mean.
const MAX_REJECTIONS: usize = 64;
const DENSITY_FLOOR: f64 = 1e-300;

/// Proposes configurations from a [`History`] using TPE.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    config: OptimizerConfig,
}

impl Default for TpeSampler {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl TpeSampler {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Number of trials treated as good out of `n` completed.
    pub fn n_good(&self, n: usize) -> usize {
        let n_good = (self.config.gamma * (n as f64).sqrt()).ceil() as usize;
        n_good.clamp(1, MAX_GOOD)
    }

    /// Next configuration to evaluate. Until `n_startup` trials have completed
    /// this is a plain prior draw.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        space: &SearchSpace,
        history: &History,
        rng: &mut R,
    ) -> Configuration {
        if history.len() < self.config.n_startup {
            return space.sample(rng);
        }

        let sorted = history.sorted_by_loss();
        let (good, other) = sorted.split_at(self.n_good(sorted.len()).min(sorted.len()));

        let family = self.choose_family(space, good, other, rng);
        let params: BTreeMap<String, ParameterValue> = family
            .parameters
            .iter()
            .map(|def| {
                let value = match def.distribution {
                    Distribution::Constant { value } => value,
                    ref dist => {
                        let good_obs = observations(good, &family.family, &def.name, dist);
                        let other_obs = observations(other, &family.family, &def.name, dist);
                        self.suggest_numeric(dist, &good_obs, &other_obs, &mut *rng)
                    }
                };
                (def.name.clone(), value)
            })
            .collect();

        debug!(
            family = %family.family,
            n_good = good.len(),
            n_other = other.len(),
            "TPE proposal"
        );
        Configuration::new(family.family.clone(), params)
    }

    fn choose_family<'s, R: Rng + ?Sized>(
        &self,
        space: &'s SearchSpace,
        good: &[&Trial],
        other: &[&Trial],
        rng: &mut R,
    ) -> &'s FamilySpace {
        let prior = space.family_probabilities();
        let l = self.family_posterior(space, &prior, good);
        let g = self.family_posterior(space, &prior, other);

        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;
        for _ in 0..self.config.n_ei_candidates.max(1) {
            let idx = categorical(rng, &l);
            let score = l[idx].max(DENSITY_FLOOR).ln() - g[idx].max(DENSITY_FLOOR).ln();
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        &space.families[best_idx]
    }

    fn family_posterior(&self, space: &SearchSpace, prior: &[f64], group: &[&Trial]) -> Vec<f64> {
        let mut weights: Vec<f64> = prior.iter().map(|p| p * self.config.prior_weight).collect();
        for trial in group {
            if let Some(idx) = space.family_index(trial.family()) {
                weights[idx] += 1.0;
            }
        }
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            prior.to_vec()
        }
    }

    fn suggest_numeric<R: Rng + ?Sized>(
        &self,
        dist: &Distribution,
        good_obs: &[f64],
        other_obs: &[f64],
        rng: &mut R,
    ) -> ParameterValue {
        let Some((low, high)) = dist.model_bounds() else {
            return dist.sample(rng);
        };
        let l = ParzenEstimator::fit(good_obs, low, high, self.config.prior_weight);
        let g = ParzenEstimator::fit(other_obs, low, high, self.config.prior_weight);

        let mut best_x = 0.5 * (low + high);
        let mut best_score = f64::NEG_INFINITY;
        for _ in 0..self.config.n_ei_candidates.max(1) {
            let mut x = l.sample(rng);
            if dist.is_quantized() {
                x = dist.quantize(x).as_f64();
            }
            let score = l.log_pdf(x) - g.log_pdf(x);
            if score > best_score {
                best_score = score;
                best_x = x;
            }
        }
        dist.from_model_space(best_x)
    }
}

/// Model-space values of `name` across the trials of `family`.
fn observations(trials: &[&Trial], family: &str, name: &str, dist: &Distribution) -> Vec<f64> {
    trials
        .iter()
        .filter(|t| t.family() == family)
        .filter_map(|t| t.configuration.get(name))
        .map(|v| dist.to_model_space(v.as_f64()))
        .filter(|v| v.is_finite())
        .collect()
}

/// Gaussian mixture truncated to `[low, high]`: one component per
/// observation plus a broad prior component.
#[derive(Debug, Clone)]
pub(crate) struct ParzenEstimator {
    weights: Vec<f64>,
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    low: f64,
    high: f64,
}

impl ParzenEstimator {
    pub(crate) fn fit(observations: &[f64], low: f64, high: f64, prior_weight: f64) -> Self {
        let prior_mu = 0.5 * (low + high);
        let prior_sigma = (high - low).max(f64::MIN_POSITIVE);

        // (mu, weight, is_prior), sorted by mu
        let mut components: Vec<(f64, f64, bool)> =
            observations.iter().map(|&mu| (mu, 1.0, false)).collect();
        components.push((prior_mu, prior_weight.max(f64::MIN_POSITIVE), true));
        components.sort_by(|a, b| a.0.total_cmp(&b.0));

        let n = components.len();
        let max_sigma = prior_sigma;
        let min_sigma = prior_sigma / (100.0_f64).min(1.0 + n as f64);

        let mus: Vec<f64> = components.iter().map(|c| c.0).collect();
        let sigmas: Vec<f64> = (0..n)
            .map(|i| {
                if components[i].2 || n == 1 {
                    return prior_sigma;
                }
                let left = if i > 0 { mus[i] - mus[i - 1] } else { 0.0 };
                let right = if i + 1 < n { mus[i + 1] - mus[i] } else { 0.0 };
                left.max(right).clamp(min_sigma, max_sigma)
            })
            .collect();

        let total: f64 = components.iter().map(|c| c.1).sum();
        let weights = components.iter().map(|c| c.1 / total).collect();

        Self {
            weights,
            mus,
            sigmas,
            low,
            high,
        }
    }

    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let k = categorical(rng, &self.weights);
        let (mu, sigma) = (self.mus[k], self.sigmas[k]);
        if let Ok(normal) = Normal::new(mu, sigma) {
            for _ in 0..MAX_REJECTIONS {
                let x = normal.sample(rng);
                if x >= self.low && x <= self.high {
                    return x;
                }
            }
        }
        mu.clamp(self.low, self.high)
    }

    pub(crate) fn log_pdf(&self, x: f64) -> f64 {
        let density: f64 = self
            .weights
            .iter()
            .zip(self.mus.iter().zip(&self.sigmas))
            .map(|(w, (mu, sigma))| {
                let mass = normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma);
                let z = (x - mu) / sigma;
                let pdf = (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt());
                w * pdf / mass.max(1e-12)
            })
            .sum();
        density.max(DENSITY_FLOOR).ln()
    }
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26 (|error| < 1.5e-7).
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
