//! Gradient-boosted regression trees with squared-error loss.

use hl_types::{ModelFamily, TrainingError, TrialArtifact};
use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spec::GbtParams;
use crate::{check_prediction_inputs, check_training_inputs, Regressor, SavedModel};

/// L2 penalty on leaf weights.
const REG_LAMBDA: f64 = 1.0;

/// Splits must improve the objective by more than this.
const MIN_SPLIT_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A binary regression tree; rows with `x[feature] < threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Greedy exact-split tree growth over a row/column sample.
struct TreeGrower<'a> {
    features: &'a Array2<f64>,
    residuals: &'a [f64],
    columns: &'a [usize],
    max_depth: usize,
    gain_totals: &'a mut [f64],
    split_counts: &'a mut [usize],
    nodes: Vec<Node>,
}

impl<'a> TreeGrower<'a> {
    fn grow(&mut self, rows: &[usize], depth: usize) -> usize {
        let sum: f64 = rows.iter().map(|&i| self.residuals[i]).sum();
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: sum / (rows.len() as f64 + REG_LAMBDA),
        });

        if depth >= self.max_depth || rows.len() < 2 {
            return idx;
        }
        let Some(split) = self.best_split(rows, sum) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&i| self.features[[i, split.feature]] < split.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return idx;
        }

        self.gain_totals[split.feature] += split.gain;
        self.split_counts[split.feature] += 1;

        let left = self.grow(&left_rows, depth + 1);
        let right = self.grow(&right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn best_split(&self, rows: &[usize], total: f64) -> Option<SplitCandidate> {
        let n = rows.len() as f64;
        let parent_score = total * total / (n + REG_LAMBDA);
        let mut best: Option<SplitCandidate> = None;
        let mut sorted = rows.to_vec();

        for &feature in self.columns {
            sorted.sort_by(|&a, &b| {
                self.features[[a, feature]]
                    .partial_cmp(&self.features[[b, feature]])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut left_sum = 0.0;
            for k in 0..sorted.len() - 1 {
                left_sum += self.residuals[sorted[k]];
                let here = self.features[[sorted[k], feature]];
                let next = self.features[[sorted[k + 1], feature]];
                if here == next {
                    continue;
                }

                let n_left = (k + 1) as f64;
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / (n_left + REG_LAMBDA)
                    + right_sum * right_sum / (n - n_left + REG_LAMBDA)
                    - parent_score;

                let improves = match best {
                    None => gain > MIN_SPLIT_GAIN,
                    Some(b) => gain > b.gain + MIN_SPLIT_GAIN,
                };
                if improves {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        gain,
                    });
                }
            }
        }

        best
    }
}

/// Boosted ensemble of shallow regression trees.
///
/// Each round fits a tree to the current residuals on a row subsample and a
/// column subsample drawn from a generator seeded with `random_state`, so
/// fitting the same data twice gives the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostingRegressor {
    pub params: GbtParams,
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
    feature_importances: Vec<f64>,
    fitted: bool,
}

impl GradientBoostingRegressor {
    pub fn new(params: GbtParams) -> Self {
        Self {
            params,
            base_score: 0.0,
            trees: Vec::new(),
            n_features: 0,
            feature_importances: Vec::new(),
            fitted: false,
        }
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Average split gain per feature, normalized to sum to one.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    fn sample_size(fraction: f64, population: usize) -> usize {
        ((fraction * population as f64).round() as usize).clamp(1, population)
    }
}

impl Regressor for GradientBoostingRegressor {
    fn family(&self) -> ModelFamily {
        ModelFamily::GradientBoosting
    }

    fn fit(&mut self, features: &Array2<f64>, targets: &Array1<f64>) -> Result<(), TrainingError> {
        check_training_inputs(features, targets)?;

        let n_rows = features.nrows();
        let n_features = features.ncols();
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.random_state);

        let base_score = targets.mean().ok_or(TrainingError::EmptyData)?;
        let mut predictions = vec![base_score; n_rows];
        let mut gain_totals = vec![0.0; n_features];
        let mut split_counts = vec![0usize; n_features];
        let mut trees = Vec::with_capacity(self.params.n_estimators);

        for round in 0..self.params.n_estimators {
            let residuals: Vec<f64> = targets
                .iter()
                .zip(&predictions)
                .map(|(y, p)| y - p)
                .collect();

            let mut rows = if self.params.subsample < 1.0 {
                let k = Self::sample_size(self.params.subsample, n_rows);
                index::sample(&mut rng, n_rows, k).into_vec()
            } else {
                (0..n_rows).collect()
            };
            rows.sort_unstable();

            let mut columns = if n_features == 0 {
                Vec::new()
            } else if self.params.colsample_bytree < 1.0 {
                let k = Self::sample_size(self.params.colsample_bytree, n_features);
                index::sample(&mut rng, n_features, k).into_vec()
            } else {
                (0..n_features).collect()
            };
            columns.sort_unstable();

            let mut grower = TreeGrower {
                features,
                residuals: &residuals,
                columns: &columns,
                max_depth: self.params.max_depth,
                gain_totals: &mut gain_totals,
                split_counts: &mut split_counts,
                nodes: Vec::new(),
            };
            grower.grow(&rows, 0);
            let tree = RegressionTree {
                nodes: grower.nodes,
            };

            for (i, row) in features.rows().into_iter().enumerate() {
                predictions[i] += self.params.learning_rate * tree.predict_row(row);
            }
            if predictions.iter().any(|p| !p.is_finite()) {
                return Err(TrainingError::Failed(format!(
                    "predictions diverged in boosting round {round}"
                )));
            }
            trees.push(tree);
        }

        let averages: Vec<f64> = gain_totals
            .iter()
            .zip(&split_counts)
            .map(|(g, &c)| if c > 0 { g / c as f64 } else { 0.0 })
            .collect();
        let total: f64 = averages.iter().sum();
        self.feature_importances = if total > 0.0 {
            averages.iter().map(|a| a / total).collect()
        } else {
            averages
        };

        debug!(
            n_estimators = trees.len(),
            max_depth = self.params.max_depth,
            base_score,
            "Fitted gradient boosting model"
        );

        self.base_score = base_score;
        self.trees = trees;
        self.n_features = n_features;
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>, TrainingError> {
        if !self.fitted {
            return Err(TrainingError::NotFitted);
        }
        check_prediction_inputs(features, self.n_features)?;

        let lr = self.params.learning_rate;
        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                self.base_score
                    + self
                        .trees
                        .iter()
                        .map(|t| lr * t.predict_row(row))
                        .sum::<f64>()
            })
            .collect())
    }

    fn interpretability(&self, feature_names: &[String]) -> Option<TrialArtifact> {
        self.fitted.then(|| {
            TrialArtifact::feature_importance(
                feature_names.to_vec(),
                self.feature_importances.clone(),
            )
        })
    }

    fn snapshot(&self) -> SavedModel {
        SavedModel::GradientBoosting(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mean_squared_error;
    use ndarray::Array;

    fn params() -> GbtParams {
        GbtParams {
            max_depth: 3,
            n_estimators: 30,
            learning_rate: 0.3,
            subsample: 0.9,
            colsample_bytree: 1.0,
            random_state: 42,
        }
    }

    /// y depends on feature 0 only; feature 1 is noise-free filler.
    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let n = 40;
        let x = Array::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                i as f64
            } else {
                ((i * 7) % 5) as f64
            }
        });
        let y = Array::from_shape_fn(n, |i| if i < 20 { 1.0 } else { 10.0 });
        (x, y)
    }

    #[test]
    fn boosting_beats_mean_predictor() {
        let (x, y) = step_data();
        let mut model = GradientBoostingRegressor::new(params());
        model.fit(&x, &y).unwrap();

        let mean = y.mean().unwrap();
        let baseline = mean_squared_error(&y, &Array1::from_elem(y.len(), mean)).unwrap();
        let fitted = mean_squared_error(&y, &model.predict(&x).unwrap()).unwrap();
        assert!(fitted < baseline * 0.05, "fitted {fitted}, baseline {baseline}");
        assert_eq!(model.trees().len(), 30);
    }

    #[test]
    fn importance_concentrates_on_signal_feature() {
        let (x, y) = step_data();
        let mut model = GradientBoostingRegressor::new(params());
        model.fit(&x, &y).unwrap();

        let imp = model.feature_importances();
        assert_eq!(imp.len(), 2);
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(imp[0] > imp[1]);
    }

    #[test]
    fn trees_respect_max_depth() {
        let (x, y) = step_data();
        let mut p = params();
        p.max_depth = 2;
        let mut model = GradientBoostingRegressor::new(p);
        model.fit(&x, &y).unwrap();
        assert!(model.trees().iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn same_seed_same_model() {
        let (x, y) = step_data();
        let mut p = params();
        p.subsample = 0.5;
        p.colsample_bytree = 0.5;

        let mut a = GradientBoostingRegressor::new(p.clone());
        let mut b = GradientBoostingRegressor::new(p);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nan_target_is_training_error() {
        let (x, mut y) = step_data();
        y[3] = f64::NAN;
        let mut model = GradientBoostingRegressor::new(params());
        assert!(matches!(
            model.fit(&x, &y),
            Err(TrainingError::NonFinite { row: 3, .. })
        ));
    }

    #[test]
    fn predict_checks_width() {
        let (x, y) = step_data();
        let mut model = GradientBoostingRegressor::new(params());
        model.fit(&x, &y).unwrap();
        assert!(model.predict(&Array2::zeros((1, 3))).is_err());
    }
}
