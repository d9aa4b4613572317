//! Ridge (L2-regularized least squares) regression.

use hl_types::{ModelFamily, TrainingError, TrialArtifact};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spec::RidgeParams;
use crate::{check_prediction_inputs, check_training_inputs, Regressor, SavedModel};

/// Linear model minimizing `||y - Xw - b||² + alpha * ||w||²`.
///
/// The intercept is fitted without penalty by centering features and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    pub params: RidgeParams,
    coefficients: Option<Vec<f64>>,
    intercept: f64,
}

impl RidgeRegressor {
    pub fn new(params: RidgeParams) -> Self {
        Self {
            params,
            coefficients: None,
            intercept: 0.0,
        }
    }

    pub fn coefficients(&self) -> Option<&[f64]> {
        self.coefficients.as_deref()
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for RidgeRegressor {
    fn family(&self) -> ModelFamily {
        ModelFamily::Ridge
    }

    fn fit(&mut self, features: &Array2<f64>, targets: &Array1<f64>) -> Result<(), TrainingError> {
        check_training_inputs(features, targets)?;

        let n_features = features.ncols();
        let x_mean = features
            .mean_axis(Axis(0))
            .ok_or(TrainingError::EmptyData)?;
        let y_mean = targets.mean().ok_or(TrainingError::EmptyData)?;

        let x_centered = features - &x_mean;
        let y_centered = targets - y_mean;

        let mut gram = x_centered.t().dot(&x_centered);
        for i in 0..n_features {
            gram[[i, i]] += self.params.alpha;
        }
        let rhs = x_centered.t().dot(&y_centered);

        let weights = solve_normal_equations(&gram, &rhs).ok_or(TrainingError::Singular {
            alpha: self.params.alpha,
        })?;

        self.intercept = y_mean - x_mean.dot(&weights);
        debug!(
            alpha = self.params.alpha,
            n_features,
            intercept = self.intercept,
            "Fitted ridge model"
        );
        self.coefficients = Some(weights.to_vec());
        Ok(())
    }

    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>, TrainingError> {
        let coefficients = self.coefficients.as_ref().ok_or(TrainingError::NotFitted)?;
        check_prediction_inputs(features, coefficients.len())?;

        let weights = Array1::from(coefficients.clone());
        Ok(features.dot(&weights) + self.intercept)
    }

    fn interpretability(&self, feature_names: &[String]) -> Option<TrialArtifact> {
        self.coefficients
            .as_ref()
            .map(|c| TrialArtifact::coefficients(feature_names.to_vec(), c.clone()))
    }

    fn snapshot(&self) -> SavedModel {
        SavedModel::Ridge(self.clone())
    }
}

/// Solve the symmetric positive-definite system `gram * w = rhs`.
/// `None` when a pivot of the factorization vanishes relative to the
/// largest diagonal entry.
fn solve_normal_equations(gram: &Array2<f64>, rhs: &Array1<f64>) -> Option<Array1<f64>> {
    let n = rhs.len();
    if n == 0 {
        return Some(Array1::zeros(0));
    }
    let matrix = DMatrix::from_fn(n, n, |i, j| gram[[i, j]]);
    let scale = matrix.diagonal().iter().fold(1.0_f64, |m, v| m.max(v.abs()));

    let cholesky = Cholesky::new(matrix)?;
    let pivots_ok = cholesky
        .l_dirty()
        .diagonal()
        .iter()
        .all(|d| d * d > scale * 1e-12);
    if !pivots_ok {
        return None;
    }

    let solution = cholesky.solve(&DVector::from_iterator(n, rhs.iter().copied()));
    Some(Array1::from_iter(solution.iter().copied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ridge(alpha: f64) -> RidgeRegressor {
        RidgeRegressor::new(RidgeParams {
            alpha,
            random_state: 42,
        })
    }

    #[test]
    fn recovers_linear_relationship() {
        // y = 3 * x0 - 2 * x1 + 5
        let x = array![
            [1.0, 0.0],
            [0.0, 1.0],
            [2.0, 1.0],
            [3.0, 5.0],
            [4.0, 2.0],
            [-1.0, 3.0]
        ];
        let y = x.map_axis(Axis(1), |r| 3.0 * r[0] - 2.0 * r[1] + 5.0);

        let mut model = ridge(1e-9);
        model.fit(&x, &y).unwrap();

        let coef = model.coefficients().unwrap();
        assert!((coef[0] - 3.0).abs() < 1e-6, "coef0 = {}", coef[0]);
        assert!((coef[1] + 2.0).abs() < 1e-6, "coef1 = {}", coef[1]);
        assert!((model.intercept() - 5.0).abs() < 1e-6);

        let pred = model.predict(&array![[10.0, 10.0]]).unwrap();
        assert!((pred[0] - 15.0).abs() < 1e-5);
    }

    #[test]
    fn stronger_alpha_shrinks_coefficients() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![2.0, 4.0, 6.0, 8.0];

        let mut weak = ridge(0.001);
        weak.fit(&x, &y).unwrap();
        let mut strong = ridge(100.0);
        strong.fit(&x, &y).unwrap();

        assert!(strong.coefficients().unwrap()[0].abs() < weak.coefficients().unwrap()[0].abs());
    }

    #[test]
    fn collinear_features_without_penalty_are_singular() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let y = array![1.0, 2.0, 3.0];
        let mut model = ridge(0.0);
        assert_eq!(
            model.fit(&x, &y),
            Err(TrainingError::Singular { alpha: 0.0 })
        );
    }

    #[test]
    fn normal_equations_match_a_hand_solved_system() {
        // 4a + 2b = 2, 2a + 3b = 1
        let w = solve_normal_equations(&array![[4.0, 2.0], [2.0, 3.0]], &array![2.0, 1.0])
            .unwrap();
        assert!((w[0] - 0.5).abs() < 1e-12);
        assert!(w[1].abs() < 1e-12);

        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(solve_normal_equations(&singular, &array![1.0, 1.0]).is_none());
        assert!(solve_normal_equations(&array![[-1.0]], &array![1.0]).is_none());
    }

    #[test]
    fn predict_before_fit_fails() {
        assert_eq!(
            ridge(1.0).predict(&array![[1.0]]),
            Err(TrainingError::NotFitted)
        );
    }

    #[test]
    fn coefficients_artifact() {
        let mut model = ridge(0.1);
        assert!(model.interpretability(&["a".into()]).is_none());
        model.fit(&array![[1.0], [2.0]], &array![1.0, 2.0]).unwrap();
        let artifact = model.interpretability(&["a".into()]).unwrap();
        assert_eq!(artifact.file_name, "ridge_coefficients.json");
        assert_eq!(artifact.values.len(), 1);
    }
}
