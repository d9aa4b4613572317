//! # hl-models
//!
//! Regression model families for Hyperlift.
//!
//! Every family implements [`Regressor`]. Sampled configurations are turned
//! into a typed [`ModelSpec`] (one variant per family) and built through
//! [`ModelSpec::build`]; fitted models are persisted as [`SavedModel`].

mod gbt;
mod metrics;
mod persist;
mod ridge;
mod spec;

pub use gbt::{GradientBoostingRegressor, RegressionTree};
pub use metrics::mean_squared_error;
pub use persist::{load_model, save_model, ModelMetadata, SavedModel, MLMODEL_FILE, MODEL_FILE};
pub use ridge::RidgeRegressor;
pub use spec::{GbtParams, ModelSpec, RidgeParams};

use hl_types::{ModelFamily, TrainingError, TrialArtifact};
use ndarray::{Array1, Array2};

/// A trainable regression model.
pub trait Regressor: Send + Sync + std::fmt::Debug {
    fn family(&self) -> ModelFamily;

    /// Fit on a feature matrix and target vector.
    fn fit(&mut self, features: &Array2<f64>, targets: &Array1<f64>) -> Result<(), TrainingError>;

    /// Predict one value per feature row.
    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>, TrainingError>;

    /// Interpretability output: importances for tree ensembles, coefficients
    /// for linear models. `None` before fitting.
    fn interpretability(&self, feature_names: &[String]) -> Option<TrialArtifact>;

    /// Serializable snapshot of the fitted state.
    fn snapshot(&self) -> SavedModel;
}

/// Rejects empty, mis-shaped or non-finite training inputs.
pub(crate) fn check_training_inputs(
    features: &Array2<f64>,
    targets: &Array1<f64>,
) -> Result<(), TrainingError> {
    if features.nrows() == 0 {
        return Err(TrainingError::EmptyData);
    }
    if features.nrows() != targets.len() {
        return Err(hl_types::shape_error!(
            "{} feature rows but {} targets",
            features.nrows(),
            targets.len()
        ));
    }
    check_finite(features)?;
    if let Some(row) = targets.iter().position(|v| !v.is_finite()) {
        return Err(TrainingError::NonFinite {
            what: "targets".to_string(),
            row,
        });
    }
    Ok(())
}

/// Rejects prediction inputs with the wrong width or non-finite values.
pub(crate) fn check_prediction_inputs(
    features: &Array2<f64>,
    n_features: usize,
) -> Result<(), TrainingError> {
    if features.ncols() != n_features {
        return Err(hl_types::shape_error!(
            "model was fitted on {} features, got {}",
            n_features,
            features.ncols()
        ));
    }
    check_finite(features)
}

fn check_finite(features: &Array2<f64>) -> Result<(), TrainingError> {
    for (row, values) in features.rows().into_iter().enumerate() {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite {
                what: "features".to_string(),
                row,
            });
        }
    }
    Ok(())
}
