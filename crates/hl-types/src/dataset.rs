use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::errors::{DataError, HlResult};

/// One split of a tabular regression dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
}

impl Dataset {
    pub fn new(
        feature_names: Vec<String>,
        features: Array2<f64>,
        targets: Array1<f64>,
    ) -> HlResult<Self> {
        if features.nrows() != targets.len() {
            return Err(DataError::InvalidShape {
                message: format!(
                    "{} feature rows but {} targets",
                    features.nrows(),
                    targets.len()
                ),
            }
            .into());
        }
        if !feature_names.is_empty() && feature_names.len() != features.ncols() {
            return Err(DataError::InvalidShape {
                message: format!(
                    "{} feature names for {} columns",
                    feature_names.len(),
                    features.ncols()
                ),
            }
            .into());
        }

        let feature_names = if feature_names.is_empty() {
            (0..features.ncols()).map(|i| format!("f{i}")).collect()
        } else {
            feature_names
        };

        Ok(Self {
            feature_names,
            features,
            targets,
        })
    }

    /// Build from row-major vectors (every row must have the same width).
    pub fn from_rows(
        feature_names: Vec<String>,
        rows: Vec<Vec<f64>>,
        targets: Vec<f64>,
    ) -> HlResult<Self> {
        let n_cols = rows
            .first()
            .map(Vec::len)
            .unwrap_or(feature_names.len());
        let n_rows = rows.len();
        let mut flat = Vec::with_capacity(n_rows * n_cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n_cols {
                return Err(DataError::InvalidShape {
                    message: format!("row {i} has {} values, expected {n_cols}", row.len()),
                }
                .into());
            }
            flat.extend(row);
        }
        let features = Array2::from_shape_vec((n_rows, n_cols), flat).map_err(|e| {
            DataError::InvalidShape {
                message: e.to_string(),
            }
        })?;
        Self::new(feature_names, features, Array1::from(targets))
    }

    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples() == 0
    }
}
