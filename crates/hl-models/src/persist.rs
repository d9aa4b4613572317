//! On-disk model format: a directory with an `MLmodel` metadata file and the
//! fitted state in `model.json`.

use chrono::{DateTime, Utc};
use hl_types::{HlResult, ModelFamily};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::gbt::GradientBoostingRegressor;
use crate::ridge::RidgeRegressor;
use crate::Regressor;

pub const MODEL_FILE: &str = "model.json";
pub const MLMODEL_FILE: &str = "MLmodel";

/// Fitted state of any supported family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum SavedModel {
    Ridge(RidgeRegressor),
    #[serde(rename = "XGBRegressor")]
    GradientBoosting(GradientBoostingRegressor),
}

impl SavedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Ridge(_) => ModelFamily::Ridge,
            Self::GradientBoosting(_) => ModelFamily::GradientBoosting,
        }
    }

    pub fn into_regressor(self) -> Box<dyn Regressor> {
        match self {
            Self::Ridge(model) => Box::new(model),
            Self::GradientBoosting(model) => Box::new(model),
        }
    }
}

/// Contents of the `MLmodel` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub family: ModelFamily,
    pub flavor: String,
    pub run_id: Option<String>,
    pub model_file: String,
    pub created_at: DateTime<Utc>,
}

/// Write `model` into `dir`, returning the files written.
pub fn save_model(model: &dyn Regressor, dir: &Path, run_id: Option<&str>) -> HlResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let metadata = ModelMetadata {
        family: model.family(),
        flavor: "hyperlift".to_string(),
        run_id: run_id.map(str::to_string),
        model_file: MODEL_FILE.to_string(),
        created_at: Utc::now(),
    };

    let metadata_path = dir.join(MLMODEL_FILE);
    std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)?;

    let model_path = dir.join(MODEL_FILE);
    std::fs::write(&model_path, serde_json::to_vec(&model.snapshot())?)?;

    debug!(family = %model.family(), dir = %dir.display(), "Saved model");
    Ok(vec![metadata_path, model_path])
}

/// Load a model directory written by [`save_model`].
pub fn load_model(dir: &Path) -> HlResult<Box<dyn Regressor>> {
    let model_file = match std::fs::read(dir.join(MLMODEL_FILE)) {
        Ok(bytes) => serde_json::from_slice::<ModelMetadata>(&bytes)?.model_file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MODEL_FILE.to_string(),
        Err(e) => return Err(e.into()),
    };

    let path = dir.join(&model_file);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("model file {} not found", path.display()),
        )
        .into());
    }
    let saved: SavedModel = serde_json::from_slice(&std::fs::read(&path)?)?;
    debug!(family = %saved.family(), path = %path.display(), "Loaded model");
    Ok(saved.into_regressor())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{GbtParams, RidgeParams};
    use ndarray::array;
    use tempfile::tempdir;

    fn assert_close(a: &ndarray::Array1<f64>, b: &ndarray::Array1<f64>) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{x} vs {y}");
        }
    }

    #[test]
    fn ridge_round_trip_predicts_identically() {
        let mut model = RidgeRegressor::new(RidgeParams {
            alpha: 0.5,
            random_state: 42,
        });
        let x = array![[1.0, 2.0], [2.0, 1.0], [3.0, 4.0]];
        let y = array![1.0, 2.0, 3.0];
        model.fit(&x, &y).unwrap();

        let dir = tempdir().unwrap();
        let files = save_model(&model, dir.path(), Some("run-1")).unwrap();
        assert_eq!(files.len(), 2);

        let loaded = load_model(dir.path()).unwrap();
        assert_eq!(loaded.family(), ModelFamily::Ridge);
        assert_close(&loaded.predict(&x).unwrap(), &model.predict(&x).unwrap());
    }

    #[test]
    fn gbt_round_trip_predicts_identically() {
        let mut model = GradientBoostingRegressor::new(GbtParams {
            max_depth: 2,
            n_estimators: 5,
            learning_rate: 0.3,
            subsample: 1.0,
            colsample_bytree: 1.0,
            random_state: 1,
        });
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![1.0, 1.0, 5.0, 5.0];
        model.fit(&x, &y).unwrap();

        let dir = tempdir().unwrap();
        save_model(&model, dir.path(), None).unwrap();

        let meta: ModelMetadata =
            serde_json::from_slice(&std::fs::read(dir.path().join(MLMODEL_FILE)).unwrap())
                .unwrap();
        assert_eq!(meta.family, ModelFamily::GradientBoosting);

        let loaded = load_model(dir.path()).unwrap();
        assert_close(&loaded.predict(&x).unwrap(), &model.predict(&x).unwrap());
    }

    #[test]
    fn missing_model_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_model(dir.path()).is_err());
    }
}
