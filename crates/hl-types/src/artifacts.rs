use serde::{Deserialize, Serialize};

/// What an interpretability artifact describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// Normalized per-feature importances of a tree ensemble.
    FeatureImportance,
    /// Linear model coefficients, one per feature.
    Coefficients,
}

/// Auxiliary per-trial output logged next to the metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialArtifact {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub feature_names: Vec<String>,
    pub values: Vec<f64>,
}

impl TrialArtifact {
    pub fn feature_importance(feature_names: Vec<String>, values: Vec<f64>) -> Self {
        Self {
            kind: ArtifactKind::FeatureImportance,
            file_name: "feature_importance.json".to_string(),
            feature_names,
            values,
        }
    }

    pub fn coefficients(feature_names: Vec<String>, values: Vec<f64>) -> Self {
        Self {
            kind: ArtifactKind::Coefficients,
            file_name: "ridge_coefficients.json".to_string(),
            feature_names,
            values,
        }
    }
}
