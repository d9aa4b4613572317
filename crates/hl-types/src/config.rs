//! Model families and sampled hyperparameter configurations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::ConfigurationError;

/// Key under which the family discriminator is logged and serialized.
pub const FAMILY_KEY: &str = "type";

/// The model families Hyperlift knows how to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    /// L2-regularized linear regression.
    Ridge,
    /// Gradient-boosted regression tree ensemble.
    #[serde(rename = "XGBRegressor")]
    GradientBoosting,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 2] = [ModelFamily::Ridge, ModelFamily::GradientBoosting];

    /// Discriminator string carried by configurations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ridge => "Ridge",
            Self::GradientBoosting => "XGBRegressor",
        }
    }

    /// Artifact path the fitted model is logged under.
    pub fn model_artifact_path(&self) -> &'static str {
        match self {
            Self::Ridge => "ridge_model",
            Self::GradientBoosting => "xgb_model",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ridge" => Ok(Self::Ridge),
            "XGBRegressor" => Ok(Self::GradientBoosting),
            other => Err(ConfigurationError::UnknownFamily {
                family: other.to_string(),
            }),
        }
    }
}

/// A concrete hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// One sampled configuration: a family discriminator plus that family's
/// parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "type")]
    family: String,
    #[serde(flatten)]
    params: BTreeMap<String, ParameterValue>,
}

impl Configuration {
    pub fn new(family: impl Into<String>, params: BTreeMap<String, ParameterValue>) -> Self {
        Self {
            family: family.into(),
            params,
        }
    }

    /// Raw discriminator (may name a family nobody registered).
    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn params(&self) -> &BTreeMap<String, ParameterValue> {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<ParameterValue> {
        self.params.get(name).copied()
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Parameters as strings with the discriminator re-attached, ready to be
    /// logged as run params.
    pub fn to_logged_params(&self) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        out.insert(FAMILY_KEY.to_string(), self.family.clone());
        out
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.family)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ridge_config() -> Configuration {
        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), ParameterValue::Float(0.25));
        params.insert("random_state".to_string(), ParameterValue::Int(42));
        Configuration::new("Ridge", params)
    }

    #[test]
    fn family_parsing() {
        assert_eq!("Ridge".parse::<ModelFamily>(), Ok(ModelFamily::Ridge));
        assert_eq!(
            "XGBRegressor".parse::<ModelFamily>(),
            Ok(ModelFamily::GradientBoosting)
        );
        assert_eq!(
            "Lasso".parse::<ModelFamily>(),
            Err(ConfigurationError::UnknownFamily {
                family: "Lasso".into()
            })
        );
    }

    #[test]
    fn configuration_serializes_flat_with_discriminator() {
        let json = serde_json::to_value(ridge_config()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "Ridge", "alpha": 0.25, "random_state": 42})
        );

        let back: Configuration = serde_json::from_value(json).unwrap();
        assert_eq!(back.get("random_state"), Some(ParameterValue::Int(42)));
        assert_eq!(back.get("alpha"), Some(ParameterValue::Float(0.25)));
    }

    #[test]
    fn logged_params_carry_type() {
        let logged = ridge_config().to_logged_params();
        assert_eq!(logged.get("type").map(String::as_str), Some("Ridge"));
        assert_eq!(logged.get("alpha").map(String::as_str), Some("0.25"));
        assert_eq!(logged.len(), 3);
    }

    #[test]
    fn display_is_ordered() {
        assert_eq!(
            ridge_config().to_string(),
            "Ridge(alpha=0.25, random_state=42)"
        );
    }
}
