//! Typed model specifications built from sampled configurations.

use hl_types::{Configuration, ConfigurationError, ModelFamily, ParameterValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::gbt::GradientBoostingRegressor;
use crate::ridge::RidgeRegressor;
use crate::Regressor;

/// Constructor parameters of [`RidgeRegressor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeParams {
    /// L2 regularization strength.
    pub alpha: f64,
    pub random_state: i64,
}

/// Constructor parameters of [`GradientBoostingRegressor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtParams {
    pub max_depth: usize,
    pub n_estimators: usize,
    pub learning_rate: f64,
    /// Fraction of rows sampled per tree.
    pub subsample: f64,
    /// Fraction of columns sampled per tree.
    pub colsample_bytree: f64,
    pub random_state: u64,
}

/// A configuration instantiated into exactly one model family.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSpec {
    Ridge(RidgeParams),
    GradientBoosting(GbtParams),
}

impl ModelSpec {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Ridge(_) => ModelFamily::Ridge,
            Self::GradientBoosting(_) => ModelFamily::GradientBoosting,
        }
    }

    /// Construct an unfitted model for this spec.
    pub fn build(self) -> Box<dyn Regressor> {
        match self {
            Self::Ridge(params) => Box::new(RidgeRegressor::new(params)),
            Self::GradientBoosting(params) => Box::new(GradientBoostingRegressor::new(params)),
        }
    }
}

impl TryFrom<&Configuration> for ModelSpec {
    type Error = ConfigurationError;

    fn try_from(config: &Configuration) -> Result<Self, Self::Error> {
        let family: ModelFamily = config.family().parse()?;
        let mut reader = ParamReader::new(config, family);

        let spec = match family {
            ModelFamily::Ridge => {
                let alpha = reader.float("alpha")?;
                if !(alpha.is_finite() && alpha >= 0.0) {
                    return Err(out_of_range("alpha", "must be a finite value >= 0"));
                }
                Self::Ridge(RidgeParams {
                    alpha,
                    random_state: reader.int("random_state")?,
                })
            }
            ModelFamily::GradientBoosting => {
                let max_depth = reader.int("max_depth")?;
                let n_estimators = reader.int("n_estimators")?;
                let learning_rate = reader.float("learning_rate")?;
                let subsample = reader.float("subsample")?;
                let colsample_bytree = reader.float("colsample_bytree")?;
                let random_state = reader.int("random_state")?;

                if max_depth < 1 {
                    return Err(out_of_range("max_depth", "must be >= 1"));
                }
                if n_estimators < 1 {
                    return Err(out_of_range("n_estimators", "must be >= 1"));
                }
                if !(learning_rate.is_finite() && learning_rate > 0.0) {
                    return Err(out_of_range("learning_rate", "must be > 0"));
                }
                for (name, ratio) in [
                    ("subsample", subsample),
                    ("colsample_bytree", colsample_bytree),
                ] {
                    if !(ratio > 0.0 && ratio <= 1.0) {
                        return Err(out_of_range(name, "must be in (0, 1]"));
                    }
                }
                if random_state < 0 {
                    return Err(out_of_range("random_state", "must be >= 0"));
                }

                Self::GradientBoosting(GbtParams {
                    max_depth: max_depth as usize,
                    n_estimators: n_estimators as usize,
                    learning_rate,
                    subsample,
                    colsample_bytree,
                    random_state: random_state as u64,
                })
            }
        };

        reader.finish()?;
        Ok(spec)
    }
}

fn out_of_range(parameter: &str, message: &str) -> ConfigurationError {
    ConfigurationError::OutOfRange {
        parameter: parameter.to_string(),
        message: message.to_string(),
    }
}

/// Pulls named parameters out of a configuration and rejects leftovers.
struct ParamReader<'a> {
    config: &'a Configuration,
    family: ModelFamily,
    consumed: BTreeSet<&'a str>,
}

impl<'a> ParamReader<'a> {
    fn new(config: &'a Configuration, family: ModelFamily) -> Self {
        Self {
            config,
            family,
            consumed: BTreeSet::new(),
        }
    }

    fn take(&mut self, name: &str) -> Result<ParameterValue, ConfigurationError> {
        let config = self.config;
        let (key, value) = config.params().get_key_value(name).ok_or_else(|| {
            ConfigurationError::MissingParameter {
                family: self.family.to_string(),
                parameter: name.to_string(),
            }
        })?;
        self.consumed.insert(key.as_str());
        Ok(*value)
    }

    fn float(&mut self, name: &str) -> Result<f64, ConfigurationError> {
        self.take(name).map(|v| v.as_f64())
    }

    /// Integers, or floats with no fractional part.
    fn int(&mut self, name: &str) -> Result<i64, ConfigurationError> {
        match self.take(name)? {
            ParameterValue::Int(v) => Ok(v),
            ParameterValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as i64),
            ParameterValue::Float(_) => Err(ConfigurationError::WrongType {
                parameter: name.to_string(),
                expected: "integer".to_string(),
            }),
        }
    }

    fn finish(self) -> Result<(), ConfigurationError> {
        match self
            .config
            .parameter_names()
            .find(|name| !self.consumed.contains(name))
        {
            Some(extra) => Err(ConfigurationError::UnexpectedParameter {
                family: self.family.to_string(),
                parameter: extra.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(family: &str, params: &[(&str, ParameterValue)]) -> Configuration {
        let params: BTreeMap<String, ParameterValue> =
            params.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        Configuration::new(family, params)
    }

    fn xgb_params() -> Vec<(&'static str, ParameterValue)> {
        vec![
            ("max_depth", ParameterValue::Int(4)),
            ("n_estimators", ParameterValue::Int(20)),
            ("learning_rate", ParameterValue::Float(0.2)),
            ("subsample", ParameterValue::Float(0.9)),
            ("colsample_bytree", ParameterValue::Float(0.85)),
            ("random_state", ParameterValue::Int(42)),
        ]
    }

    #[test]
    fn ridge_spec_from_configuration() {
        let cfg = config(
            "Ridge",
            &[
                ("alpha", ParameterValue::Float(0.01)),
                ("random_state", ParameterValue::Int(42)),
            ],
        );
        let spec = ModelSpec::try_from(&cfg).unwrap();
        assert_eq!(
            spec,
            ModelSpec::Ridge(RidgeParams {
                alpha: 0.01,
                random_state: 42
            })
        );
        assert_eq!(spec.family(), ModelFamily::Ridge);
    }

    #[test]
    fn gbt_spec_accepts_integral_floats() {
        let mut params = xgb_params();
        params[0] = ("max_depth", ParameterValue::Float(5.0));
        let spec = ModelSpec::try_from(&config("XGBRegressor", &params)).unwrap();
        match spec {
            ModelSpec::GradientBoosting(p) => {
                assert_eq!(p.max_depth, 5);
                assert_eq!(p.n_estimators, 20);
                assert_eq!(p.random_state, 42);
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn unknown_family_is_rejected() {
        let cfg = config("Lasso", &[("alpha", ParameterValue::Float(0.1))]);
        assert_eq!(
            ModelSpec::try_from(&cfg),
            Err(ConfigurationError::UnknownFamily {
                family: "Lasso".into()
            })
        );
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let cfg = config("Ridge", &[("alpha", ParameterValue::Float(0.1))]);
        assert!(matches!(
            ModelSpec::try_from(&cfg),
            Err(ConfigurationError::MissingParameter { parameter, .. }) if parameter == "random_state"
        ));
    }

    #[test]
    fn foreign_parameter_is_rejected() {
        let cfg = config(
            "Ridge",
            &[
                ("alpha", ParameterValue::Float(0.1)),
                ("random_state", ParameterValue::Int(42)),
                ("max_depth", ParameterValue::Int(3)),
            ],
        );
        assert!(matches!(
            ModelSpec::try_from(&cfg),
            Err(ConfigurationError::UnexpectedParameter { parameter, .. }) if parameter == "max_depth"
        ));
    }

    #[test]
    fn fractional_integer_is_wrong_type() {
        let mut params = xgb_params();
        params[1] = ("n_estimators", ParameterValue::Float(10.5));
        assert!(matches!(
            ModelSpec::try_from(&config("XGBRegressor", &params)),
            Err(ConfigurationError::WrongType { .. })
        ));
    }

    #[test]
    fn ratio_bounds_are_checked() {
        let mut params = xgb_params();
        params[3] = ("subsample", ParameterValue::Float(1.5));
        assert!(matches!(
            ModelSpec::try_from(&config("XGBRegressor", &params)),
            Err(ConfigurationError::OutOfRange { parameter, .. }) if parameter == "subsample"
        ));
    }
}
