//! Search space definitions: model families and their parameter distributions.

use hl_types::{space_error, Configuration, ConfigurationError, ModelFamily, ParameterValue};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seed baked into every family as a constant parameter.
pub const RANDOM_STATE: i64 = 42;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Uniform draw rounded to the nearest multiple of `step`; emitted as an
    /// integer when `integer` is set.
    QUniform {
        low: f64,
        high: f64,
        step: f64,
        integer: bool,
    },
    /// Always the same value.
    Constant { value: ParameterValue },
}

impl Distribution {
    /// Draw from the prior.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Uniform { low, high } => ParameterValue::Float(uniform(rng, *low, *high)),
            Self::LogUniform { low, high } => {
                ParameterValue::Float(uniform(rng, low.ln(), high.ln()).exp().clamp(*low, *high))
            }
            Self::QUniform { low, high, .. } => self.quantize(uniform(rng, *low, *high)),
            Self::Constant { value } => *value,
        }
    }

    /// Snap a raw value onto the grid of a quantized distribution. Other
    /// kinds pass the value through (clamped to bounds).
    pub fn quantize(&self, raw: f64) -> ParameterValue {
        match self {
            Self::QUniform {
                low,
                high,
                step,
                integer,
            } => {
                let snapped = ((raw / step).round() * step).clamp(*low, *high);
                if *integer {
                    ParameterValue::Int(snapped.round() as i64)
                } else {
                    ParameterValue::Float(snapped)
                }
            }
            Self::Uniform { low, high } | Self::LogUniform { low, high } => {
                ParameterValue::Float(raw.clamp(*low, *high))
            }
            Self::Constant { value } => *value,
        }
    }

    /// Bounds of the space the density estimator works in (log-space for
    /// log-uniform). `None` for constants.
    pub fn model_bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Uniform { low, high } | Self::QUniform { low, high, .. } => Some((*low, *high)),
            Self::LogUniform { low, high } => Some((low.ln(), high.ln())),
            Self::Constant { .. } => None,
        }
    }

    pub fn to_model_space(&self, value: f64) -> f64 {
        match self {
            Self::LogUniform { .. } => value.ln(),
            _ => value,
        }
    }

    /// Map a model-space value back to a parameter value of this kind.
    pub fn from_model_space(&self, value: f64) -> ParameterValue {
        match self {
            Self::LogUniform { .. } => self.quantize(value.exp()),
            _ => self.quantize(value),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::QUniform { .. })
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn admits(&self, value: ParameterValue) -> bool {
        const EPS: f64 = 1e-9;
        match self {
            Self::Uniform { low, high } | Self::LogUniform { low, high } => {
                let v = value.as_f64();
                v >= *low - EPS && v <= *high + EPS
            }
            Self::QUniform { low, high, integer, .. } => {
                let in_range = value.as_f64() >= *low - EPS && value.as_f64() <= *high + EPS;
                in_range && (!*integer || matches!(value, ParameterValue::Int(_)))
            }
            Self::Constant { value: expected } => *expected == value,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        match self {
            Self::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(space_error!("'{name}': uniform needs finite low < high"));
                }
            }
            Self::LogUniform { low, high } => {
                if !(*low > 0.0 && high.is_finite() && low < high) {
                    return Err(space_error!("'{name}': log-uniform needs 0 < low < high"));
                }
            }
            Self::QUniform {
                low, high, step, ..
            } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(space_error!("'{name}': quantized uniform needs finite low < high"));
                }
                if !(step.is_finite() && *step > 0.0) {
                    return Err(space_error!("'{name}': step must be positive"));
                }
            }
            Self::Constant { .. } => {}
        }
        Ok(())
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    low + rng.gen::<f64>() * (high - low)
}

/// A single parameter dimension of a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Constructor argument name (e.g. "max_depth").
    pub name: String,
    pub distribution: Distribution,
}

/// One branch of the search space: a model family and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilySpace {
    pub family: String,
    /// Relative probability of choosing this family from the prior.
    pub weight: f64,
    pub parameters: Vec<ParameterDef>,
}

impl FamilySpace {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            weight: 1.0,
            parameters: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    fn add(mut self, name: impl Into<String>, distribution: Distribution) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            distribution,
        });
        self
    }

    pub fn uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Distribution::Uniform { low, high })
    }

    pub fn log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Distribution::LogUniform { low, high })
    }

    pub fn quniform(self, name: impl Into<String>, low: f64, high: f64, step: f64) -> Self {
        self.add(
            name,
            Distribution::QUniform {
                low,
                high,
                step,
                integer: false,
            },
        )
    }

    /// Quantized uniform cast to an integer.
    pub fn int_range(self, name: impl Into<String>, low: i64, high: i64, step: i64) -> Self {
        self.add(
            name,
            Distribution::QUniform {
                low: low as f64,
                high: high as f64,
                step: step as f64,
                integer: true,
            },
        )
    }

    pub fn constant(self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.add(
            name,
            Distribution::Constant {
                value: value.into(),
            },
        )
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Draw every parameter of this family from its prior.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let params: BTreeMap<String, ParameterValue> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.distribution.sample(rng)))
            .collect();
        Configuration::new(self.family.clone(), params)
    }
}

/// The full search space: a weighted choice over model families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub families: Vec<FamilySpace>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            families: Vec::new(),
        }
    }

    pub fn with_family(mut self, family: FamilySpace) -> Self {
        self.families.push(family);
        self
    }

    /// Ridge and gradient-boosted trees with the bounds used for the
    /// delivery-duration models.
    pub fn default_regression() -> Self {
        Self::new()
            .with_family(
                FamilySpace::new(ModelFamily::GradientBoosting.as_str())
                    .int_range("max_depth", 3, 6, 1)
                    .int_range("n_estimators", 10, 50, 10)
                    .uniform("learning_rate", 0.1, 0.3)
                    .uniform("subsample", 0.8, 1.0)
                    .uniform("colsample_bytree", 0.8, 1.0)
                    .constant("random_state", RANDOM_STATE),
            )
            .with_family(
                FamilySpace::new(ModelFamily::Ridge.as_str())
                    .log_uniform("alpha", 0.001, 1.0)
                    .constant("random_state", RANDOM_STATE),
            )
    }

    pub fn families(&self) -> &[FamilySpace] {
        &self.families
    }

    pub fn family(&self, name: &str) -> Option<&FamilySpace> {
        self.families.iter().find(|f| f.family == name)
    }

    pub fn family_index(&self, name: &str) -> Option<usize> {
        self.families.iter().position(|f| f.family == name)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.families.is_empty() {
            return Err(space_error!("no model families"));
        }
        for (i, family) in self.families.iter().enumerate() {
            if self.families[..i].iter().any(|f| f.family == family.family) {
                return Err(space_error!("family '{}' declared twice", family.family));
            }
            if !(family.weight.is_finite() && family.weight > 0.0) {
                return Err(space_error!("family '{}' needs a positive weight", family.family));
            }
            for (j, param) in family.parameters.iter().enumerate() {
                if family.parameters[..j].iter().any(|p| p.name == param.name) {
                    return Err(space_error!(
                        "parameter '{}' declared twice in '{}'",
                        param.name,
                        family.family
                    ));
                }
                param.distribution.validate(&param.name)?;
            }
        }
        Ok(())
    }

    /// Normalized prior probability of each family.
    pub fn family_probabilities(&self) -> Vec<f64> {
        let total: f64 = self.families.iter().map(|f| f.weight).sum();
        self.families.iter().map(|f| f.weight / total).collect()
    }

    /// Prior draw: choose a family by weight, then draw its parameters.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let probabilities = self.family_probabilities();
        let idx = categorical(rng, &probabilities);
        self.families[idx].sample(rng)
    }

    /// Check that `config` belongs to this space: known family, exactly its
    /// declared parameters, each admissible under its distribution.
    pub fn check(&self, config: &Configuration) -> Result<(), ConfigurationError> {
        let family =
            self.family(config.family())
                .ok_or_else(|| ConfigurationError::UnknownFamily {
                    family: config.family().to_string(),
                })?;

        for def in &family.parameters {
            let value =
                config
                    .get(&def.name)
                    .ok_or_else(|| ConfigurationError::MissingParameter {
                        family: family.family.clone(),
                        parameter: def.name.clone(),
                    })?;
            if !def.distribution.admits(value) {
                return Err(ConfigurationError::OutOfRange {
                    parameter: def.name.clone(),
                    message: format!("{value} not admitted by {:?}", def.distribution),
                });
            }
        }
        if let Some(extra) = config
            .parameter_names()
            .find(|name| family.parameter(name).is_none())
        {
            return Err(ConfigurationError::UnexpectedParameter {
                family: family.family.clone(),
                parameter: extra.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Index drawn from normalized `probabilities`; always consumes one draw.
pub(crate) fn categorical<R: Rng + ?Sized>(rng: &mut R, probabilities: &[f64]) -> usize {
    let r: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, p) in probabilities.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probabilities.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeSet;

    fn names(config: &Configuration) -> BTreeSet<String> {
        config.parameter_names().map(str::to_string).collect()
    }

    #[test]
    fn default_space_is_valid() {
        let space = SearchSpace::default_regression();
        space.validate().unwrap();
        assert_eq!(space.families.len(), 2);
        assert!(space.family("Ridge").is_some());
        assert!(space.family("XGBRegressor").is_some());
    }

    #[test]
    fn samples_carry_exactly_their_family_schema() {
        let space = SearchSpace::default_regression();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut seen = BTreeSet::new();

        for _ in 0..200 {
            let config = space.sample(&mut rng);
            let family = space.family(config.family()).unwrap();
            let declared: BTreeSet<String> =
                family.parameter_names().map(str::to_string).collect();
            assert_eq!(names(&config), declared);
            space.check(&config).unwrap();
            seen.insert(config.family().to_string());
        }
        assert_eq!(seen.len(), 2, "both families should be drawn");
    }

    #[test]
    fn quantized_integers_land_on_grid() {
        let space = SearchSpace::default_regression();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let xgb = space.family("XGBRegressor").unwrap();

        for _ in 0..100 {
            let config = xgb.sample(&mut rng);
            match config.get("n_estimators") {
                Some(ParameterValue::Int(v)) => {
                    assert!((10..=50).contains(&v) && v % 10 == 0, "n_estimators = {v}")
                }
                other => panic!("unexpected n_estimators value: {other:?}"),
            }
            match config.get("max_depth") {
                Some(ParameterValue::Int(v)) => assert!((3..=6).contains(&v)),
                other => panic!("unexpected max_depth value: {other:?}"),
            }
            assert_eq!(config.get("random_state"), Some(ParameterValue::Int(42)));
        }
    }

    #[test]
    fn log_uniform_stays_in_bounds() {
        let dist = Distribution::LogUniform {
            low: 1e-3,
            high: 1.0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..500 {
            let v = dist.sample(&mut rng).as_f64();
            assert!((1e-3..=1.0).contains(&v), "alpha out of bounds: {v}");
        }
    }

    #[test]
    fn family_weights_bias_the_choice() {
        let space = SearchSpace::new()
            .with_family(FamilySpace::new("a").with_weight(9.0).uniform("x", 0.0, 1.0))
            .with_family(FamilySpace::new("b").uniform("y", 0.0, 1.0));
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let a_count = (0..1000)
            .filter(|_| space.sample(&mut rng).family() == "a")
            .count();
        assert!(a_count > 800, "a drawn {a_count} times");
    }

    #[test]
    fn same_seed_same_samples() {
        let space = SearchSpace::default_regression();
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            assert_eq!(space.sample(&mut a), space.sample(&mut b));
        }
    }

    #[test]
    fn validate_rejects_bad_spaces() {
        assert!(SearchSpace::new().validate().is_err());

        let bad_log = SearchSpace::new().with_family(FamilySpace::new("r").log_uniform("alpha", 0.0, 1.0));
        assert!(bad_log.validate().is_err());

        let bad_step =
            SearchSpace::new().with_family(FamilySpace::new("g").quniform("d", 1.0, 5.0, 0.0));
        assert!(bad_step.validate().is_err());

        let dup = SearchSpace::new()
            .with_family(FamilySpace::new("r").uniform("x", 0.0, 1.0))
            .with_family(FamilySpace::new("r").uniform("x", 0.0, 1.0));
        assert!(dup.validate().is_err());

        let zero_weight = SearchSpace::new()
            .with_family(FamilySpace::new("r").with_weight(0.0).uniform("x", 0.0, 1.0));
        assert!(zero_weight.validate().is_err());
    }

    #[test]
    fn check_rejects_foreign_parameters() {
        let space = SearchSpace::default_regression();
        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), ParameterValue::Float(0.1));
        params.insert("random_state".to_string(), ParameterValue::Int(42));
        params.insert("max_depth".to_string(), ParameterValue::Int(4));
        let config = Configuration::new("Ridge", params);
        assert!(matches!(
            space.check(&config),
            Err(ConfigurationError::UnexpectedParameter { .. })
        ));

        let lasso = Configuration::new("Lasso", BTreeMap::new());
        assert!(matches!(
            space.check(&lasso),
            Err(ConfigurationError::UnknownFamily { .. })
        ));
    }

    #[test]
    fn quantize_rounds_and_clamps() {
        let dist = Distribution::QUniform {
            low: 10.0,
            high: 50.0,
            step: 10.0,
            integer: true,
        };
        assert_eq!(dist.quantize(14.9), ParameterValue::Int(10));
        assert_eq!(dist.quantize(15.1), ParameterValue::Int(20));
        assert_eq!(dist.quantize(58.0), ParameterValue::Int(50));
        assert_eq!(dist.quantize(2.0), ParameterValue::Int(10));
    }
}
