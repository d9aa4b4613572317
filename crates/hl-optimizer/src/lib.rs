//! # hl-optimizer
//!
//! Hyperparameter search for Hyperlift.
//!
//! Provides conditional search space definitions over model families, a
//! Tree-structured Parzen Estimator sampler, trial tracking, and the
//! sequential driver that evaluates proposals against an [`Objective`].

mod optimizer;
mod search;
mod tpe;
mod trial;

pub use optimizer::{FnObjective, Objective, Optimizer, OptimizerConfig, SearchOutcome};
pub use search::{Distribution, FamilySpace, ParameterDef, SearchSpace, RANDOM_STATE};
pub use tpe::TpeSampler;
pub use trial::{History, Trial, TrialOutcome};
