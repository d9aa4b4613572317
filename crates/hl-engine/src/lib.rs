//! # hl-engine
//!
//! Ties the optimizer to real models and a tracking store: every proposed
//! configuration is trained, scored on the validation split and recorded as a
//! run. Also resolves the best run of an experiment after the fact and
//! registers its model.

pub mod evaluator;
pub mod recorder;
pub mod resolve;
pub mod session;

pub use evaluator::ObjectiveEvaluator;
pub use recorder::{TrialRecorder, MODEL_TAG};
pub use resolve::{
    latest_version, register_best_run, resolve_best_model, resolve_best_run, run_family,
    select_latest, BestModelReference,
};
pub use session::{run_search, SearchRequest, SearchSession};
