//! # hl-promote
//!
//! Out-of-loop steps that run after a search: publishing the latest
//! registered model version to an artifact bucket, and scoring a test split
//! with it.

pub mod applier;
pub mod promoter;
pub mod store;

pub use applier::ModelApplier;
pub use promoter::{destination_prefix, ModelPromoter};
pub use store::{validate_bucket_name, ArtifactStore, LocalBucketStore, MemoryBucketStore};
