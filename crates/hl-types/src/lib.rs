pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod settings;

pub use artifacts::*;
pub use config::*;
pub use dataset::*;
pub use errors::*;
pub use settings::*;
