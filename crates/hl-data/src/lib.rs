pub mod loaders;
pub mod output;

pub use loaders::*;
pub use output::*;
