pub mod config;
pub mod datasets;
pub mod error;
pub mod evaluate;
pub mod nn;
pub mod pipeline;
pub mod predictions;
pub mod train;
pub mod utils;

pub use config::{PipelineConfig, Preset};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, RunOutcome};
