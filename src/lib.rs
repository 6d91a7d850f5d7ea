pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;

pub use config::Configuration;
pub use error::{ClaimError, FrameStoreError, PipelineError};
pub use pipeline::controller::{IngestOutcome, PipelineBuilder, PipelineController};
pub use pipeline::store::{FrameStore, Herder};
