pub mod controller;
pub mod services;
pub mod store;
pub mod types;
pub mod workers;

pub use controller::{IngestOutcome, PipelineBuilder, PipelineController};
pub use store::{FrameStore, Herder};
pub use types::{FrameNumber, FrameTimestamps, Stage, WorkingFrame};
