mod geometry;
mod stage;
mod timestamps;
mod working_frame;

pub use geometry::{Point, Rect};
pub use stage::{Stage, STAGE_COUNT};
pub use timestamps::{FrameNumber, FrameTimestamps};
pub use working_frame::{DetectionScaling, WorkingFrame};
