use thiserror::Error;

use crate::pipeline::services::tracking::MarkerKind;
use crate::pipeline::types::{FrameNumber, Stage};

// Main Application Error Type

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),
    #[error("Frame store error: {0}")]
    Store(#[from] FrameStoreError),
    #[error("A tracker for marker <{0}> is already registered")]
    DuplicateTracker(MarkerKind),
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Failed to spawn thread {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Frame Store Error Type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameStoreError {
    #[error("Frame store is at capacity ({capacity} frames)")]
    Backpressure { capacity: usize },
    #[error("Frame store is draining and no longer accepts frames")]
    Draining,
    #[error("Frame {0} is already in the frame store")]
    DuplicateFrame(FrameNumber),
    #[error("Frame {0} not found")]
    FrameNotFound(FrameNumber),
    #[error("Frame {frame} is at stage {actual}, not {expected}")]
    WrongStage {
        frame: FrameNumber,
        expected: Stage,
        actual: Stage,
    },
    #[error("Checkpoint \"{name}\" is not registered for stage {stage}")]
    UnknownCheckpoint { stage: Stage, name: String },
    #[error("Checkpoint \"{0}\" cannot be registered against the GONE stage")]
    CheckpointOnGone(String),
}

impl FrameStoreError {
    /// Contract violations are caller bugs; everything else is a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FrameStoreError::DuplicateFrame(_)
                | FrameStoreError::WrongStage { .. }
                | FrameStoreError::UnknownCheckpoint { .. }
                | FrameStoreError::CheckpointOnGone(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("Candidate {index} is already assigned to <{owner}>")]
    AlreadyAssigned { index: usize, owner: MarkerKind },
    #[error("Candidate index {0} is out of bounds")]
    OutOfBounds(usize),
}
