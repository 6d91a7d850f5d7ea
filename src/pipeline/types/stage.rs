use serde::{Deserialize, Serialize};
use std::fmt;

pub const STAGE_COUNT: usize = 8;

/// Processing stages a frame moves through, strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Inserted, no processing has happened yet.
    New = 0,
    /// Primary face region is being classified.
    Detection = 1,
    /// Face landmarks and pose are being recovered.
    Tracking = 2,
    /// Marker positions are being recovered.
    Mapping = 3,
    /// Frame is being previewed.
    Previewing = 4,
    /// Eligible for late-stage consumers such as transcription.
    LateProcessing = 5,
    /// Last call before the frame is destroyed (frame data output).
    Draining = 6,
    /// Frame is about to be freed. Nothing may gate this stage.
    Gone = 7,
}

impl Stage {
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::New,
        Stage::Detection,
        Stage::Tracking,
        Stage::Mapping,
        Stage::Previewing,
        Stage::LateProcessing,
        Stage::Draining,
        Stage::Gone,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The following stage. GONE is terminal and maps to itself.
    pub fn next(self) -> Stage {
        match self {
            Stage::New => Stage::Detection,
            Stage::Detection => Stage::Tracking,
            Stage::Tracking => Stage::Mapping,
            Stage::Mapping => Stage::Previewing,
            Stage::Previewing => Stage::LateProcessing,
            Stage::LateProcessing => Stage::Draining,
            Stage::Draining => Stage::Gone,
            Stage::Gone => Stage::Gone,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Gone
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::New => "NEW",
            Stage::Detection => "DETECTION",
            Stage::Tracking => "TRACKING",
            Stage::Mapping => "MAPPING",
            Stage::Previewing => "PREVIEWING",
            Stage::LateProcessing => "LATE_PROCESSING",
            Stage::Draining => "DRAINING",
            Stage::Gone => "GONE",
        }
    }
}

impl TryFrom<u8> for Stage {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stage::ALL.get(value as usize).copied().ok_or(value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
