use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type FrameNumber = u64;

/// Identifies a frame in both sequence and stream time, so late-arriving
/// data (audio, transcription) can be correlated with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTimestamps {
    pub frame_number: FrameNumber,
    /// Presentation time of the frame relative to the start of the stream.
    pub start_seconds: f64,
    /// Presentation time of the following frame, as far as it is known.
    pub estimated_end_seconds: f64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl FrameTimestamps {
    pub fn new(frame_number: FrameNumber, start_seconds: f64, estimated_end_seconds: f64) -> Self {
        Self {
            frame_number,
            start_seconds,
            estimated_end_seconds,
            captured_at: Utc::now(),
        }
    }

    /// Timestamps for the `frame_number`-th frame of a constant-rate stream.
    pub fn at_frame_rate(frame_number: FrameNumber, fps: f64) -> Self {
        let period = 1.0 / fps;
        let start = frame_number as f64 * period;
        Self::new(frame_number, start, start + period)
    }

    /// Stream-time distance from `earlier` to `self`, in seconds.
    pub fn seconds_since(&self, earlier: &FrameTimestamps) -> f64 {
        self.start_seconds - earlier.start_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_rate_timestamps_line_up() {
        let a = FrameTimestamps::at_frame_rate(30, 30.0);
        let b = FrameTimestamps::at_frame_rate(45, 30.0);
        assert!((a.start_seconds - 1.0).abs() < 1e-9);
        assert!((b.seconds_since(&a) - 0.5).abs() < 1e-9);
        assert!((a.estimated_end_seconds - a.start_seconds - 1.0 / 30.0).abs() < 1e-9);
    }
}
