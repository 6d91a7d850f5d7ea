use super::timestamps::FrameTimestamps;
use image::imageops::{self, FilterType};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;

/// How the detection-scale buffer is derived from the native frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionScaling {
    /// Fit the frame inside a square of this many pixels (never upscales).
    BoundingBox(u32),
    /// Use a fixed factor.
    Factor(f64),
}

impl DetectionScaling {
    pub fn factor_for(&self, width: u32, height: u32) -> f64 {
        match *self {
            DetectionScaling::BoundingBox(size) => {
                let longest = width.max(height).max(1) as f64;
                (size as f64 / longest).min(1.0)
            }
            DetectionScaling::Factor(factor) => factor,
        }
    }
}

/// One captured image and its derived buffers.
///
/// The native and detection buffers are immutable once the frame is inserted,
/// so stage owners can read them without holding any lock. The preview buffer
/// is annotated by several stages and is only reachable through
/// [`WorkingFrame::with_preview`].
pub struct WorkingFrame {
    frame: Arc<RgbImage>,
    detection_frame: Arc<RgbImage>,
    detection_scale_factor: f64,
    preview_frame: Mutex<RgbImage>,
    timestamps: FrameTimestamps,
}

impl WorkingFrame {
    pub fn new(frame: RgbImage, timestamps: FrameTimestamps, scaling: DetectionScaling) -> Self {
        let (width, height) = frame.dimensions();
        let detection_scale_factor = scaling.factor_for(width, height);
        let detection_frame = if (detection_scale_factor - 1.0).abs() < f64::EPSILON {
            frame.clone()
        } else {
            let scaled_width = ((width as f64 * detection_scale_factor).round() as u32).max(1);
            let scaled_height = ((height as f64 * detection_scale_factor).round() as u32).max(1);
            imageops::resize(&frame, scaled_width, scaled_height, FilterType::Triangle)
        };
        let preview_frame = Mutex::new(frame.clone());

        Self {
            frame: Arc::new(frame),
            detection_frame: Arc::new(detection_frame),
            detection_scale_factor,
            preview_frame,
            timestamps,
        }
    }

    /// Native resolution buffer.
    pub fn frame(&self) -> &RgbImage {
        &self.frame
    }

    pub fn detection_frame(&self) -> &RgbImage {
        &self.detection_frame
    }

    pub fn detection_scale_factor(&self) -> f64 {
        self.detection_scale_factor
    }

    pub fn timestamps(&self) -> &FrameTimestamps {
        &self.timestamps
    }

    /// Exclusive access to the preview buffer for the duration of `f`.
    pub fn with_preview<R>(&self, f: impl FnOnce(&mut RgbImage) -> R) -> R {
        let mut preview = self.preview_frame.lock();
        f(&mut preview)
    }

    /// Copy of the preview buffer as it is right now.
    pub fn preview_snapshot(&self) -> RgbImage {
        self.preview_frame.lock().clone()
    }
}

impl std::fmt::Debug for WorkingFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingFrame")
            .field("frame_number", &self.timestamps.frame_number)
            .field("dimensions", &self.frame.dimensions())
            .field("detection_scale_factor", &self.detection_scale_factor)
            .finish()
    }
}
