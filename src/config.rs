use crate::error::PipelineError;
use crate::pipeline::services::tracking::MarkerKind;
use crate::pipeline::types::DetectionScaling;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FACECAP";

/// Top-level configuration, layered from defaults, an optional file and
/// `FACECAP__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub frame_store: FrameStoreConfig,
    pub classifier: ClassifierConfig,
    pub tracker: TrackerConfig,
    pub preview: PreviewConfig,
    pub output: OutputConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameStoreConfig {
    /// Maximum number of frames in flight.
    pub max_queue_depth: usize,
    /// Drop frames under backpressure instead of waiting for room.
    pub low_latency: bool,
    /// How often a blocked buffered ingest reports that it is still waiting.
    pub stall_log_ms: u64,
    /// Upper bound on how long the herder parks when nothing moved.
    pub herder_idle_ms: u64,
    /// Fit detection frames inside a square of this size; 0 uses `detection_scale_factor`.
    pub detection_bounding_box: u32,
    pub detection_scale_factor: f64,
    pub metrics_window: usize,
    /// Log throughput every N completed frames (0 disables).
    pub metrics_report_every: u64,
}

impl Default for FrameStoreConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 200,
            low_latency: false,
            stall_log_ms: 1000,
            herder_idle_ms: 100,
            detection_bounding_box: 320,
            detection_scale_factor: 0.5,
            metrics_window: 30,
            metrics_report_every: 300,
        }
    }
}

impl FrameStoreConfig {
    pub fn detection_scaling(&self) -> DetectionScaling {
        if self.detection_bounding_box > 0 {
            DetectionScaling::BoundingBox(self.detection_bounding_box)
        } else {
            DetectionScaling::Factor(self.detection_scale_factor)
        }
    }

    pub fn stall_log_interval(&self) -> Duration {
        Duration::from_millis(self.stall_log_ms)
    }

    pub fn herder_idle(&self) -> Duration {
        Duration::from_millis(self.herder_idle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Worker threads per available core.
    pub workers_per_cpu: f64,
    /// A classification stays usable for this many seconds of stream time.
    pub result_good_for_seconds: f64,
    /// Reuse the latest good result instead of running when it is younger than this.
    pub rerun_interval_seconds: f64,
    /// Fraction of detection-frame pixels that must look like skin to report a face.
    pub min_skin_fraction: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            workers_per_cpu: 0.5,
            result_good_for_seconds: 0.5,
            rerun_interval_seconds: 0.0,
            min_skin_fraction: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub markers: Vec<MarkerKind>,
    /// Size of the tracking box relative to the detected marker.
    pub tracking_box_percentage: f64,
    /// Allowed drift between tracked and detected point, relative to marker size.
    pub max_tracker_drift_percentage: f64,
    /// Marker search box relative to the face box.
    pub face_size_percentage: f64,
    /// Marker area bounds relative to the search box area.
    pub min_marker_area_percentage: f64,
    pub max_marker_area_percentage: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            markers: vec![
                MarkerKind::EyelidLeftTop,
                MarkerKind::EyelidLeftBottom,
                MarkerKind::EyelidRightTop,
                MarkerKind::EyelidRightBottom,
                MarkerKind::LipsLeftCorner,
                MarkerKind::LipsRightCorner,
                MarkerKind::Jaw,
            ],
            tracking_box_percentage: 1.5,
            max_tracker_drift_percentage: 0.75,
            face_size_percentage: 1.5,
            min_marker_area_percentage: 0.0002,
            max_marker_area_percentage: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// 0 = nothing, 1 = points, 2 = points and boxes.
    pub density: u8,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self { density: 2 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON-lines destination; stdout when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub frames: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frames: 300,
            fps: 30.0,
            width: 640,
            height: 480,
            seed: 7,
        }
    }
}

impl Configuration {
    /// Load defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let configuration: Configuration = builder.build()?.try_deserialize()?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), PipelineError> {
        let store = &self.frame_store;
        if store.max_queue_depth == 0 {
            return Err(PipelineError::Config(
                "frame_store.max_queue_depth must be greater than 0".to_string(),
            ));
        }
        if store.stall_log_ms == 0 {
            return Err(PipelineError::Config(
                "frame_store.stall_log_ms must be greater than 0".to_string(),
            ));
        }
        if store.detection_bounding_box == 0
            && !(store.detection_scale_factor > 0.0 && store.detection_scale_factor <= 1.0)
        {
            return Err(PipelineError::Config(
                "frame_store.detection_scale_factor must be in (0, 1]".to_string(),
            ));
        }

        let classifier = &self.classifier;
        if classifier.workers_per_cpu <= 0.0 {
            return Err(PipelineError::Config(
                "classifier.workers_per_cpu must be greater than 0".to_string(),
            ));
        }
        if classifier.result_good_for_seconds < 0.0 || classifier.rerun_interval_seconds < 0.0 {
            return Err(PipelineError::Config(
                "classifier time windows cannot be negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&classifier.min_skin_fraction) {
            return Err(PipelineError::Config(
                "classifier.min_skin_fraction must be between 0.0 and 1.0".to_string(),
            ));
        }

        let tracker = &self.tracker;
        if tracker.tracking_box_percentage <= 0.0 || tracker.max_tracker_drift_percentage <= 0.0 {
            return Err(PipelineError::Config(
                "tracker percentages must be greater than 0".to_string(),
            ));
        }
        if tracker.face_size_percentage <= 0.0 || tracker.face_size_percentage > 2.0 {
            return Err(PipelineError::Config(
                "tracker.face_size_percentage must be in (0, 2]".to_string(),
            ));
        }
        let area_range = 0.0..=1.0;
        if tracker.min_marker_area_percentage <= 0.0
            || !area_range.contains(&tracker.min_marker_area_percentage)
            || tracker.max_marker_area_percentage <= 0.0
            || !area_range.contains(&tracker.max_marker_area_percentage)
            || tracker.min_marker_area_percentage > tracker.max_marker_area_percentage
        {
            return Err(PipelineError::Config(
                "tracker marker area percentages must satisfy 0 < min <= max <= 1".to_string(),
            ));
        }

        if self.capture.fps <= 0.0 {
            return Err(PipelineError::Config(
                "capture.fps must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
