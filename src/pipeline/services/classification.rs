use crate::config::ClassifierConfig;
use crate::error::PipelineError;
use crate::pipeline::services::output::{FrameRecord, RecordSource};
use crate::pipeline::services::preview::{draw_rect_outline, HudLayer, PreviewDensity};
use crate::pipeline::store::FrameStore;
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Rect, Stage, WorkingFrame};
use crate::pipeline::workers::{FrameJob, PoolOptions, TimedResult, WorkerPool};
use image::{Rgb, RgbImage};
use serde::Serialize;

pub const FACE_CLASSIFIER_CHECKPOINT: &str = "face_classifier";

const HUD_COLOR: Rgb<u8> = Rgb([0, 128, 255]);

/// Where a face was found, in detection and native coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRegion {
    pub region: Rect,
    pub native_region: Rect,
    /// Share of the detection frame covered by the face box.
    pub coverage: f64,
}

/// The classifier's answer for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FacialClassification {
    pub face: Option<FaceRegion>,
    /// The frame the classification actually ran on.
    pub timestamps: FrameTimestamps,
    pub ran: bool,
}

impl FacialClassification {
    pub fn is_valid(&self) -> bool {
        self.face.is_some()
    }
}

impl From<TimedResult<FaceRegion>> for FacialClassification {
    fn from(result: TimedResult<FaceRegion>) -> Self {
        Self {
            face: result.value,
            timestamps: result.timestamps,
            ran: result.ran,
        }
    }
}

/// Anything that can tell where the face is on a given frame.
pub trait FaceLocator: Send + Sync {
    /// Face box in native frame coordinates.
    fn native_face(&self, frame_number: FrameNumber) -> Option<Rect>;
}

#[derive(Debug, Default)]
pub struct SkinScratch {
    columns: Vec<u32>,
    rows: Vec<u32>,
}

/// Finds the face as the trimmed bounding box of skin-coloured pixels on the
/// detection frame.
#[derive(Debug, Clone)]
pub struct SkinToneClassifier {
    min_skin_fraction: f64,
    /// Share of skin pixels ignored at each edge, so stray noise does not
    /// stretch the box.
    trim_fraction: f64,
}

impl SkinToneClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            min_skin_fraction: config.min_skin_fraction,
            trim_fraction: 0.01,
        }
    }

    fn is_skin(pixel: &Rgb<u8>) -> bool {
        let [r, g, b] = pixel.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        r > 95 && g > 40 && b > 20 && max - min > 15 && r.abs_diff(g) > 15 && r > g && r > b
    }

    /// First and last index whose cumulative count passes the trim threshold.
    fn trimmed_span(histogram: &[u32], trim: f64) -> Option<(usize, usize)> {
        let total: u64 = histogram.iter().map(|&c| c as u64).sum();
        if total == 0 {
            return None;
        }
        let threshold = ((total as f64) * trim).floor() as u64;
        let mut running = 0u64;
        let start = histogram.iter().position(|&c| {
            running += c as u64;
            running > threshold
        })?;
        running = 0;
        let from_end = histogram.iter().rev().position(|&c| {
            running += c as u64;
            running > threshold
        })?;
        Some((start, histogram.len() - 1 - from_end))
    }

    pub fn classify(&self, scratch: &mut SkinScratch, image: &RgbImage) -> Option<Rect> {
        let (width, height) = image.dimensions();
        scratch.columns.clear();
        scratch.columns.resize(width as usize, 0);
        scratch.rows.clear();
        scratch.rows.resize(height as usize, 0);

        let mut skin = 0u64;
        for (x, y, pixel) in image.enumerate_pixels() {
            if Self::is_skin(pixel) {
                scratch.columns[x as usize] += 1;
                scratch.rows[y as usize] += 1;
                skin += 1;
            }
        }

        let total = (width as u64 * height as u64).max(1);
        if (skin as f64 / total as f64) < self.min_skin_fraction || skin == 0 {
            return None;
        }
        let (x0, x1) = Self::trimmed_span(&scratch.columns, self.trim_fraction)?;
        let (y0, y1) = Self::trimmed_span(&scratch.rows, self.trim_fraction)?;
        Some(Rect::new(
            x0 as f64,
            y0 as f64,
            (x1 - x0 + 1) as f64,
            (y1 - y0 + 1) as f64,
        ))
    }
}

impl FrameJob for SkinToneClassifier {
    type Output = FaceRegion;
    type State = SkinScratch;

    fn name(&self) -> &'static str {
        "face-classifier"
    }

    fn init_state(&self, _worker: usize) -> Result<SkinScratch, PipelineError> {
        Ok(SkinScratch::default())
    }

    fn run(&self, state: &mut SkinScratch, frame: &WorkingFrame) -> Option<FaceRegion> {
        let detection = frame.detection_frame();
        let region = self.classify(state, detection)?;
        let (width, height) = detection.dimensions();
        let coverage = region.area() / (width as f64 * height as f64).max(1.0);
        Some(FaceRegion {
            region,
            native_region: region.scale(1.0 / frame.detection_scale_factor()),
            coverage,
        })
    }
}

/// Face classification on the DETECTION stage, backed by a worker pool.
pub struct FaceClassifier<J = SkinToneClassifier>
where
    J: FrameJob<Output = FaceRegion>,
{
    pool: WorkerPool<J>,
}

impl FaceClassifier<SkinToneClassifier> {
    pub fn start(store: FrameStore, config: &ClassifierConfig) -> Result<Self, PipelineError> {
        Self::with_job(SkinToneClassifier::new(config), store, config)
    }
}

impl<J> FaceClassifier<J>
where
    J: FrameJob<Output = FaceRegion>,
{
    pub fn with_job(job: J, store: FrameStore, config: &ClassifierConfig) -> Result<Self, PipelineError> {
        let options = PoolOptions {
            stage: Stage::Detection,
            checkpoint: FACE_CLASSIFIER_CHECKPOINT.to_string(),
            workers: PoolOptions::workers_for(config.workers_per_cpu),
            good_for_seconds: config.result_good_for_seconds,
            rerun_interval_seconds: config.rerun_interval_seconds,
        };
        Ok(Self {
            pool: WorkerPool::start(job, store, options)?,
        })
    }

    /// Fresh classification for a frame, falling back to the latest good one.
    pub fn classification(&self, frame_number: FrameNumber) -> Option<FacialClassification> {
        self.pool.get_result(frame_number).map(FacialClassification::from)
    }

    pub fn latest_good(&self) -> Option<FacialClassification> {
        self.pool.latest_good().map(FacialClassification::from)
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

impl<J> FaceLocator for FaceClassifier<J>
where
    J: FrameJob<Output = FaceRegion>,
{
    fn native_face(&self, frame_number: FrameNumber) -> Option<Rect> {
        self.classification(frame_number)
            .and_then(|classification| classification.face)
            .map(|face| face.native_region)
    }
}

impl<J> HudLayer for FaceClassifier<J>
where
    J: FrameJob<Output = FaceRegion>,
{
    fn name(&self) -> &'static str {
        "face-classifier"
    }

    fn render(&self, frame_number: FrameNumber, preview: &mut RgbImage, density: PreviewDensity) {
        if density < PreviewDensity::Full {
            return;
        }
        if let Some(face) = self.native_face(frame_number) {
            draw_rect_outline(preview, &face, HUD_COLOR, 2);
        }
    }
}

impl<J> RecordSource for FaceClassifier<J>
where
    J: FrameJob<Output = FaceRegion>,
{
    fn fill(&self, frame_number: FrameNumber, record: &mut FrameRecord) {
        if let Some(classification) = self.classification(frame_number) {
            record.face = classification.face.map(|face| face.native_region);
            record.face_from_frame = Some(classification.timestamps.frame_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameStoreConfig;
    use std::thread;
    use std::time::{Duration, Instant};

    const BACKGROUND: Rgb<u8> = Rgb([40, 60, 90]);
    const SKIN: Rgb<u8> = Rgb([224, 172, 138]);

    fn face_image(size: u32, face: (u32, u32, u32, u32)) -> RgbImage {
        let (fx, fy, fw, fh) = face;
        RgbImage::from_fn(size, size, |x, y| {
            if x >= fx && x < fx + fw && y >= fy && y < fy + fh {
                SKIN
            } else {
                BACKGROUND
            }
        })
    }

    #[test]
    fn skin_rule_accepts_skin_and_rejects_markers_and_background() {
        assert!(SkinToneClassifier::is_skin(&SKIN));
        assert!(!SkinToneClassifier::is_skin(&BACKGROUND));
        assert!(!SkinToneClassifier::is_skin(&Rgb([40, 200, 60])));
    }

    #[test]
    fn classify_returns_the_skin_bounding_box() {
        let classifier = SkinToneClassifier::new(&ClassifierConfig::default());
        let mut scratch = SkinScratch::default();
        let image = face_image(100, (20, 30, 40, 50));
        assert_eq!(
            classifier.classify(&mut scratch, &image),
            Some(Rect::new(20.0, 30.0, 40.0, 50.0))
        );
    }

    #[test]
    fn too_little_skin_is_no_face() {
        let classifier = SkinToneClassifier::new(&ClassifierConfig {
            min_skin_fraction: 0.05,
            ..Default::default()
        });
        let mut scratch = SkinScratch::default();
        let image = face_image(100, (0, 0, 10, 10));
        assert_eq!(classifier.classify(&mut scratch, &image), None);
        let blank = RgbImage::from_pixel(10, 10, BACKGROUND);
        assert_eq!(classifier.classify(&mut scratch, &blank), None);
    }

    #[test]
    fn classifier_releases_frames_and_reports_native_coordinates() {
        let store = FrameStore::new(&FrameStoreConfig {
            detection_bounding_box: 0,
            detection_scale_factor: 0.5,
            ..Default::default()
        });
        store.register_stage_checkpoint(Stage::Tracking, "hold").unwrap();
        let classifier = FaceClassifier::start(store.clone(), &ClassifierConfig::default()).unwrap();
        assert!(classifier.worker_count() >= 1);

        store
            .insert_new_frame(
                face_image(200, (50, 50, 100, 100)),
                FrameTimestamps::at_frame_rate(0, 30.0),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.frame_stage(0) != Some(Stage::Tracking) && Instant::now() < deadline {
            store.sweep();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(store.frame_stage(0), Some(Stage::Tracking));

        let classification = classification_or_panic(&classifier, 0);
        assert!(classification.ran);
        let native = classification.face.unwrap().native_region;
        for (actual, expected) in [
            (native.x, 50.0),
            (native.y, 50.0),
            (native.width, 100.0),
            (native.height, 100.0),
        ] {
            assert!((actual - expected).abs() <= 4.0, "{} vs {}", actual, expected);
        }
        assert_eq!(classifier.native_face(0), Some(native));
        store.clear_subscriptions();
    }

    fn classification_or_panic(
        classifier: &FaceClassifier,
        frame_number: FrameNumber,
    ) -> FacialClassification {
        classifier
            .classification(frame_number)
            .unwrap_or_else(|| panic!("frame {} was not classified", frame_number))
    }
}
