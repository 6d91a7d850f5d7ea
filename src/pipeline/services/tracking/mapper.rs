use super::candidates::CandidateSet;
use super::registry::{MarkerObservation, TrackerRegistry};
use super::separator::MarkerSeparator;
use crate::error::{FrameStoreError, PipelineError};
use crate::pipeline::services::classification::FaceLocator;
use crate::pipeline::services::output::{FrameRecord, RecordSource};
use crate::pipeline::services::preview::{draw_rect_outline, draw_x, HudLayer, PreviewDensity};
use crate::pipeline::store::{FrameStore, SubscriptionToken};
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Point, Rect, Stage};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub const MARKER_SEPARATOR_CHECKPOINT: &str = "marker_separator";
pub const FACE_MAPPER_CHECKPOINT: &str = "face_mapper";

const CANDIDATE_COLOR: Rgb<u8> = Rgb([0, 255, 255]);

/// Tracking results for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMapping {
    pub face: Option<Rect>,
    pub markers: Vec<MarkerObservation>,
}

impl FaceMapping {
    pub fn point(&self, kind: super::MarkerKind) -> Option<Point> {
        self.markers
            .iter()
            .find(|observation| observation.kind == kind)
            .and_then(|observation| observation.point)
    }
}

/// Separates markers on TRACKING and runs every tracker on MAPPING.
///
/// Per-frame candidates and mappings live until the frame is GONE.
pub struct FaceMapper {
    store: FrameStore,
    faces: Arc<dyn FaceLocator>,
    separator: Mutex<Box<dyn MarkerSeparator>>,
    registry: Mutex<TrackerRegistry>,
    candidates: Mutex<HashMap<FrameNumber, Arc<CandidateSet>>>,
    mappings: Mutex<HashMap<FrameNumber, FaceMapping>>,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl FaceMapper {
    pub fn start(
        store: FrameStore,
        faces: Arc<dyn FaceLocator>,
        registry: TrackerRegistry,
        separator: Box<dyn MarkerSeparator>,
    ) -> Result<Arc<Self>, PipelineError> {
        store.register_stage_checkpoint(Stage::Tracking, MARKER_SEPARATOR_CHECKPOINT)?;
        store.register_stage_checkpoint(Stage::Mapping, FACE_MAPPER_CHECKPOINT)?;

        let mapper = Arc::new(Self {
            store: store.clone(),
            faces,
            separator: Mutex::new(separator),
            registry: Mutex::new(registry),
            candidates: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut tokens = Vec::with_capacity(3);
        for stage in [Stage::Tracking, Stage::Mapping, Stage::Gone] {
            let weak: Weak<Self> = Arc::downgrade(&mapper);
            tokens.push(store.on_stage_change(
                stage,
                move |stage: Stage, timestamps: &FrameTimestamps| {
                    if let Some(mapper) = weak.upgrade() {
                        mapper.handle(stage, timestamps.frame_number);
                    }
                },
            ));
        }
        mapper.subscriptions.lock().extend(tokens);
        Ok(mapper)
    }

    fn handle(&self, stage: Stage, frame_number: FrameNumber) {
        let result = match stage {
            Stage::Tracking => self.separate_frame(frame_number),
            Stage::Mapping => self.map_frame(frame_number),
            Stage::Gone => {
                self.evict(frame_number);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Face mapper skipped frame {} at {}: {}", frame_number, stage, e);
        }
    }

    /// Find marker candidates around this frame's face and release it from TRACKING.
    pub fn separate_frame(&self, frame_number: FrameNumber) -> Result<(), PipelineError> {
        let frame = self
            .store
            .get_frame(frame_number)
            .ok_or(FrameStoreError::FrameNotFound(frame_number))?;

        let candidates = match self.faces.native_face(frame_number) {
            Some(face) => self.separator.lock().separate(frame.frame(), &face),
            None => {
                debug!("No face for frame {}, nothing to separate", frame_number);
                CandidateSet::invalid()
            }
        };
        drop(frame);

        self.candidates
            .lock()
            .insert(frame_number, Arc::new(candidates));
        self.store
            .set_frame_checkpoint(frame_number, Stage::Tracking, MARKER_SEPARATOR_CHECKPOINT)?;
        Ok(())
    }

    /// Run every tracker against this frame's candidates and release it from MAPPING.
    pub fn map_frame(&self, frame_number: FrameNumber) -> Result<(), PipelineError> {
        let face = self.faces.native_face(frame_number);
        let candidates = self
            .candidates
            .lock()
            .get(&frame_number)
            .cloned()
            .unwrap_or_else(|| Arc::new(CandidateSet::invalid()));

        let markers = self.registry.lock().process_frame(face, &candidates);
        self.mappings
            .lock()
            .insert(frame_number, FaceMapping { face, markers });

        self.store
            .set_frame_checkpoint(frame_number, Stage::Mapping, FACE_MAPPER_CHECKPOINT)?;
        Ok(())
    }

    pub fn mapping(&self, frame_number: FrameNumber) -> Option<FaceMapping> {
        self.mappings.lock().get(&frame_number).cloned()
    }

    pub fn candidates(&self, frame_number: FrameNumber) -> Option<Arc<CandidateSet>> {
        self.candidates.lock().get(&frame_number).cloned()
    }

    fn evict(&self, frame_number: FrameNumber) {
        self.candidates.lock().remove(&frame_number);
        self.mappings.lock().remove(&frame_number);
    }

    pub fn stop(&self) {
        for token in self.subscriptions.lock().drain(..) {
            self.store.unsubscribe(token);
        }
    }
}

impl Drop for FaceMapper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl HudLayer for FaceMapper {
    fn name(&self) -> &'static str {
        "face-mapper"
    }

    fn render(&self, frame_number: FrameNumber, preview: &mut RgbImage, density: PreviewDensity) {
        if density >= PreviewDensity::Full {
            if let Some(candidates) = self.candidates(frame_number) {
                for marker in candidates.markers() {
                    draw_rect_outline(preview, &marker.bounds, CANDIDATE_COLOR, 1);
                }
            }
        }
        if density >= PreviewDensity::Points {
            if let Some(mapping) = self.mapping(frame_number) {
                for observation in &mapping.markers {
                    if let Some(point) = observation.point {
                        draw_x(preview, point, observation.kind.hud_color(), 10, 2);
                    }
                }
            }
        }
    }
}

impl RecordSource for FaceMapper {
    fn fill(&self, frame_number: FrameNumber, record: &mut FrameRecord) {
        if let Some(mapping) = self.mapping(frame_number) {
            record.markers = mapping.markers;
        }
    }
}
