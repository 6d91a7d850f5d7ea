use super::candidates::{Candidate, CandidateSet, SeparatedMarker};
use super::marker::{EyelidPosition, MarkerKind};
use crate::error::PipelineError;
use crate::pipeline::types::{Point, Rect};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Frames a tracked estimate survives without any detection to confirm it.
const MAX_COAST_FRAMES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackerState {
    Detecting,
    Tracking,
    Lost,
}

/// Everything a tracker may look at for one frame.
pub struct TrackingInput<'a> {
    /// Face box in native coordinates, if the classifier found one.
    pub face: Option<Rect>,
    pub candidates: &'a CandidateSet,
    /// The sibling marker's point on this frame, for kinds that have one.
    pub sibling: Option<Point>,
}

/// One tracker per marker kind, driven once per frame in arrival order.
pub trait Tracker: Send {
    fn kind(&self) -> MarkerKind;

    fn process(&mut self, input: &TrackingInput<'_>) -> TrackerState;

    fn point(&self) -> Option<Point>;

    fn state(&self) -> TrackerState;
}

/// How a fresh detection and the tracked estimate are merged into one point.
pub trait PointBlend: Send + Sync {
    /// `max_distance` is the drift at which the tracked estimate stops counting.
    fn blend(&self, detected: Point, tracked: Point, max_distance: f64) -> Point;
}

/// Weighs the detection by how far the tracked estimate has drifted from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearDriftBlend;

impl PointBlend for LinearDriftBlend {
    fn blend(&self, detected: Point, tracked: Point, max_distance: f64) -> Point {
        if max_distance <= 0.0 {
            return detected;
        }
        let detected_weight = (detected.distance(&tracked) / max_distance).clamp(0.0, 1.0);
        detected.scale(detected_weight) + tracked.scale(1.0 - detected_weight)
    }
}

/// Claims the nearest free candidate, either around its tracking box or,
/// when it has none, inside the region the marker kind is expected in.
pub struct NearestCandidateTracker {
    kind: MarkerKind,
    tracking_box_percentage: f64,
    max_drift_percentage: f64,
    blend: Arc<dyn PointBlend>,
    state: TrackerState,
    tracking_box: Option<Rect>,
    coasted_frames: u32,
    detected: Option<SeparatedMarker>,
    point: Option<Point>,
}

impl NearestCandidateTracker {
    pub fn new(
        kind: MarkerKind,
        tracking_box_percentage: f64,
        max_drift_percentage: f64,
        blend: Arc<dyn PointBlend>,
    ) -> Result<Self, PipelineError> {
        if tracking_box_percentage <= 0.0 {
            return Err(PipelineError::InvalidParameter {
                name: "tracking_box_percentage",
                reason: format!("must be greater than zero, got {}", tracking_box_percentage),
            });
        }
        if max_drift_percentage <= 0.0 {
            return Err(PipelineError::InvalidParameter {
                name: "max_tracker_drift_percentage",
                reason: format!("must be greater than zero, got {}", max_drift_percentage),
            });
        }
        debug!("Tracker <{}> ready", kind);
        Ok(Self {
            kind,
            tracking_box_percentage,
            max_drift_percentage,
            blend,
            state: TrackerState::Detecting,
            tracking_box: None,
            coasted_frames: 0,
            detected: None,
            point: None,
        })
    }

    pub fn tracking_box(&self) -> Option<Rect> {
        self.tracking_box
    }

    pub fn detected(&self) -> Option<&SeparatedMarker> {
        self.detected.as_ref()
    }

    fn try_claim(&mut self, candidates: &CandidateSet, ranked: &[Candidate<'_>]) -> bool {
        for candidate in ranked {
            match candidates.claim(candidate.index, self.kind) {
                Ok(marker) => {
                    self.detected = Some(marker.clone());
                    return true;
                }
                Err(e) => debug!("Tracker <{}>: {}", self.kind, e),
            }
        }
        false
    }

    fn correlate_with_tracking_box(&mut self, candidates: &CandidateSet) -> bool {
        let Some(tracking_box) = self.tracking_box else {
            return false;
        };
        let ranked = candidates.candidates_near(tracking_box.center(), Some(&tracking_box));
        self.try_claim(candidates, &ranked)
    }

    fn detect(&mut self, input: &TrackingInput<'_>) -> bool {
        let Some(face) = input.face else {
            return false;
        };
        let search = self.kind.search_box_in(&face);
        let ranked = input
            .candidates
            .candidates_near(self.kind.anchor_in(&face), Some(&search));

        match self.kind.eyelid_position() {
            None => self.try_claim(input.candidates, &ranked),
            Some(EyelidPosition::Top) => {
                // The upper of the two nearest blobs in the eye box.
                let mut nearest: Vec<Candidate<'_>> = ranked.into_iter().take(2).collect();
                nearest.sort_by(|a, b| a.marker.center.y.total_cmp(&b.marker.center.y));
                self.try_claim(input.candidates, &nearest)
            }
            Some(EyelidPosition::Bottom) => {
                let Some(top) = input.sibling else {
                    return false;
                };
                let below: Vec<Candidate<'_>> = ranked
                    .into_iter()
                    .filter(|candidate| candidate.marker.center.y > top.y)
                    .collect();
                self.try_claim(input.candidates, &below)
            }
        }
    }

    fn drifting_excessively(&self, detected: &SeparatedMarker, tracking_box: &Rect) -> bool {
        let distance = detected.center.distance(&tracking_box.center());
        let max_distance = detected.sqrt_area() * self.max_drift_percentage;
        if distance > max_distance {
            warn!(
                "Tracker <{}> drifting excessively ({:.1}px > {:.1}px), resetting",
                self.kind, distance, max_distance
            );
            return true;
        }
        false
    }

    fn initialize_tracking_box(&mut self, detected: &SeparatedMarker) {
        self.tracking_box = Some(detected.bounds.inset(self.tracking_box_percentage));
        self.coasted_frames = 0;
        self.state = TrackerState::Tracking;
    }

    fn assign_point(&mut self) {
        self.point = match (&self.detected, self.tracking_box) {
            (Some(detected), Some(tracking_box)) => {
                let max_distance = detected.sqrt_area() * self.max_drift_percentage;
                Some(
                    self.blend
                        .blend(detected.center, tracking_box.center(), max_distance),
                )
            }
            (Some(detected), None) => Some(detected.center),
            (None, Some(tracking_box)) => Some(tracking_box.center()),
            (None, None) => None,
        };

        match self.point {
            Some(point) => {
                // The tracking box follows the reported point.
                if let Some(tracking_box) = self.tracking_box.as_mut() {
                    *tracking_box = Rect::centered(point, tracking_box.width, tracking_box.height);
                }
            }
            None => {
                if self.state != TrackerState::Lost {
                    debug!("Tracker <{}> lost its marker, will keep searching", self.kind);
                }
                self.state = TrackerState::Lost;
            }
        }
    }
}

impl Tracker for NearestCandidateTracker {
    fn kind(&self) -> MarkerKind {
        self.kind
    }

    fn process(&mut self, input: &TrackingInput<'_>) -> TrackerState {
        self.detected = None;

        if !self.correlate_with_tracking_box(input.candidates) {
            self.detect(input);
        }

        match self.detected.clone() {
            Some(detected) => {
                let reset = match self.tracking_box {
                    None => true,
                    Some(tracking_box) => self.drifting_excessively(&detected, &tracking_box),
                };
                if reset {
                    self.initialize_tracking_box(&detected);
                } else {
                    self.coasted_frames = 0;
                }
            }
            None if self.tracking_box.is_some() => {
                self.coasted_frames += 1;
                if self.coasted_frames > MAX_COAST_FRAMES {
                    self.tracking_box = None;
                }
            }
            None => {}
        }

        self.assign_point();
        self.state
    }

    fn point(&self) -> Option<Point> {
        self.point
    }

    fn state(&self) -> TrackerState {
        self.state
    }
}
