use super::candidates::CandidateSet;
use super::marker::MarkerKind;
use super::tracker::{NearestCandidateTracker, PointBlend, Tracker, TrackerState, TrackingInput};
use crate::config::TrackerConfig;
use crate::error::PipelineError;
use crate::pipeline::types::{Point, Rect};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// What one tracker reported for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarkerObservation {
    pub kind: MarkerKind,
    pub state: TrackerState,
    pub point: Option<Point>,
}

/// Exactly one tracker per marker kind, kept in registration order.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: IndexMap<MarkerKind, Box<dyn Tracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`NearestCandidateTracker`] per configured marker.
    pub fn from_config(
        config: &TrackerConfig,
        blend: Arc<dyn PointBlend>,
    ) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        for kind in &config.markers {
            registry.register(Box::new(NearestCandidateTracker::new(
                *kind,
                config.tracking_box_percentage,
                config.max_tracker_drift_percentage,
                blend.clone(),
            )?))?;
        }
        info!(
            "Tracker registry ready with {} markers: {:?}",
            registry.len(),
            registry.kinds()
        );
        Ok(registry)
    }

    pub fn register(&mut self, tracker: Box<dyn Tracker>) -> Result<(), PipelineError> {
        let kind = tracker.kind();
        if self.trackers.contains_key(&kind) {
            return Err(PipelineError::DuplicateTracker(kind));
        }
        self.trackers.insert(kind, tracker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn kinds(&self) -> Vec<MarkerKind> {
        self.trackers.keys().copied().collect()
    }

    pub fn state(&self, kind: MarkerKind) -> Option<TrackerState> {
        self.trackers.get(&kind).map(|tracker| tracker.state())
    }

    /// Run every tracker against one frame.
    ///
    /// Trackers without a sibling go first so dependents see their sibling's
    /// point from this same frame. Observations come back in registration order.
    pub fn process_frame(
        &mut self,
        face: Option<Rect>,
        candidates: &CandidateSet,
    ) -> Vec<MarkerObservation> {
        let mut observed: IndexMap<MarkerKind, MarkerObservation> = IndexMap::new();

        for dependents in [false, true] {
            for (kind, tracker) in self.trackers.iter_mut() {
                if kind.sibling().is_some() != dependents {
                    continue;
                }
                let sibling = kind
                    .sibling()
                    .and_then(|sibling| observed.get(&sibling))
                    .and_then(|observation| observation.point);
                let input = TrackingInput {
                    face,
                    candidates,
                    sibling,
                };
                let state = tracker.process(&input);
                observed.insert(
                    *kind,
                    MarkerObservation {
                        kind: *kind,
                        state,
                        point: tracker.point(),
                    },
                );
            }
        }

        self.trackers
            .keys()
            .filter_map(|kind| observed.get(kind).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::services::tracking::{LinearDriftBlend, SeparatedMarker};

    fn blend() -> Arc<dyn PointBlend> {
        Arc::new(LinearDriftBlend)
    }

    fn marker(x: f64, y: f64) -> SeparatedMarker {
        SeparatedMarker {
            center: Point::new(x, y),
            bounds: Rect::centered(Point::new(x, y), 10.0, 10.0),
            area: 100.0,
        }
    }

    #[test]
    fn duplicate_marker_kinds_are_rejected() {
        let mut registry = TrackerRegistry::new();
        let jaw = || NearestCandidateTracker::new(MarkerKind::Jaw, 1.5, 0.75, blend()).unwrap();
        registry.register(Box::new(jaw())).unwrap();
        assert!(matches!(
            registry.register(Box::new(jaw())),
            Err(PipelineError::DuplicateTracker(MarkerKind::Jaw))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn configuration_with_repeated_marker_fails() {
        let config = TrackerConfig {
            markers: vec![MarkerKind::CheekLeft, MarkerKind::CheekLeft],
            ..Default::default()
        };
        assert!(TrackerRegistry::from_config(&config, blend()).is_err());
    }

    #[test]
    fn bottom_eyelid_sees_top_sibling_even_when_registered_first() {
        let config = TrackerConfig {
            markers: vec![MarkerKind::EyelidLeftBottom, MarkerKind::EyelidLeftTop],
            ..Default::default()
        };
        let mut registry = TrackerRegistry::from_config(&config, blend()).unwrap();
        let face = Rect::new(0.0, 0.0, 200.0, 200.0);
        let candidates = CandidateSet::new(vec![marker(64.0, 74.0), marker(64.0, 88.0)]);

        let observations = registry.process_frame(Some(face), &candidates);
        assert_eq!(observations[0].kind, MarkerKind::EyelidLeftBottom);
        assert_eq!(observations[0].point, Some(Point::new(64.0, 88.0)));
        assert_eq!(observations[1].kind, MarkerKind::EyelidLeftTop);
        assert_eq!(observations[1].point, Some(Point::new(64.0, 74.0)));
        assert_eq!(registry.state(MarkerKind::EyelidLeftTop), Some(TrackerState::Tracking));
    }
}
