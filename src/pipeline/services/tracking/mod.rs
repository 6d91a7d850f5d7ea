//! Marker tracking: separation of marker candidates around the face, one
//! tracker per marker kind, and the stage participant tying both to the store.

pub mod candidates;
pub mod mapper;
pub mod marker;
pub mod registry;
pub mod separator;
pub mod tracker;

pub use candidates::{Candidate, CandidateSet, SeparatedMarker};
pub use mapper::{FaceMapper, FaceMapping, FACE_MAPPER_CHECKPOINT, MARKER_SEPARATOR_CHECKPOINT};
pub use marker::{EyeSide, EyelidPosition, MarkerKind};
pub use registry::{MarkerObservation, TrackerRegistry};
pub use separator::{Channel, ColorMarkerSeparator, MarkerSeparator};
pub use tracker::{
    LinearDriftBlend, NearestCandidateTracker, PointBlend, Tracker, TrackerState, TrackingInput,
};
