use super::marker::MarkerKind;
use crate::error::ClaimError;
use crate::pipeline::types::{Point, Rect};
use parking_lot::Mutex;
use serde::Serialize;

/// A blob found by the marker separator, in native frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparatedMarker {
    pub center: Point,
    pub bounds: Rect,
    /// Pixel count of the blob.
    pub area: f64,
}

impl SeparatedMarker {
    pub fn sqrt_area(&self) -> f64 {
        self.area.max(0.0).sqrt()
    }
}

/// A separated marker offered to a tracker, ranked by distance.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub index: usize,
    pub marker: &'a SeparatedMarker,
    pub distance: f64,
}

/// All separated markers of one frame, each with a claim slot.
///
/// Claims are first-come-first-served: once a tracker owns a candidate no
/// other tracker can take it for the rest of the frame.
#[derive(Debug, Default)]
pub struct CandidateSet {
    markers: Vec<SeparatedMarker>,
    claims: Vec<Mutex<Option<MarkerKind>>>,
    valid: bool,
}

impl CandidateSet {
    pub fn new(markers: Vec<SeparatedMarker>) -> Self {
        let claims = markers.iter().map(|_| Mutex::new(None)).collect();
        Self {
            markers,
            claims,
            valid: true,
        }
    }

    /// Separation could not run for this frame.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn markers(&self) -> &[SeparatedMarker] {
        &self.markers
    }

    /// Candidates whose bounds overlap `bounds` (all of them when `None`),
    /// nearest to `point` first.
    pub fn candidates_near(&self, point: Point, bounds: Option<&Rect>) -> Vec<Candidate<'_>> {
        let mut candidates: Vec<Candidate<'_>> = self
            .markers
            .iter()
            .enumerate()
            .filter(|(_, marker)| {
                bounds
                    .map(|bounds| marker.bounds.intersection(bounds).area() > 0.0)
                    .unwrap_or(true)
            })
            .map(|(index, marker)| Candidate {
                index,
                marker,
                distance: point.distance(&marker.center),
            })
            .collect();
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        candidates
    }

    pub fn claim(&self, index: usize, kind: MarkerKind) -> Result<&SeparatedMarker, ClaimError> {
        let slot = self.claims.get(index).ok_or(ClaimError::OutOfBounds(index))?;
        let mut owner = slot.lock();
        match *owner {
            Some(existing) => Err(ClaimError::AlreadyAssigned {
                index,
                owner: existing,
            }),
            None => {
                *owner = Some(kind);
                Ok(&self.markers[index])
            }
        }
    }

    pub fn owner(&self, index: usize) -> Option<MarkerKind> {
        self.claims.get(index).and_then(|slot| *slot.lock())
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.owner(index).is_some()
    }
}
