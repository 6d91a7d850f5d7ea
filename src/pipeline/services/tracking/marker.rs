use crate::pipeline::types::{Point, Rect};
use image::Rgb;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every facial marker the mapper knows how to look for.
///
/// Adding a kind forces every `match` below to be updated, which is where the
/// per-marker detection rules live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    EyelidLeftTop,
    EyelidLeftBottom,
    EyelidRightTop,
    EyelidRightBottom,
    EyebrowLeftInner,
    EyebrowLeftMiddle,
    EyebrowLeftOuter,
    EyebrowRightInner,
    EyebrowRightMiddle,
    EyebrowRightOuter,
    CheekLeft,
    CheekRight,
    LipsLeftCorner,
    LipsRightCorner,
    LipsLeftTop,
    LipsRightTop,
    LipsLeftBottom,
    LipsRightBottom,
    Jaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyelidPosition {
    Top,
    Bottom,
}

/// Eye box size relative to the face box.
const EYE_BOX_WIDTH: f64 = 0.3;
const EYE_BOX_HEIGHT: f64 = 0.2;
/// Side of the square search box for every other marker, relative to face width.
const MARKER_BOX_SIZE: f64 = 0.2;

impl MarkerKind {
    pub const ALL: [MarkerKind; 19] = [
        MarkerKind::EyelidLeftTop,
        MarkerKind::EyelidLeftBottom,
        MarkerKind::EyelidRightTop,
        MarkerKind::EyelidRightBottom,
        MarkerKind::EyebrowLeftInner,
        MarkerKind::EyebrowLeftMiddle,
        MarkerKind::EyebrowLeftOuter,
        MarkerKind::EyebrowRightInner,
        MarkerKind::EyebrowRightMiddle,
        MarkerKind::EyebrowRightOuter,
        MarkerKind::CheekLeft,
        MarkerKind::CheekRight,
        MarkerKind::LipsLeftCorner,
        MarkerKind::LipsRightCorner,
        MarkerKind::LipsLeftTop,
        MarkerKind::LipsRightTop,
        MarkerKind::LipsLeftBottom,
        MarkerKind::LipsRightBottom,
        MarkerKind::Jaw,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MarkerKind::EyelidLeftTop => "EyelidLeftTop",
            MarkerKind::EyelidLeftBottom => "EyelidLeftBottom",
            MarkerKind::EyelidRightTop => "EyelidRightTop",
            MarkerKind::EyelidRightBottom => "EyelidRightBottom",
            MarkerKind::EyebrowLeftInner => "EyebrowLeftInner",
            MarkerKind::EyebrowLeftMiddle => "EyebrowLeftMiddle",
            MarkerKind::EyebrowLeftOuter => "EyebrowLeftOuter",
            MarkerKind::EyebrowRightInner => "EyebrowRightInner",
            MarkerKind::EyebrowRightMiddle => "EyebrowRightMiddle",
            MarkerKind::EyebrowRightOuter => "EyebrowRightOuter",
            MarkerKind::CheekLeft => "CheekLeft",
            MarkerKind::CheekRight => "CheekRight",
            MarkerKind::LipsLeftCorner => "LipsLeftCorner",
            MarkerKind::LipsRightCorner => "LipsRightCorner",
            MarkerKind::LipsLeftTop => "LipsLeftTop",
            MarkerKind::LipsRightTop => "LipsRightTop",
            MarkerKind::LipsLeftBottom => "LipsLeftBottom",
            MarkerKind::LipsRightBottom => "LipsRightBottom",
            MarkerKind::Jaw => "Jaw",
        }
    }

    pub fn eye_side(&self) -> Option<EyeSide> {
        match self {
            MarkerKind::EyelidLeftTop | MarkerKind::EyelidLeftBottom => Some(EyeSide::Left),
            MarkerKind::EyelidRightTop | MarkerKind::EyelidRightBottom => Some(EyeSide::Right),
            MarkerKind::EyebrowLeftInner
            | MarkerKind::EyebrowLeftMiddle
            | MarkerKind::EyebrowLeftOuter
            | MarkerKind::EyebrowRightInner
            | MarkerKind::EyebrowRightMiddle
            | MarkerKind::EyebrowRightOuter
            | MarkerKind::CheekLeft
            | MarkerKind::CheekRight
            | MarkerKind::LipsLeftCorner
            | MarkerKind::LipsRightCorner
            | MarkerKind::LipsLeftTop
            | MarkerKind::LipsRightTop
            | MarkerKind::LipsLeftBottom
            | MarkerKind::LipsRightBottom
            | MarkerKind::Jaw => None,
        }
    }

    pub fn eyelid_position(&self) -> Option<EyelidPosition> {
        match self {
            MarkerKind::EyelidLeftTop | MarkerKind::EyelidRightTop => Some(EyelidPosition::Top),
            MarkerKind::EyelidLeftBottom | MarkerKind::EyelidRightBottom => {
                Some(EyelidPosition::Bottom)
            }
            MarkerKind::EyebrowLeftInner
            | MarkerKind::EyebrowLeftMiddle
            | MarkerKind::EyebrowLeftOuter
            | MarkerKind::EyebrowRightInner
            | MarkerKind::EyebrowRightMiddle
            | MarkerKind::EyebrowRightOuter
            | MarkerKind::CheekLeft
            | MarkerKind::CheekRight
            | MarkerKind::LipsLeftCorner
            | MarkerKind::LipsRightCorner
            | MarkerKind::LipsLeftTop
            | MarkerKind::LipsRightTop
            | MarkerKind::LipsLeftBottom
            | MarkerKind::LipsRightBottom
            | MarkerKind::Jaw => None,
        }
    }

    /// The marker whose result this one needs before it can be detected.
    pub fn sibling(&self) -> Option<MarkerKind> {
        match self {
            MarkerKind::EyelidLeftBottom => Some(MarkerKind::EyelidLeftTop),
            MarkerKind::EyelidRightBottom => Some(MarkerKind::EyelidRightTop),
            MarkerKind::EyelidLeftTop | MarkerKind::EyelidRightTop => None,
            MarkerKind::EyebrowLeftInner
            | MarkerKind::EyebrowLeftMiddle
            | MarkerKind::EyebrowLeftOuter
            | MarkerKind::EyebrowRightInner
            | MarkerKind::EyebrowRightMiddle
            | MarkerKind::EyebrowRightOuter
            | MarkerKind::CheekLeft
            | MarkerKind::CheekRight
            | MarkerKind::LipsLeftCorner
            | MarkerKind::LipsRightCorner
            | MarkerKind::LipsLeftTop
            | MarkerKind::LipsRightTop
            | MarkerKind::LipsLeftBottom
            | MarkerKind::LipsRightBottom
            | MarkerKind::Jaw => None,
        }
    }

    /// Expected position as a fraction of the face box.
    fn face_anchor(&self) -> (f64, f64) {
        match self {
            MarkerKind::EyelidLeftTop | MarkerKind::EyelidLeftBottom => (0.32, 0.40),
            MarkerKind::EyelidRightTop | MarkerKind::EyelidRightBottom => (0.68, 0.40),
            MarkerKind::EyebrowLeftInner => (0.42, 0.28),
            MarkerKind::EyebrowLeftMiddle => (0.32, 0.26),
            MarkerKind::EyebrowLeftOuter => (0.22, 0.28),
            MarkerKind::EyebrowRightInner => (0.58, 0.28),
            MarkerKind::EyebrowRightMiddle => (0.68, 0.26),
            MarkerKind::EyebrowRightOuter => (0.78, 0.28),
            MarkerKind::CheekLeft => (0.25, 0.60),
            MarkerKind::CheekRight => (0.75, 0.60),
            MarkerKind::LipsLeftCorner => (0.35, 0.75),
            MarkerKind::LipsRightCorner => (0.65, 0.75),
            MarkerKind::LipsLeftTop => (0.44, 0.71),
            MarkerKind::LipsRightTop => (0.56, 0.71),
            MarkerKind::LipsLeftBottom => (0.44, 0.80),
            MarkerKind::LipsRightBottom => (0.56, 0.80),
            MarkerKind::Jaw => (0.50, 0.93),
        }
    }

    pub fn anchor_in(&self, face: &Rect) -> Point {
        let (fx, fy) = self.face_anchor();
        Point::new(face.x + face.width * fx, face.y + face.height * fy)
    }

    /// Where to look for this marker when there is no tracking box yet.
    pub fn search_box_in(&self, face: &Rect) -> Rect {
        let anchor = self.anchor_in(face);
        match self.eye_side() {
            Some(_) => Rect::centered(
                anchor,
                face.width * EYE_BOX_WIDTH,
                face.height * EYE_BOX_HEIGHT,
            ),
            None => {
                let side = face.width * MARKER_BOX_SIZE;
                Rect::centered(anchor, side, side)
            }
        }
    }

    pub fn hud_color(&self) -> Rgb<u8> {
        match self.eyelid_position() {
            Some(EyelidPosition::Top) => Rgb([255, 127, 0]),
            Some(EyelidPosition::Bottom) => Rgb([255, 255, 0]),
            None => Rgb([255, 0, 0]),
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bottom_eyelids_have_siblings() {
        for kind in MarkerKind::ALL {
            match kind.sibling() {
                Some(sibling) => {
                    assert_eq!(kind.eyelid_position(), Some(EyelidPosition::Bottom));
                    assert_eq!(sibling.eyelid_position(), Some(EyelidPosition::Top));
                    assert_eq!(sibling.eye_side(), kind.eye_side());
                }
                None => assert_ne!(kind.eyelid_position(), Some(EyelidPosition::Bottom)),
            }
        }
    }

    #[test]
    fn exactly_the_four_eyelids_have_an_eye_and_a_lid_position() {
        let eyelids: Vec<MarkerKind> = MarkerKind::ALL
            .into_iter()
            .filter(|kind| kind.eyelid_position().is_some())
            .collect();
        assert_eq!(
            eyelids,
            vec![
                MarkerKind::EyelidLeftTop,
                MarkerKind::EyelidLeftBottom,
                MarkerKind::EyelidRightTop,
                MarkerKind::EyelidRightBottom,
            ]
        );
        for kind in MarkerKind::ALL {
            assert_eq!(kind.eye_side().is_some(), kind.eyelid_position().is_some());
        }
    }

    #[test]
    fn serde_names_are_snake_case() {
        let json = serde_json::to_string(&MarkerKind::EyelidRightBottom).unwrap();
        assert_eq!(json, "\"eyelid_right_bottom\"");
        let kind: MarkerKind = serde_json::from_str("\"lips_left_corner\"").unwrap();
        assert_eq!(kind, MarkerKind::LipsLeftCorner);
    }

    #[test]
    fn eyelid_search_box_is_the_eye_box() {
        let face = Rect::new(100.0, 100.0, 200.0, 300.0);
        let search = MarkerKind::EyelidLeftTop.search_box_in(&face);
        assert_eq!(search.center(), Point::new(164.0, 220.0));
        assert!((search.width - 60.0).abs() < 1e-9);
        assert!((search.height - 60.0).abs() < 1e-9);
    }
}
