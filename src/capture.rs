use crate::config::{CaptureConfig, TrackerConfig};
use crate::pipeline::services::tracking::{EyelidPosition, MarkerKind};
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Point, Rect};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BACKGROUND: [u8; 3] = [40, 60, 90];
const SKIN: [u8; 3] = [224, 172, 138];
const MARKER: [u8; 3] = [40, 210, 60];
const NOISE: i16 = 6;
/// Vertical offset of eyelid markers from the eye centre, relative to face height.
const EYELID_OFFSET: f64 = 0.04;

/// Produces captured frames in order.
pub trait FrameSource: Send {
    /// `None` once the stream has ended.
    fn next_frame(&mut self) -> Option<(RgbImage, FrameTimestamps)>;
}

/// Draws a skin-coloured face with green markers that sways slowly from side
/// to side, with per-pixel noise.
pub struct SyntheticSource {
    config: CaptureConfig,
    markers: Vec<MarkerKind>,
    rng: StdRng,
    next: FrameNumber,
}

impl SyntheticSource {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            config: config.clone(),
            markers: TrackerConfig::default().markers,
            rng: StdRng::seed_from_u64(config.seed),
            next: 0,
        }
    }

    pub fn with_markers(mut self, markers: Vec<MarkerKind>) -> Self {
        self.markers = markers;
        self
    }

    /// Bounding box of the face ellipse on a given frame.
    pub fn face_box(&self, frame_number: FrameNumber) -> Rect {
        let width = self.config.width as f64;
        let height = self.config.height as f64;
        let phase = frame_number as f64 / self.config.fps.max(1.0);
        let sway = (phase * std::f64::consts::PI).sin() * width * 0.05;
        let semi_x = width * 0.25;
        let semi_y = height * 0.38;
        Rect::new(
            width / 2.0 + sway - semi_x,
            height / 2.0 - semi_y,
            semi_x * 2.0,
            semi_y * 2.0,
        )
    }

    /// Where a marker is painted inside `face`.
    pub fn marker_position(kind: MarkerKind, face: &Rect) -> Point {
        let anchor = kind.anchor_in(face);
        match kind.eyelid_position() {
            Some(EyelidPosition::Top) => Point::new(anchor.x, anchor.y - face.height * EYELID_OFFSET),
            Some(EyelidPosition::Bottom) => {
                Point::new(anchor.x, anchor.y + face.height * EYELID_OFFSET)
            }
            None => anchor,
        }
    }

    fn noisy(&mut self, color: [u8; 3]) -> Rgb<u8> {
        let mut channel = |value: u8| {
            (value as i16 + self.rng.random_range(-NOISE..=NOISE)).clamp(0, 255) as u8
        };
        Rgb([channel(color[0]), channel(color[1]), channel(color[2])])
    }

    fn render(&mut self, frame_number: FrameNumber) -> RgbImage {
        let face = self.face_box(frame_number);
        let center = face.center();
        let semi_x = face.width / 2.0;
        let semi_y = face.height / 2.0;
        let radius = (face.width * 0.025).max(2.0);
        let markers: Vec<Point> = self
            .markers
            .iter()
            .map(|kind| Self::marker_position(*kind, &face))
            .collect();

        let (width, height) = (self.config.width, self.config.height);
        let mut image = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let p = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                let dx = (p.x - center.x) / semi_x;
                let dy = (p.y - center.y) / semi_y;
                let color = if markers.iter().any(|m| m.distance(&p) <= radius) {
                    MARKER
                } else if dx * dx + dy * dy <= 1.0 {
                    SKIN
                } else {
                    BACKGROUND
                };
                let pixel = self.noisy(color);
                image.put_pixel(x, y, pixel);
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Option<(RgbImage, FrameTimestamps)> {
        if self.config.frames > 0 && self.next >= self.config.frames {
            return None;
        }
        let frame_number = self.next;
        self.next += 1;
        let image = self.render(frame_number);
        Some((
            image,
            FrameTimestamps::at_frame_rate(frame_number, self.config.fps),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frames: u64) -> CaptureConfig {
        CaptureConfig {
            frames,
            fps: 10.0,
            width: 160,
            height: 120,
            seed: 1,
        }
    }

    #[test]
    fn stream_ends_after_the_configured_frames() {
        let mut source = SyntheticSource::new(&config(3));
        let numbers: Vec<FrameNumber> = std::iter::from_fn(|| source.next_frame())
            .map(|(_, timestamps)| timestamps.frame_number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn frames_are_timed_at_the_frame_rate() {
        let mut source = SyntheticSource::new(&config(2));
        source.next_frame().unwrap();
        let (image, timestamps) = source.next_frame().unwrap();
        assert_eq!(image.dimensions(), (160, 120));
        assert!((timestamps.start_seconds - 0.1).abs() < 1e-9);
    }

    #[test]
    fn markers_are_painted_inside_the_face() {
        let mut source = SyntheticSource::new(&config(1)).with_markers(vec![MarkerKind::Jaw]);
        let face = source.face_box(0);
        let jaw = SyntheticSource::marker_position(MarkerKind::Jaw, &face);
        assert!(face.contains(&jaw));

        let (image, _) = source.next_frame().unwrap();
        let pixel = image.get_pixel(jaw.x as u32, jaw.y as u32);
        assert!(pixel[1] > pixel[0] + 100);
        let center = face.center();
        let skin = image.get_pixel(center.x as u32, center.y as u32);
        assert!(skin[0] > skin[1]);
    }

    #[test]
    fn same_seed_gives_the_same_frames() {
        let mut a = SyntheticSource::new(&config(1));
        let mut b = SyntheticSource::new(&config(1));
        assert_eq!(a.next_frame().unwrap().0, b.next_frame().unwrap().0);
    }
}
