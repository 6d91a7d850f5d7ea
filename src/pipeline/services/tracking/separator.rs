use super::candidates::{CandidateSet, SeparatedMarker};
use crate::config::TrackerConfig;
use crate::error::PipelineError;
use crate::pipeline::types::{Point, Rect};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use tracing::debug;

/// Splits a frame into marker candidates around a known face.
pub trait MarkerSeparator: Send {
    fn separate(&mut self, frame: &RgbImage, face: &Rect) -> CandidateSet;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }
}

/// Thresholds pixels whose `channel` dominates the other two, then keeps
/// connected blobs of plausible marker size.
pub struct ColorMarkerSeparator {
    channel: Channel,
    /// How far the marker channel must exceed each other channel.
    min_margin: u8,
    /// Floor for the marker channel itself.
    min_value: u8,
    face_size_percentage: f64,
    min_marker_area_percentage: f64,
    max_marker_area_percentage: f64,
    // Scratch mask reused between frames.
    mask: Vec<bool>,
}

impl ColorMarkerSeparator {
    pub fn new(config: &TrackerConfig) -> Result<Self, PipelineError> {
        let percentage_range = 0.0..=1.0;
        for (name, value) in [
            ("min_marker_area_percentage", config.min_marker_area_percentage),
            ("max_marker_area_percentage", config.max_marker_area_percentage),
        ] {
            if value <= 0.0 || !percentage_range.contains(&value) {
                return Err(PipelineError::InvalidParameter {
                    name,
                    reason: format!("{} is out of range", value),
                });
            }
        }
        if config.face_size_percentage <= 0.0 || config.face_size_percentage > 2.0 {
            return Err(PipelineError::InvalidParameter {
                name: "face_size_percentage",
                reason: format!("{} is out of range", config.face_size_percentage),
            });
        }

        Ok(Self {
            channel: Channel::Green,
            min_margin: 60,
            min_value: 120,
            face_size_percentage: config.face_size_percentage,
            min_marker_area_percentage: config.min_marker_area_percentage,
            max_marker_area_percentage: config.max_marker_area_percentage,
            mask: Vec::new(),
        })
    }

    pub fn with_color(mut self, channel: Channel, min_margin: u8, min_value: u8) -> Self {
        self.channel = channel;
        self.min_margin = min_margin;
        self.min_value = min_value;
        self
    }

    fn is_marker_pixel(&self, pixel: &Rgb<u8>) -> bool {
        let dominant = self.channel.index();
        let value = pixel[dominant];
        if value < self.min_value {
            return false;
        }
        (0..3)
            .filter(|&c| c != dominant)
            .all(|c| value.saturating_sub(pixel[c]) >= self.min_margin)
    }

    /// Integer pixel window of the face search box, clipped to the frame.
    fn search_window(&self, frame: &RgbImage, face: &Rect) -> Option<(u32, u32, u32, u32)> {
        let (width, height) = frame.dimensions();
        let image_rect = Rect::new(0.0, 0.0, width as f64, height as f64);
        let search = face.inset(self.face_size_percentage).intersection(&image_rect);
        if search.is_empty() {
            return None;
        }
        let x0 = search.x.floor().max(0.0) as u32;
        let y0 = search.y.floor().max(0.0) as u32;
        let x1 = (search.right().ceil() as u32).min(width);
        let y1 = (search.bottom().ceil() as u32).min(height);
        (x1 > x0 && y1 > y0).then_some((x0, y0, x1, y1))
    }
}

impl MarkerSeparator for ColorMarkerSeparator {
    fn separate(&mut self, frame: &RgbImage, face: &Rect) -> CandidateSet {
        let Some((x0, y0, x1, y1)) = self.search_window(frame, face) else {
            debug!("Marker search box {:?} falls outside the frame", face);
            return CandidateSet::invalid();
        };
        let w = (x1 - x0) as usize;
        let h = (y1 - y0) as usize;

        let mut mask = std::mem::take(&mut self.mask);
        mask.clear();
        mask.resize(w * h, false);
        for y in 0..h {
            for x in 0..w {
                mask[y * w + x] = self.is_marker_pixel(frame.get_pixel(x0 + x as u32, y0 + y as u32));
            }
        }

        let search_area = (w * h) as f64;
        let min_area = search_area * self.min_marker_area_percentage;
        let max_area = search_area * self.max_marker_area_percentage;

        let mut markers = Vec::new();
        let mut queue = VecDeque::new();
        for start in 0..mask.len() {
            if !mask[start] {
                continue;
            }
            // 4-connected flood fill; visited pixels are cleared from the mask.
            mask[start] = false;
            queue.push_back(start);
            let (mut count, mut sum_x, mut sum_y) = (0usize, 0.0f64, 0.0f64);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0usize, 0usize);
            while let Some(index) = queue.pop_front() {
                let (x, y) = (index % w, index / w);
                count += 1;
                sum_x += x as f64;
                sum_y += y as f64;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);

                let mut visit = |neighbour: usize| {
                    if mask[neighbour] {
                        mask[neighbour] = false;
                        queue.push_back(neighbour);
                    }
                };
                if x > 0 {
                    visit(index - 1);
                }
                if x + 1 < w {
                    visit(index + 1);
                }
                if y > 0 {
                    visit(index - w);
                }
                if y + 1 < h {
                    visit(index + w);
                }
            }

            let area = count as f64;
            if area < min_area || area > max_area {
                continue;
            }
            let (ox, oy) = (x0 as f64, y0 as f64);
            markers.push(SeparatedMarker {
                center: Point::new(ox + sum_x / area + 0.5, oy + sum_y / area + 0.5),
                bounds: Rect::new(
                    ox + min_x as f64,
                    oy + min_y as f64,
                    (max_x - min_x + 1) as f64,
                    (max_y - min_y + 1) as f64,
                ),
                area,
            });
        }
        self.mask = mask;

        debug!("Separated {} markers", markers.len());
        CandidateSet::new(markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separator() -> ColorMarkerSeparator {
        ColorMarkerSeparator::new(&TrackerConfig {
            face_size_percentage: 1.0,
            min_marker_area_percentage: 0.001,
            max_marker_area_percentage: 0.05,
            ..Default::default()
        })
        .unwrap()
    }

    fn paint_square(image: &mut RgbImage, x: u32, y: u32, size: u32, color: Rgb<u8>) {
        for dy in 0..size {
            for dx in 0..size {
                image.put_pixel(x + dx, y + dy, color);
            }
        }
    }

    #[test]
    fn finds_green_blobs_inside_the_face() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([200, 150, 120]));
        let green = Rgb([30, 220, 40]);
        paint_square(&mut image, 20, 20, 4, green);
        paint_square(&mut image, 60, 70, 5, green);
        // Outside the face box.
        paint_square(&mut image, 2, 2, 4, green);
        // A single stray pixel is below the area floor.
        image.put_pixel(40, 40, green);

        let set = separator().separate(&image, &Rect::new(10.0, 10.0, 80.0, 80.0));
        assert!(set.is_valid());
        assert_eq!(set.len(), 2);
        let first = &set.markers()[0];
        assert_eq!(first.area, 16.0);
        assert_eq!(first.center, Point::new(22.0, 22.0));
        assert_eq!(first.bounds, Rect::new(20.0, 20.0, 4.0, 4.0));
        assert_eq!(set.markers()[1].area, 25.0);
    }

    #[test]
    fn oversized_regions_are_not_markers() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([200, 150, 120]));
        paint_square(&mut image, 10, 10, 40, Rgb([0, 255, 0]));
        let set = separator().separate(&image, &Rect::new(0.0, 0.0, 100.0, 100.0));
        assert!(set.is_valid());
        assert!(set.is_empty());
    }

    #[test]
    fn face_outside_the_frame_yields_no_markers() {
        let image = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let set = separator().separate(&image, &Rect::new(200.0, 200.0, 40.0, 40.0));
        assert!(!set.is_valid());
        assert!(set.is_empty());
    }

    #[test]
    fn out_of_range_percentages_are_rejected() {
        let config = TrackerConfig {
            face_size_percentage: 3.0,
            ..Default::default()
        };
        assert!(ColorMarkerSeparator::new(&config).is_err());
    }
}
