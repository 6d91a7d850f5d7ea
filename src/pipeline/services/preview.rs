use crate::error::PipelineError;
use crate::pipeline::store::{FrameStore, SubscriptionToken};
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Point, Rect, Stage};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub const PREVIEW_CHECKPOINT: &str = "preview";

/// How much each HUD layer draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreviewDensity {
    Off,
    Points,
    Full,
}

impl From<u8> for PreviewDensity {
    fn from(density: u8) -> Self {
        match density {
            0 => PreviewDensity::Off,
            1 => PreviewDensity::Points,
            _ => PreviewDensity::Full,
        }
    }
}

/// A component that annotates the preview buffer of frames it knows about.
pub trait HudLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn render(&self, frame_number: FrameNumber, preview: &mut RgbImage, density: PreviewDensity);
}

fn put_clipped(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u64) < image.width() as u64 && (y as u64) < image.height() as u64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Outline `rect`, growing inwards by `thickness` pixels. Anything outside
/// the image is clipped.
pub fn draw_rect_outline(image: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: u32) {
    if rect.is_empty() {
        return;
    }
    let left = rect.x.round() as i64;
    let top = rect.y.round() as i64;
    let right = rect.right().round() as i64 - 1;
    let bottom = rect.bottom().round() as i64 - 1;
    for t in 0..thickness.max(1) as i64 {
        for x in left..=right {
            put_clipped(image, x, top + t, color);
            put_clipped(image, x, bottom - t, color);
        }
        for y in top..=bottom {
            put_clipped(image, left + t, y, color);
            put_clipped(image, right - t, y, color);
        }
    }
}

/// Draw an X of `size` pixels across, centred on `center`.
pub fn draw_x(image: &mut RgbImage, center: Point, color: Rgb<u8>, size: u32, thickness: u32) {
    let cx = center.x.round() as i64;
    let cy = center.y.round() as i64;
    let half = (size / 2) as i64;
    let spread = (thickness.max(1) / 2) as i64;
    for d in -half..=half {
        for s in -spread..=spread {
            put_clipped(image, cx + d + s, cy + d, color);
            put_clipped(image, cx + d + s, cy - d, color);
        }
    }
}

/// PREVIEWING stage participant: lets every layer draw into the frame's
/// preview buffer, then releases the frame.
pub struct PreviewRenderer {
    store: FrameStore,
    layers: Vec<Arc<dyn HudLayer>>,
    density: PreviewDensity,
    subscription: Mutex<Option<SubscriptionToken>>,
}

impl PreviewRenderer {
    pub fn start(
        store: FrameStore,
        layers: Vec<Arc<dyn HudLayer>>,
        density: PreviewDensity,
    ) -> Result<Arc<Self>, PipelineError> {
        store.register_stage_checkpoint(Stage::Previewing, PREVIEW_CHECKPOINT)?;
        let renderer = Arc::new(Self {
            store: store.clone(),
            layers,
            density,
            subscription: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&renderer);
        let token = store.on_stage_change(
            Stage::Previewing,
            move |_: Stage, timestamps: &FrameTimestamps| {
                if let Some(renderer) = weak.upgrade() {
                    renderer.handle(timestamps.frame_number);
                }
            },
        );
        *renderer.subscription.lock() = Some(token);
        debug!(
            "Preview renderer started with {} layers at {:?}",
            renderer.layers.len(),
            density
        );
        Ok(renderer)
    }

    pub fn density(&self) -> PreviewDensity {
        self.density
    }

    fn handle(&self, frame_number: FrameNumber) {
        if let Err(e) = self.render_frame(frame_number) {
            warn!("Preview of frame {} failed: {}", frame_number, e);
        }
    }

    pub fn render_frame(&self, frame_number: FrameNumber) -> Result<(), PipelineError> {
        if self.density > PreviewDensity::Off {
            if let Some(frame) = self.store.get_frame(frame_number) {
                frame.with_preview(|preview| {
                    for layer in &self.layers {
                        layer.render(frame_number, preview, self.density);
                    }
                });
            }
        }
        self.store
            .set_frame_checkpoint(frame_number, Stage::Previewing, PREVIEW_CHECKPOINT)?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(token) = self.subscription.lock().take() {
            self.store.unsubscribe(token);
        }
    }
}

impl Drop for PreviewRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameStoreConfig;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    struct Dot;

    impl HudLayer for Dot {
        fn name(&self) -> &'static str {
            "dot"
        }

        fn render(&self, _frame_number: FrameNumber, preview: &mut RgbImage, density: PreviewDensity) {
            if density >= PreviewDensity::Points {
                preview.put_pixel(0, 0, RED);
            }
        }
    }

    #[test]
    fn density_from_config_value() {
        assert_eq!(PreviewDensity::from(0), PreviewDensity::Off);
        assert_eq!(PreviewDensity::from(1), PreviewDensity::Points);
        assert_eq!(PreviewDensity::from(9), PreviewDensity::Full);
    }

    #[test]
    fn rect_outline_is_clipped_to_the_image() {
        let mut image = RgbImage::from_pixel(10, 10, BLACK);
        draw_rect_outline(&mut image, &Rect::new(2.0, 2.0, 4.0, 4.0), RED, 1);
        assert_eq!(image.get_pixel(2, 2), &RED);
        assert_eq!(image.get_pixel(5, 5), &RED);
        assert_eq!(image.get_pixel(3, 3), &BLACK);

        draw_rect_outline(&mut image, &Rect::new(-5.0, -5.0, 30.0, 30.0), RED, 1);
        assert_eq!(image.get_pixel(0, 0), &BLACK);
    }

    #[test]
    fn x_marks_both_diagonals() {
        let mut image = RgbImage::from_pixel(11, 11, BLACK);
        draw_x(&mut image, Point::new(5.0, 5.0), RED, 4, 1);
        for (x, y) in [(3, 3), (7, 7), (3, 7), (7, 3), (5, 5)] {
            assert_eq!(image.get_pixel(x, y), &RED);
        }
        assert_eq!(image.get_pixel(5, 3), &BLACK);
    }

    fn run_preview(density: PreviewDensity) -> RgbImage {
        let store = FrameStore::new(&FrameStoreConfig::default());
        store.register_stage_checkpoint(Stage::LateProcessing, "hold").unwrap();
        let _renderer = PreviewRenderer::start(store.clone(), vec![Arc::new(Dot)], density).unwrap();
        store
            .insert_new_frame(RgbImage::from_pixel(4, 4, BLACK), FrameTimestamps::at_frame_rate(0, 30.0))
            .unwrap();
        for _ in 0..16 {
            store.sweep();
        }
        assert_eq!(store.frame_stage(0), Some(Stage::LateProcessing));
        let frame = store.get_frame(0).unwrap();
        assert_eq!(frame.frame().get_pixel(0, 0), &BLACK);
        frame.preview_snapshot()
    }

    #[test]
    fn renderer_draws_layers_and_releases_the_frame() {
        assert_eq!(run_preview(PreviewDensity::Full).get_pixel(0, 0), &RED);
    }

    #[test]
    fn density_off_draws_nothing_but_still_releases() {
        assert_eq!(run_preview(PreviewDensity::Off).get_pixel(0, 0), &BLACK);
    }
}
