use super::frame_store::FrameStore;
use crate::error::PipelineError;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Background thread that keeps sweeping the frame store.
///
/// It sweeps back to back while frames are moving and parks on the store's
/// wake signal when a sweep changed nothing. It exits by itself once the
/// store has drained; dropping the herder forces it to stop and joins it.
pub struct Herder {
    store: FrameStore,
    handle: Option<JoinHandle<()>>,
}

impl Herder {
    pub fn spawn(store: FrameStore, idle_timeout: Duration) -> Result<Self, PipelineError> {
        let thread_store = store.clone();
        let handle = thread::Builder::new()
            .name("frame-herder".to_string())
            .spawn(move || herder_loop(thread_store, idle_timeout))
            .map_err(|e| PipelineError::Spawn("frame-herder".to_string(), e))?;

        Ok(Self {
            store,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Wait for the herder to exit on its own, i.e. after the store drained.
    pub fn join(mut self) {
        self.join_thread();
    }

    /// Stop the herder whether or not frames remain, and wait for it.
    pub fn shutdown(mut self) {
        self.store.request_shutdown();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Frame herder thread panicked");
            }
        }
    }
}

impl Drop for Herder {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.store.request_shutdown();
            self.join_thread();
        }
    }
}

fn herder_loop(store: FrameStore, idle_timeout: Duration) {
    info!("Frame herder started");
    loop {
        let outcome = store.sweep();
        if store.herder_should_exit() {
            break;
        }
        if !outcome.made_progress() {
            store.wait_for_work(idle_timeout);
        }
    }

    let remaining = store.frame_count();
    if remaining > 0 {
        warn!("Frame herder stopped with {} frames still in flight", remaining);
    }
    info!("Frame herder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameStoreConfig;
    use crate::pipeline::types::{FrameTimestamps, Stage};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn herder_advances_frames_and_exits_after_draining() {
        let store = FrameStore::new(&FrameStoreConfig::default());
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = drained.clone();
        store.on_drained(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let herder = Herder::spawn(store.clone(), Duration::from_millis(50)).unwrap();
        for n in 0..3 {
            store
                .insert_new_frame(
                    RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])),
                    FrameTimestamps::at_frame_rate(n, 30.0),
                )
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            (0..3).all(|n| store.frame_stage(n) == Some(Stage::Detection))
        }));

        store.set_draining();
        for n in 0..3 {
            store.set_frame_checkpoint(n, Stage::Detection, "face").unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || herder.is_finished()));
        herder.join();

        assert_eq!(store.frame_count(), 0);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_herder_stops_it_with_frames_in_flight() {
        let store = FrameStore::new(&FrameStoreConfig::default());
        store.register_stage_checkpoint(Stage::Mapping, "markers").unwrap();
        let herder = Herder::spawn(store.clone(), Duration::from_millis(10)).unwrap();
        store
            .insert_new_frame(
                RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])),
                FrameTimestamps::at_frame_rate(0, 30.0),
            )
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            store.frame_stage(0) == Some(Stage::Mapping)
        }));

        drop(herder);
        assert_eq!(store.frame_count(), 1);
        assert!(!store.is_drained());
    }
}
