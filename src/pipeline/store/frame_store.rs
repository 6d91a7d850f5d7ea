use super::events::{DrainObserver, EventNotifier, StageObserver, SubscriptionToken};
use super::metrics::{FrameMetrics, MetricsSnapshot};
use super::stage_gate::{StageCheckpoints, StageRegistry};
use crate::config::FrameStoreConfig;
use crate::error::FrameStoreError;
use crate::pipeline::types::{DetectionScaling, FrameNumber, FrameTimestamps, Stage, WorkingFrame};
use image::RgbImage;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct FrameEntry {
    frame: Arc<WorkingFrame>,
    stage: Stage,
    checkpoints: StageCheckpoints,
    /// NEW observers have not been told about this frame yet.
    announced: bool,
    inserted_at: Instant,
}

#[derive(Default)]
struct StoreState {
    frames: BTreeMap<FrameNumber, FrameEntry>,
    draining: bool,
    drained: bool,
    shutdown: bool,
}

struct StoreInner {
    capacity: usize,
    scaling: DetectionScaling,
    state: Mutex<StoreState>,
    capacity_available: Condvar,
    registry: RwLock<StageRegistry>,
    notifier: EventNotifier,
    wake_pending: Mutex<bool>,
    wake: Condvar,
    metrics: Mutex<FrameMetrics>,
}

/// What a single herder sweep accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub announced: usize,
    pub advanced: usize,
    pub destroyed: usize,
    pub drained: bool,
}

impl SweepOutcome {
    pub fn made_progress(&self) -> bool {
        self.announced + self.advanced + self.destroyed > 0 || self.drained
    }
}

/// Central store of in-flight frames.
///
/// The store exclusively decides when frames exist. Stage owners get shared
/// [`WorkingFrame`] handles and report progress through named checkpoints;
/// stage advancement itself happens in [`FrameStore::sweep`], which the
/// herder thread calls in a loop. Cloning the store clones a handle.
#[derive(Clone)]
pub struct FrameStore {
    inner: Arc<StoreInner>,
}

impl FrameStore {
    pub fn new(config: &FrameStoreConfig) -> Self {
        let metrics = FrameMetrics::new(config.metrics_window)
            .with_report_interval(config.metrics_report_every);
        Self {
            inner: Arc::new(StoreInner {
                capacity: config.max_queue_depth,
                scaling: config.detection_scaling(),
                state: Mutex::new(StoreState::default()),
                capacity_available: Condvar::new(),
                registry: RwLock::new(StageRegistry::new()),
                notifier: EventNotifier::new(),
                wake_pending: Mutex::new(false),
                wake: Condvar::new(),
                metrics: Mutex::new(metrics),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Declare that `name` must be satisfied before frames leave `stage`.
    ///
    /// Meant for setup time. Frames already in the store keep the checkpoint
    /// set they were inserted with.
    pub fn register_stage_checkpoint(&self, stage: Stage, name: &str) -> Result<(), FrameStoreError> {
        let added = self.inner.registry.write().register(stage, name)?;
        if added {
            let in_flight = self.inner.state.lock().frames.len();
            if in_flight > 0 {
                warn!(
                    "Checkpoint \"{}\" registered for {} with {} frames in flight; it only gates frames inserted from now on",
                    name, stage, in_flight
                );
            } else {
                debug!("Registered checkpoint \"{}\" for stage {}", name, stage);
            }
        }
        Ok(())
    }

    pub fn is_checkpoint_registered(&self, stage: Stage, name: &str) -> bool {
        self.inner.registry.read().is_registered(stage, name)
    }

    /// Insert a freshly captured frame at stage NEW.
    ///
    /// Never blocks: a full store is reported as `Backpressure` and the caller
    /// decides whether to drop the frame or wait (see [`FrameStore::wait_for_capacity`]).
    pub fn insert_new_frame(
        &self,
        image: RgbImage,
        timestamps: FrameTimestamps,
    ) -> Result<FrameNumber, FrameStoreError> {
        let frame_number = timestamps.frame_number;
        {
            let state = self.inner.state.lock();
            self.check_insertable(&state, frame_number)?;
        }

        // Derived buffers are built without holding the store lock.
        let frame = Arc::new(WorkingFrame::new(image, timestamps, self.inner.scaling));
        let checkpoints = StageCheckpoints::from_registry(&self.inner.registry.read());

        {
            let mut state = self.inner.state.lock();
            self.check_insertable(&state, frame_number)?;
            state.frames.insert(
                frame_number,
                FrameEntry {
                    frame,
                    stage: Stage::New,
                    checkpoints,
                    announced: false,
                    inserted_at: Instant::now(),
                },
            );
            debug!(
                "Inserted frame {} ({} in flight)",
                frame_number,
                state.frames.len()
            );
        }

        self.wake_herder();
        Ok(frame_number)
    }

    fn check_insertable(
        &self,
        state: &StoreState,
        frame_number: FrameNumber,
    ) -> Result<(), FrameStoreError> {
        if state.draining {
            return Err(FrameStoreError::Draining);
        }
        if state.frames.contains_key(&frame_number) {
            return Err(FrameStoreError::DuplicateFrame(frame_number));
        }
        if state.frames.len() >= self.inner.capacity {
            return Err(FrameStoreError::Backpressure {
                capacity: self.inner.capacity,
            });
        }
        Ok(())
    }

    /// Block until the store has room for another frame, draining starts, or
    /// `timeout` passes. Returns true if there is room.
    pub fn wait_for_capacity(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.frames.len() >= self.inner.capacity && !state.draining {
            if self
                .inner
                .capacity_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.frames.len() < self.inner.capacity && !state.draining
    }

    /// Shared handle to a frame's buffers, or `None` if it is gone or never existed.
    pub fn get_frame(&self, frame_number: FrameNumber) -> Option<Arc<WorkingFrame>> {
        self.inner
            .state
            .lock()
            .frames
            .get(&frame_number)
            .map(|entry| entry.frame.clone())
    }

    pub fn frame_stage(&self, frame_number: FrameNumber) -> Option<Stage> {
        self.inner
            .state
            .lock()
            .frames
            .get(&frame_number)
            .map(|entry| entry.stage)
    }

    pub fn is_frame_checkpoint_set(&self, frame_number: FrameNumber, stage: Stage, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .frames
            .get(&frame_number)
            .map(|entry| entry.checkpoints.is_set(stage, name))
            .unwrap_or(false)
    }

    /// Mark one checkpoint as satisfied for a frame that is currently at `stage`.
    ///
    /// A frame at any other stage is left untouched and `WrongStage` is
    /// returned; this is how late callbacks racing a transition are caught.
    pub fn set_frame_checkpoint(
        &self,
        frame_number: FrameNumber,
        stage: Stage,
        name: &str,
    ) -> Result<(), FrameStoreError> {
        let changed = {
            let mut state = self.inner.state.lock();
            let entry = state
                .frames
                .get_mut(&frame_number)
                .ok_or(FrameStoreError::FrameNotFound(frame_number))?;
            if entry.stage != stage {
                return Err(FrameStoreError::WrongStage {
                    frame: frame_number,
                    expected: stage,
                    actual: entry.stage,
                });
            }
            entry.checkpoints.set(stage, name)?
        };

        if changed {
            debug!(
                "Frame {} checkpoint \"{}\" set at {}",
                frame_number, name, stage
            );
            self.wake_herder();
        }
        Ok(())
    }

    /// Stop accepting frames. In-flight frames still run through GONE; once
    /// the store is empty the drained event fires exactly once.
    pub fn set_draining(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
            info!(
                "Frame store draining with {} frames in flight",
                state.frames.len()
            );
        }
        self.inner.capacity_available.notify_all();
        self.wake_herder();
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// True once the drained event has fired.
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().drained
    }

    pub fn frame_count(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    pub fn frame_numbers(&self) -> Vec<FrameNumber> {
        self.inner.state.lock().frames.keys().copied().collect()
    }

    pub fn on_stage_change<O>(&self, stage: Stage, observer: O) -> SubscriptionToken
    where
        O: StageObserver + 'static,
    {
        self.subscribe_stage(stage, Arc::new(observer))
    }

    pub fn subscribe_stage(&self, stage: Stage, observer: Arc<dyn StageObserver>) -> SubscriptionToken {
        self.inner.notifier.subscribe_stage(stage, observer)
    }

    pub fn on_drained<O>(&self, observer: O) -> SubscriptionToken
    where
        O: DrainObserver + 'static,
    {
        self.inner.notifier.subscribe_drained(Arc::new(observer))
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.notifier.unsubscribe(token)
    }

    pub fn clear_subscriptions(&self) {
        self.inner.notifier.clear();
    }

    /// Evaluate every frame once against the stage gate.
    ///
    /// Each frame whose current stage is fully checkpointed moves forward by
    /// exactly one stage. Stage observers run after the store lock has been
    /// released, frames entering GONE are destroyed after their observers
    /// ran, and the drained event fires once the store is empty.
    pub fn sweep(&self) -> SweepOutcome {
        let mut entered: Vec<(Stage, FrameTimestamps)> = Vec::new();
        let mut outcome = SweepOutcome::default();
        {
            let mut state = self.inner.state.lock();
            for entry in state.frames.values_mut() {
                if !entry.announced {
                    entry.announced = true;
                    outcome.announced += 1;
                    entered.push((Stage::New, entry.frame.timestamps().clone()));
                    continue;
                }
                if entry.stage.is_terminal() || !entry.checkpoints.is_satisfied(entry.stage) {
                    continue;
                }
                let previous = entry.stage;
                entry.stage = previous.next();
                entry.checkpoints.clear(previous);
                entered.push((entry.stage, entry.frame.timestamps().clone()));
            }
        }

        for (stage, timestamps) in &entered {
            debug!("Frame {} entered stage {}", timestamps.frame_number, stage);
            self.inner.notifier.notify_stage(*stage, timestamps);
            if stage.is_terminal() {
                self.destroy_frame(timestamps.frame_number);
                outcome.destroyed += 1;
            } else if *stage != Stage::New {
                outcome.advanced += 1;
            }
        }

        outcome.drained = self.fire_drained_if_empty();
        outcome
    }

    fn destroy_frame(&self, frame_number: FrameNumber) {
        let removed = {
            let mut state = self.inner.state.lock();
            state.frames.remove(&frame_number)
        };
        self.inner.capacity_available.notify_all();

        if let Some(entry) = removed {
            self.inner.metrics.lock().record(entry.inserted_at.elapsed());
            debug!("Destroyed frame {}", frame_number);
        }
    }

    fn fire_drained_if_empty(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.draining || state.drained || !state.frames.is_empty() {
                return false;
            }
            state.drained = true;
        }
        info!("Frame store drained");
        self.inner.notifier.notify_drained();
        true
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.lock().snapshot()
    }

    /// Ask the herder to stop even if frames remain.
    pub fn request_shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.wake_herder();
    }

    pub(crate) fn herder_should_exit(&self) -> bool {
        let state = self.inner.state.lock();
        state.shutdown || state.drained
    }

    fn wake_herder(&self) {
        *self.inner.wake_pending.lock() = true;
        self.inner.wake.notify_one();
    }

    /// Park the herder until something changes or `timeout` passes.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut pending = self.inner.wake_pending.lock();
        if !*pending {
            self.inner.wake.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_with_depth(depth: usize) -> FrameStore {
        FrameStore::new(&FrameStoreConfig {
            max_queue_depth: depth,
            detection_bounding_box: 0,
            detection_scale_factor: 0.5,
            ..Default::default()
        })
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]))
    }

    fn insert(store: &FrameStore, frame_number: FrameNumber) -> Result<FrameNumber, FrameStoreError> {
        store.insert_new_frame(image(), FrameTimestamps::at_frame_rate(frame_number, 30.0))
    }

    /// Sweep until nothing moves any more.
    fn settle(store: &FrameStore) {
        for _ in 0..64 {
            if !store.sweep().made_progress() {
                return;
            }
        }
        panic!("store did not settle");
    }

    #[test]
    fn insertion_beyond_capacity_is_backpressure() {
        let store = store_with_depth(2);
        assert_eq!(insert(&store, 1), Ok(1));
        assert_eq!(insert(&store, 2), Ok(2));
        assert_eq!(
            insert(&store, 3),
            Err(FrameStoreError::Backpressure { capacity: 2 })
        );
        assert_eq!(store.frame_count(), 2);

        // With nothing registered, frames run straight through to GONE.
        settle(&store);
        assert_eq!(store.frame_count(), 0);
        assert_eq!(insert(&store, 3), Ok(3));
    }

    #[test]
    fn capacity_frees_up_once_one_frame_is_gone() {
        let store = store_with_depth(2);
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        insert(&store, 1).unwrap();
        insert(&store, 2).unwrap();
        settle(&store);
        assert!(insert(&store, 3).is_err());

        store.set_frame_checkpoint(1, Stage::Detection, "face").unwrap();
        settle(&store);
        assert_eq!(store.frame_stage(1), None);
        assert_eq!(store.frame_stage(2), Some(Stage::Detection));
        assert_eq!(insert(&store, 3), Ok(3));
    }

    #[test]
    fn frame_waits_for_its_checkpoint_then_advances_once() {
        let store = store_with_depth(10);
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        let tracking_calls = Arc::new(AtomicUsize::new(0));
        let counter = tracking_calls.clone();
        store.on_stage_change(Stage::Tracking, move |_: Stage, _: &FrameTimestamps| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        insert(&store, 1).unwrap();
        store.sweep(); // announce at NEW
        store.sweep(); // NEW -> DETECTION
        assert_eq!(store.frame_stage(1), Some(Stage::Detection));

        store.sweep();
        assert_eq!(store.frame_stage(1), Some(Stage::Detection));
        assert_eq!(tracking_calls.load(Ordering::SeqCst), 0);

        store.set_frame_checkpoint(1, Stage::Detection, "face").unwrap();
        store.sweep();
        assert_eq!(store.frame_stage(1), Some(Stage::Tracking));
        assert_eq!(tracking_calls.load(Ordering::SeqCst), 1);

        settle(&store);
        assert_eq!(tracking_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checkpoint_for_wrong_stage_is_rejected_without_side_effects() {
        let store = store_with_depth(10);
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        store.register_stage_checkpoint(Stage::Mapping, "markers").unwrap();
        insert(&store, 5).unwrap();
        settle(&store);

        assert_eq!(
            store.set_frame_checkpoint(5, Stage::Mapping, "markers"),
            Err(FrameStoreError::WrongStage {
                frame: 5,
                expected: Stage::Mapping,
                actual: Stage::Detection,
            })
        );
        assert_eq!(store.frame_stage(5), Some(Stage::Detection));
        assert!(!store.is_frame_checkpoint_set(5, Stage::Mapping, "markers"));

        assert!(matches!(
            store.set_frame_checkpoint(5, Stage::Detection, "nose"),
            Err(FrameStoreError::UnknownCheckpoint { .. })
        ));
        assert_eq!(
            store.set_frame_checkpoint(6, Stage::Detection, "face"),
            Err(FrameStoreError::FrameNotFound(6))
        );
        settle(&store);
        assert_eq!(store.frame_stage(5), Some(Stage::Detection));
    }

    #[test]
    fn late_registration_does_not_block_frames_in_flight() {
        let store = store_with_depth(10);
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        insert(&store, 1).unwrap();
        settle(&store);
        store.set_frame_checkpoint(1, Stage::Detection, "face").unwrap();
        store.sweep();
        assert_eq!(store.frame_stage(1), Some(Stage::Tracking));

        store.register_stage_checkpoint(Stage::Detection, "eyes").unwrap();
        store.register_stage_checkpoint(Stage::Previewing, "hud").unwrap();
        settle(&store);
        assert_eq!(store.frame_stage(1), None);

        insert(&store, 2).unwrap();
        settle(&store);
        store.set_frame_checkpoint(2, Stage::Detection, "face").unwrap();
        settle(&store);
        assert_eq!(store.frame_stage(2), Some(Stage::Detection));
    }

    #[test]
    fn stage_never_regresses() {
        let store = store_with_depth(10);
        store.register_stage_checkpoint(Stage::Mapping, "markers").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for stage in Stage::ALL {
            let seen = seen.clone();
            store.on_stage_change(stage, move |stage: Stage, ts: &FrameTimestamps| {
                seen.lock().push((ts.frame_number, stage));
            });
        }

        insert(&store, 1).unwrap();
        insert(&store, 2).unwrap();
        settle(&store);
        store.set_frame_checkpoint(2, Stage::Mapping, "markers").unwrap();
        settle(&store);
        store.set_frame_checkpoint(1, Stage::Mapping, "markers").unwrap();
        settle(&store);

        let seen = seen.lock();
        for frame in [1, 2] {
            let stages: Vec<Stage> = seen
                .iter()
                .filter(|(n, _)| *n == frame)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(stages, Stage::ALL.to_vec());
        }
        // Frame 2 was released first and finished first.
        let gone_order: Vec<FrameNumber> = seen
            .iter()
            .filter(|(_, s)| *s == Stage::Gone)
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(gone_order, vec![2, 1]);
    }

    #[test]
    fn draining_rejects_inserts_and_fires_once_when_empty() {
        let store = store_with_depth(10);
        store.register_stage_checkpoint(Stage::Draining, "output").unwrap();
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = drained.clone();
        store.on_drained(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        insert(&store, 1).unwrap();
        store.set_draining();
        assert_eq!(insert(&store, 2), Err(FrameStoreError::Draining));

        settle(&store);
        assert_eq!(store.frame_stage(1), Some(Stage::Draining));
        assert_eq!(drained.load(Ordering::SeqCst), 0);
        assert!(!store.is_drained());

        store.set_frame_checkpoint(1, Stage::Draining, "output").unwrap();
        settle(&store);
        assert_eq!(store.frame_count(), 0);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert!(store.is_drained());

        store.set_draining();
        store.sweep();
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn draining_an_empty_store_fires_on_next_sweep() {
        let store = store_with_depth(1);
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = drained.clone();
        store.on_drained(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set_draining();
        assert!(store.sweep().drained);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_frame_numbers_are_rejected() {
        let store = store_with_depth(4);
        insert(&store, 1).unwrap();
        assert_eq!(insert(&store, 1), Err(FrameStoreError::DuplicateFrame(1)));
    }

    #[test]
    fn registering_against_gone_fails() {
        let store = store_with_depth(4);
        assert_eq!(
            store.register_stage_checkpoint(Stage::Gone, "free"),
            Err(FrameStoreError::CheckpointOnGone("free".to_string()))
        );
    }

    #[test]
    fn observers_can_set_checkpoints_from_inside_callbacks() {
        let store = store_with_depth(4);
        store.register_stage_checkpoint(Stage::Detection, "face").unwrap();
        let handle = store.clone();
        store.on_stage_change(Stage::Detection, move |stage: Stage, ts: &FrameTimestamps| {
            handle
                .set_frame_checkpoint(ts.frame_number, stage, "face")
                .unwrap();
        });

        insert(&store, 1).unwrap();
        settle(&store);
        assert_eq!(store.frame_count(), 0);
        assert_eq!(store.metrics().frames_completed, 1);
        store.clear_subscriptions();
    }

    #[test]
    fn stuck_frame_does_not_hold_back_other_frames() {
        let store = store_with_depth(4);
        store.register_stage_checkpoint(Stage::Tracking, "landmarks").unwrap();
        insert(&store, 1).unwrap();
        insert(&store, 2).unwrap();
        settle(&store);
        store.set_frame_checkpoint(2, Stage::Tracking, "landmarks").unwrap();
        settle(&store);

        assert_eq!(store.frame_stage(1), Some(Stage::Tracking));
        assert_eq!(store.frame_stage(2), None);
    }

    #[test]
    fn detection_buffer_is_built_at_insertion() {
        let store = store_with_depth(4);
        insert(&store, 1).unwrap();
        let frame = store.get_frame(1).unwrap();
        assert_eq!(frame.detection_frame().dimensions(), (8, 8));
        assert_eq!(frame.timestamps().frame_number, 1);
    }

    #[test]
    fn wait_for_capacity_times_out_when_full() {
        let store = store_with_depth(1);
        insert(&store, 1).unwrap();
        assert!(!store.wait_for_capacity(Duration::from_millis(20)));
        settle(&store);
        assert!(store.wait_for_capacity(Duration::from_millis(20)));
    }
}
