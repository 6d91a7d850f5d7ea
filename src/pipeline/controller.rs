use crate::config::Configuration;
use crate::error::{FrameStoreError, PipelineError};
use crate::pipeline::services::classification::FaceClassifier;
use crate::pipeline::services::output::{open_writer, OutputDriver, RecordSource};
use crate::pipeline::services::preview::{HudLayer, PreviewDensity, PreviewRenderer};
use crate::pipeline::services::tracking::{
    ColorMarkerSeparator, FaceMapper, LinearDriftBlend, PointBlend, TrackerRegistry,
};
use crate::pipeline::services::FaceLocator;
use crate::pipeline::store::{DrainObserver, FrameStore, Herder, MetricsSnapshot, SubscriptionToken};
use crate::pipeline::types::{FrameNumber, FrameTimestamps};
use image::RgbImage;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to a frame handed to [`PipelineController::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted(FrameNumber),
    /// Low-latency mode only: no room in the store, so the frame was discarded.
    Dropped,
    /// The store no longer accepts frames.
    Draining,
}

/// A running pipeline: store, herder and every stage participant.
///
/// Dropping the controller stops the herder first, then the participants,
/// and finally clears all store subscriptions.
pub struct PipelineController {
    configuration: Configuration,
    store: FrameStore,
    herder: Option<Herder>,
    output: Option<Arc<OutputDriver>>,
    preview: Option<Arc<PreviewRenderer>>,
    mapper: Option<Arc<FaceMapper>>,
    classifier: Option<Arc<FaceClassifier>>,
    frames_dropped: AtomicU64,
    ingest_lock: Mutex<()>,
}

impl PipelineController {
    pub fn builder(configuration: Configuration) -> PipelineBuilder {
        PipelineBuilder::new(configuration)
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn classifier(&self) -> Option<&Arc<FaceClassifier>> {
        self.classifier.as_ref()
    }

    pub fn mapper(&self) -> Option<&Arc<FaceMapper>> {
        self.mapper.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<OutputDriver>> {
        self.output.as_ref()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.store.metrics()
    }

    /// Hand a captured frame to the store.
    ///
    /// In low-latency mode a full store drops the frame straight away.
    /// Otherwise this blocks until there is room or draining begins, warning
    /// every `stall_log_ms` while it waits.
    pub fn ingest(
        &self,
        image: RgbImage,
        timestamps: FrameTimestamps,
    ) -> Result<IngestOutcome, PipelineError> {
        let frame_number = timestamps.frame_number;
        let store_config = &self.configuration.frame_store;
        let _serial = self.ingest_lock.lock();

        if !store_config.low_latency {
            let mut stalls = 0u64;
            while !self.store.wait_for_capacity(store_config.stall_log_interval()) {
                if self.store.is_draining() {
                    return Ok(IngestOutcome::Draining);
                }
                stalls += 1;
                warn!(
                    "Frame {} still waiting for room after {}ms",
                    frame_number,
                    stalls * store_config.stall_log_ms
                );
            }
        }

        match self.store.insert_new_frame(image, timestamps) {
            Ok(frame_number) => Ok(IngestOutcome::Accepted(frame_number)),
            Err(FrameStoreError::Backpressure { capacity }) if store_config.low_latency => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping frame {}: frame store full ({} frames)",
                    frame_number, capacity
                );
                Ok(IngestOutcome::Dropped)
            }
            Err(FrameStoreError::Draining) => Ok(IngestOutcome::Draining),
            // Buffered backpressure here means something inserted around the controller.
            Err(e) => Err(e.into()),
        }
    }

    /// End of stream: let in-flight frames finish, then fire the drained event.
    pub fn set_draining(&self) {
        self.store.set_draining();
    }

    pub fn on_drained<O>(&self, observer: O) -> SubscriptionToken
    where
        O: DrainObserver + 'static,
    {
        self.store.on_drained(observer)
    }

    pub fn is_drained(&self) -> bool {
        self.store.is_drained()
    }

    /// Block until the herder exits, which it does once the store drained.
    pub fn wait_for_herder(&mut self) {
        if let Some(herder) = self.herder.take() {
            herder.join();
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Some(herder) = self.herder.take() {
            herder.shutdown();
        }
        if let Some(output) = self.output.take() {
            output.stop();
        }
        if let Some(preview) = self.preview.take() {
            preview.stop();
        }
        if let Some(mapper) = self.mapper.take() {
            mapper.stop();
        }
        // Last owner: dropping it joins the classifier workers.
        self.classifier.take();
        self.store.clear_subscriptions();

        let metrics = self.store.metrics();
        info!(
            "Pipeline stopped: {} frames completed, {} dropped, avg {:?}, worst {:?}",
            metrics.frames_completed,
            self.frames_dropped(),
            metrics.average_time,
            metrics.worst_time
        );
    }
}

/// Wires a [`PipelineController`] together from configuration.
pub struct PipelineBuilder {
    configuration: Configuration,
    writer: Option<Box<dyn Write + Send>>,
    blend: Arc<dyn PointBlend>,
}

impl PipelineBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            writer: None,
            blend: Arc::new(LinearDriftBlend),
        }
    }

    /// Overrides the configured queue depth.
    pub fn max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.configuration.frame_store.max_queue_depth = max_queue_depth;
        self
    }

    /// Overrides the configured ingestion policy.
    pub fn low_latency(mut self, low_latency: bool) -> Self {
        self.configuration.frame_store.low_latency = low_latency;
        self
    }

    /// Writes frame records here instead of the configured output.
    pub fn output_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn point_blend(mut self, blend: Arc<dyn PointBlend>) -> Self {
        self.blend = blend;
        self
    }

    pub fn build(self) -> Result<PipelineController, PipelineError> {
        let configuration = self.configuration;
        configuration.validate()?;

        let store = FrameStore::new(&configuration.frame_store);

        let classifier = Arc::new(FaceClassifier::start(store.clone(), &configuration.classifier)?);
        let faces: Arc<dyn FaceLocator> = classifier.clone();

        let registry = TrackerRegistry::from_config(&configuration.tracker, self.blend)?;
        let separator = ColorMarkerSeparator::new(&configuration.tracker)?;
        let mapper = FaceMapper::start(store.clone(), faces, registry, Box::new(separator))?;

        let layers: Vec<Arc<dyn HudLayer>> = vec![classifier.clone(), mapper.clone()];
        let preview = PreviewRenderer::start(
            store.clone(),
            layers,
            PreviewDensity::from(configuration.preview.density),
        )?;

        let writer = match self.writer {
            Some(writer) => writer,
            None => open_writer(&configuration.output)?,
        };
        let sources: Vec<Arc<dyn RecordSource>> = vec![classifier.clone(), mapper.clone()];
        let output = OutputDriver::start(store.clone(), sources, writer)?;

        let herder = Herder::spawn(store.clone(), configuration.frame_store.herder_idle())?;

        debug!(
            "Pipeline built: {} classifier workers, queue depth {}, low latency {}",
            classifier.worker_count(),
            configuration.frame_store.max_queue_depth,
            configuration.frame_store.low_latency
        );

        Ok(PipelineController {
            configuration,
            store,
            herder: Some(herder),
            output: Some(output),
            preview: Some(preview),
            mapper: Some(mapper),
            classifier: Some(classifier),
            frames_dropped: AtomicU64::new(0),
            ingest_lock: Mutex::new(()),
        })
    }
}
