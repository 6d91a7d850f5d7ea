use crate::config::OutputConfig;
use crate::error::PipelineError;
use crate::pipeline::services::tracking::MarkerObservation;
use crate::pipeline::store::{FrameStore, SubscriptionToken};
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Rect, Stage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info};
use uuid::Uuid;

pub const OUTPUT_CHECKPOINT: &str = "output";

/// One line of output.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub session: Uuid,
    pub frame_number: FrameNumber,
    pub start_seconds: f64,
    pub estimated_end_seconds: f64,
    pub captured_at: DateTime<Utc>,
    pub face: Option<Rect>,
    /// Frame the face box was computed on; differs from `frame_number` when reused.
    pub face_from_frame: Option<FrameNumber>,
    pub markers: Vec<MarkerObservation>,
}

impl FrameRecord {
    pub fn new(session: Uuid, timestamps: &FrameTimestamps) -> Self {
        Self {
            session,
            frame_number: timestamps.frame_number,
            start_seconds: timestamps.start_seconds,
            estimated_end_seconds: timestamps.estimated_end_seconds,
            captured_at: timestamps.captured_at,
            face: None,
            face_from_frame: None,
            markers: Vec::new(),
        }
    }
}

/// Contributes its per-frame results to the output record.
pub trait RecordSource: Send + Sync {
    fn fill(&self, frame_number: FrameNumber, record: &mut FrameRecord);
}

/// Open the configured destination: a buffered file, or stdout.
pub fn open_writer(config: &OutputConfig) -> Result<Box<dyn Write + Send>, PipelineError> {
    match &config.path {
        Some(path) => {
            info!("Writing frame records to {}", path.display());
            Ok(Box::new(BufWriter::new(File::create(path)?)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// DRAINING stage participant: writes one JSON line per frame, then releases it.
///
/// A frame that cannot be written is logged and released anyway.
pub struct OutputDriver {
    store: FrameStore,
    session: Uuid,
    sources: Vec<Arc<dyn RecordSource>>,
    writer: Mutex<Box<dyn Write + Send>>,
    frames_written: AtomicU64,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl OutputDriver {
    pub fn start(
        store: FrameStore,
        sources: Vec<Arc<dyn RecordSource>>,
        writer: Box<dyn Write + Send>,
    ) -> Result<Arc<Self>, PipelineError> {
        store.register_stage_checkpoint(Stage::Draining, OUTPUT_CHECKPOINT)?;
        let driver = Arc::new(Self {
            store: store.clone(),
            session: Uuid::new_v4(),
            sources,
            writer: Mutex::new(writer),
            frames_written: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&driver);
        let on_frame = store.on_stage_change(
            Stage::Draining,
            move |_: Stage, timestamps: &FrameTimestamps| {
                if let Some(driver) = weak.upgrade() {
                    driver.handle(timestamps);
                }
            },
        );
        let weak: Weak<Self> = Arc::downgrade(&driver);
        let on_drained = store.on_drained(move || {
            if let Some(driver) = weak.upgrade() {
                if let Err(e) = driver.flush() {
                    error!("Failed to flush frame records: {}", e);
                }
            }
        });
        driver.subscriptions.lock().extend([on_frame, on_drained]);

        info!("Output driver started for session {}", driver.session);
        Ok(driver)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn handle(&self, timestamps: &FrameTimestamps) {
        if let Err(e) = self.write_frame(timestamps) {
            error!("Failed to write frame {}: {}", timestamps.frame_number, e);
        }
        if let Err(e) = self.store.set_frame_checkpoint(
            timestamps.frame_number,
            Stage::Draining,
            OUTPUT_CHECKPOINT,
        ) {
            error!(
                "Could not release frame {} from output: {}",
                timestamps.frame_number, e
            );
        }
    }

    pub fn record_for(&self, timestamps: &FrameTimestamps) -> FrameRecord {
        let mut record = FrameRecord::new(self.session, timestamps);
        for source in &self.sources {
            source.fill(timestamps.frame_number, &mut record);
        }
        record
    }

    pub fn write_frame(&self, timestamps: &FrameTimestamps) -> Result<(), PipelineError> {
        let record = self.record_for(timestamps);
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), PipelineError> {
        self.writer.lock().flush()?;
        Ok(())
    }

    pub fn stop(&self) {
        for token in self.subscriptions.lock().drain(..) {
            self.store.unsubscribe(token);
        }
        if let Err(e) = self.flush() {
            error!("Failed to flush frame records: {}", e);
        }
    }
}

impl Drop for OutputDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameStoreConfig;
    use crate::pipeline::services::tracking::{MarkerKind, TrackerState};
    use crate::pipeline::types::Point;
    use image::{Rgb, RgbImage};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FixedJaw;

    impl RecordSource for FixedJaw {
        fn fill(&self, _frame_number: FrameNumber, record: &mut FrameRecord) {
            record.face = Some(Rect::new(1.0, 2.0, 3.0, 4.0));
            record.markers.push(MarkerObservation {
                kind: MarkerKind::Jaw,
                state: TrackerState::Tracking,
                point: Some(Point::new(5.0, 6.0)),
            });
        }
    }

    fn run_until_drained(store: &FrameStore, frames: u64) {
        for n in 0..frames {
            store
                .insert_new_frame(
                    RgbImage::from_pixel(2, 2, Rgb([0, 0, 0])),
                    FrameTimestamps::at_frame_rate(n, 30.0),
                )
                .unwrap();
        }
        store.set_draining();
        for _ in 0..32 {
            if store.sweep().drained {
                return;
            }
        }
        panic!("store did not drain");
    }

    #[test]
    fn writes_one_json_line_per_frame() {
        let store = FrameStore::new(&FrameStoreConfig::default());
        let buffer = SharedBuffer::default();
        let driver = OutputDriver::start(
            store.clone(),
            vec![Arc::new(FixedJaw)],
            Box::new(buffer.clone()),
        )
        .unwrap();

        run_until_drained(&store, 3);
        assert_eq!(driver.frames_written(), 3);

        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["frame_number"], 1);
        assert_eq!(lines[1]["session"], driver.session().to_string());
        assert_eq!(lines[1]["face"]["width"], 3.0);
        assert_eq!(lines[1]["markers"][0]["kind"], "jaw");
        assert_eq!(lines[1]["markers"][0]["state"], "TRACKING");
    }

    #[test]
    fn write_failures_do_not_wedge_draining() {
        let store = FrameStore::new(&FrameStoreConfig::default());
        let driver = OutputDriver::start(store.clone(), Vec::new(), Box::new(BrokenWriter)).unwrap();
        run_until_drained(&store, 2);
        assert!(store.is_drained());
        assert_eq!(driver.frames_written(), 0);
    }
}
