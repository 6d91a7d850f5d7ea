use crate::pipeline::types::{FrameNumber, FrameTimestamps};
use std::collections::HashMap;

/// A computed per-frame result and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedResult<R> {
    pub value: Option<R>,
    /// The frame the computation actually ran on.
    pub timestamps: FrameTimestamps,
    /// False when the value was reused from an earlier frame.
    pub ran: bool,
}

impl<R> TimedResult<R> {
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

/// Per-frame results plus a rolling latest-good fallback.
///
/// Freshness is measured in stream time: a result is fresh for a frame when
/// it was computed no more than `good_for_seconds` before that frame.
#[derive(Debug)]
pub struct ResultCache<R> {
    results: HashMap<FrameNumber, TimedResult<R>>,
    latest_good: Option<TimedResult<R>>,
    good_for_seconds: f64,
}

impl<R: Clone> ResultCache<R> {
    pub fn new(good_for_seconds: f64) -> Self {
        Self {
            results: HashMap::new(),
            latest_good: None,
            good_for_seconds,
        }
    }

    pub fn good_for_seconds(&self) -> f64 {
        self.good_for_seconds
    }

    pub fn insert(&mut self, frame_number: FrameNumber, result: TimedResult<R>) {
        if result.is_valid() && result.ran {
            let newer = self
                .latest_good
                .as_ref()
                .map(|latest| result.timestamps.start_seconds >= latest.timestamps.start_seconds)
                .unwrap_or(true);
            if newer {
                self.latest_good = Some(result.clone());
            }
        }
        self.results.insert(frame_number, result);
    }

    pub fn latest_good(&self) -> Option<&TimedResult<R>> {
        self.latest_good.as_ref()
    }

    fn is_fresh_for(&self, result: &TimedResult<R>, frame: &FrameTimestamps) -> bool {
        frame.seconds_since(&result.timestamps) <= self.good_for_seconds
    }

    /// Best available answer for `frame`: its own result if fresh, otherwise
    /// the latest good result if fresh, otherwise nothing.
    pub fn lookup(&self, frame: &FrameTimestamps) -> Option<TimedResult<R>> {
        if let Some(result) = self.results.get(&frame.frame_number) {
            if self.is_fresh_for(result, frame) {
                return Some(result.clone());
            }
        }
        self.latest_good
            .as_ref()
            .filter(|latest| self.is_fresh_for(latest, frame))
            .cloned()
    }

    /// The latest good result if it may stand in for `frame` without rerunning.
    pub fn reusable_for(&self, frame: &FrameTimestamps, rerun_interval_seconds: f64) -> Option<TimedResult<R>> {
        self.latest_good
            .as_ref()
            .filter(|latest| {
                let age = frame.seconds_since(&latest.timestamps);
                age >= 0.0 && age < rerun_interval_seconds
            })
            .map(|latest| TimedResult {
                value: latest.value.clone(),
                timestamps: latest.timestamps.clone(),
                ran: false,
            })
    }

    pub fn evict(&mut self, frame_number: FrameNumber) -> Option<TimedResult<R>> {
        self.results.remove(&frame_number)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
