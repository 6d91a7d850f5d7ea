use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling statistics over the most recent completed frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub frames_completed: u64,
    pub average_time: Duration,
    pub worst_time: Duration,
    pub frames_per_second: f64,
}

/// Tracks how long frames spend in the store, from insertion to destruction.
#[derive(Debug)]
pub struct FrameMetrics {
    window: usize,
    samples: VecDeque<(Instant, Duration)>,
    frames_completed: u64,
    report_every: u64,
}

impl FrameMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            frames_completed: 0,
            report_every: 0,
        }
    }

    /// Log a summary every `frames` completed frames (0 disables reporting).
    pub fn with_report_interval(mut self, frames: u64) -> Self {
        self.report_every = frames;
        self
    }

    pub fn record(&mut self, lifetime: Duration) {
        self.record_at(Instant::now(), lifetime);
    }

    fn record_at(&mut self, finished: Instant, lifetime: Duration) {
        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((finished, lifetime));
        self.frames_completed += 1;

        if self.report_every > 0 && self.frames_completed % self.report_every == 0 {
            let snapshot = self.snapshot();
            tracing::info!(
                frames = snapshot.frames_completed,
                avg_ms = snapshot.average_time.as_secs_f64() * 1000.0,
                worst_ms = snapshot.worst_time.as_secs_f64() * 1000.0,
                fps = snapshot.frames_per_second,
                "Frame store throughput"
            );
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if self.samples.is_empty() {
            return MetricsSnapshot {
                frames_completed: self.frames_completed,
                ..Default::default()
            };
        }

        let total: Duration = self.samples.iter().map(|(_, lifetime)| *lifetime).sum();
        let worst = self
            .samples
            .iter()
            .map(|(_, lifetime)| *lifetime)
            .max()
            .unwrap_or_default();

        // FPS needs at least two completions to measure a span.
        let frames_per_second = match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) if self.samples.len() > 1 => {
                let span = last.duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (self.samples.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        MetricsSnapshot {
            frames_completed: self.frames_completed,
            average_time: total / self.samples.len() as u32,
            worst_time: worst,
            frames_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_average_and_worst() {
        let mut metrics = FrameMetrics::new(3);
        let start = Instant::now();
        metrics.record_at(start, Duration::from_millis(10));
        metrics.record_at(start + Duration::from_millis(100), Duration::from_millis(30));
        metrics.record_at(start + Duration::from_millis(200), Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_completed, 3);
        assert_eq!(snapshot.average_time, Duration::from_millis(20));
        assert_eq!(snapshot.worst_time, Duration::from_millis(30));
        assert!((snapshot.frames_per_second - 10.0).abs() < 1e-6);
    }

    #[test]
    fn window_discards_old_samples() {
        let mut metrics = FrameMetrics::new(2);
        let start = Instant::now();
        metrics.record_at(start, Duration::from_millis(500));
        metrics.record_at(start, Duration::from_millis(10));
        metrics.record_at(start, Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_completed, 3);
        assert_eq!(snapshot.worst_time, Duration::from_millis(10));
    }
}
