use super::result_cache::{ResultCache, TimedResult};
use crate::error::PipelineError;
use crate::pipeline::store::{FrameStore, SubscriptionToken};
use crate::pipeline::types::{FrameNumber, FrameTimestamps, Stage, WorkingFrame};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// An expensive per-frame computation run by a [`WorkerPool`].
pub trait FrameJob: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;
    /// Per-thread state, e.g. a model instance that is not safe to share.
    type State: Send + 'static;

    fn name(&self) -> &'static str;

    fn init_state(&self, worker: usize) -> Result<Self::State, PipelineError>;

    /// `None` means the computation ran but found nothing valid.
    fn run(&self, state: &mut Self::State, frame: &WorkingFrame) -> Option<Self::Output>;
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Frames entering this stage are queued for work.
    pub stage: Stage,
    /// Checkpoint set on the frame once its work is done.
    pub checkpoint: String,
    pub workers: usize,
    pub good_for_seconds: f64,
    pub rerun_interval_seconds: f64,
}

impl PoolOptions {
    /// Number of workers for `workers_per_cpu` on this machine, at least one.
    pub fn workers_for(workers_per_cpu: f64) -> usize {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ((cores as f64 * workers_per_cpu).floor() as usize).max(1)
    }
}

/// Queue of frame numbers waiting for a worker. Closing it lets the workers
/// finish what is queued and then exit.
struct WorkQueue {
    sender: Mutex<Option<Sender<FrameNumber>>>,
    receiver: Receiver<FrameNumber>,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    fn push(&self, frame_number: FrameNumber) -> Result<(), TrySendError<FrameNumber>> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(frame_number),
            None => Err(TrySendError::Disconnected(frame_number)),
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }

    fn len(&self) -> usize {
        self.receiver.len()
    }
}

struct Worker<J: FrameJob> {
    index: usize,
    job: Arc<J>,
    store: FrameStore,
    receiver: Receiver<FrameNumber>,
    results: Arc<Mutex<ResultCache<J::Output>>>,
    options: PoolOptions,
}

impl<J: FrameJob> Worker<J> {
    fn run(self, mut state: J::State) {
        debug!("{} worker {} started", self.job.name(), self.index);
        while let Ok(frame_number) = self.receiver.recv() {
            self.process(&mut state, frame_number);
        }
        debug!("{} worker {} exiting", self.job.name(), self.index);
    }

    fn process(&self, state: &mut J::State, frame_number: FrameNumber) {
        let Some(frame) = self.store.get_frame(frame_number) else {
            warn!(
                "{} worker {}: frame {} is already gone, skipping",
                self.job.name(),
                self.index,
                frame_number
            );
            return;
        };

        let reused = self
            .results
            .lock()
            .reusable_for(frame.timestamps(), self.options.rerun_interval_seconds);
        let result = match reused {
            Some(result) => result,
            None => {
                let start = Instant::now();
                let value = self.job.run(state, &frame);
                debug!(
                    "{} worker {} ran frame {} in {}us (valid: {})",
                    self.job.name(),
                    self.index,
                    frame_number,
                    start.elapsed().as_micros(),
                    value.is_some()
                );
                TimedResult {
                    value,
                    timestamps: frame.timestamps().clone(),
                    ran: true,
                }
            }
        };
        drop(frame);

        self.results.lock().insert(frame_number, result);

        if let Err(e) =
            self.store
                .set_frame_checkpoint(frame_number, self.options.stage, &self.options.checkpoint)
        {
            warn!(
                "{} worker {} could not checkpoint frame {}: {}",
                self.job.name(),
                self.index,
                frame_number,
                e
            );
        }
    }
}

/// N threads pulling frame numbers from a shared queue.
///
/// Frames are queued when they enter `options.stage`. Each finished frame
/// gets its result cached and `options.checkpoint` set, which is what lets
/// it leave the stage. The queue closes when the store drains; dropping the
/// pool closes it too and joins every worker.
pub struct WorkerPool<J: FrameJob> {
    name: &'static str,
    store: FrameStore,
    queue: Arc<WorkQueue>,
    results: Arc<Mutex<ResultCache<J::Output>>>,
    workers: Vec<JoinHandle<()>>,
    subscriptions: Vec<SubscriptionToken>,
}

impl<J: FrameJob> WorkerPool<J> {
    pub fn start(job: J, store: FrameStore, options: PoolOptions) -> Result<Self, PipelineError> {
        if options.stage.is_terminal() {
            return Err(PipelineError::InvalidParameter {
                name: "stage",
                reason: "a worker pool cannot serve the GONE stage".to_string(),
            });
        }
        store.register_stage_checkpoint(options.stage, &options.checkpoint)?;

        let name = job.name();
        let job = Arc::new(job);
        let queue = Arc::new(WorkQueue::new(store.capacity()));
        let results = Arc::new(Mutex::new(ResultCache::new(options.good_for_seconds)));

        let mut pool = Self {
            name,
            store: store.clone(),
            queue: queue.clone(),
            results: results.clone(),
            workers: Vec::with_capacity(options.workers),
            subscriptions: Vec::new(),
        };

        // On an early return, dropping `pool` closes the queue and joins
        // whatever already started.
        for index in 0..options.workers.max(1) {
            let state = job.init_state(index)?;
            let worker = Worker {
                index,
                job: job.clone(),
                store: store.clone(),
                receiver: queue.receiver.clone(),
                results: results.clone(),
                options: options.clone(),
            };
            let thread_name = format!("{}-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker.run(state))
                .map_err(|e| PipelineError::Spawn(thread_name, e))?;
            pool.workers.push(handle);
        }

        let enqueue = queue.clone();
        pool.subscriptions.push(store.on_stage_change(
            options.stage,
            move |stage: Stage, timestamps: &FrameTimestamps| {
                if let Err(e) = enqueue.push(timestamps.frame_number) {
                    warn!(
                        "{}: could not queue frame {} entering {}: {}",
                        name, timestamps.frame_number, stage, e
                    );
                }
            },
        ));

        let evict = results.clone();
        pool.subscriptions.push(store.on_stage_change(
            Stage::Gone,
            move |_: Stage, timestamps: &FrameTimestamps| {
                evict.lock().evict(timestamps.frame_number);
            },
        ));

        let closing = queue.clone();
        pool.subscriptions.push(store.on_drained(move || {
            debug!("{}: store drained, closing work queue", name);
            closing.close();
        }));

        info!(
            "{} worker pool started with {} workers on stage {}",
            name,
            pool.workers.len(),
            options.stage
        );
        Ok(pool)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Result for a frame using the cache's freshness and fallback rules.
    ///
    /// Frames are judged by their own timestamps. A frame that is already
    /// gone has had its result evicted and gets nothing.
    pub fn get_result(&self, frame_number: FrameNumber) -> Option<TimedResult<J::Output>> {
        let frame = self.store.get_frame(frame_number)?;
        self.get_result_for(frame.timestamps())
    }

    pub fn get_result_for(&self, timestamps: &FrameTimestamps) -> Option<TimedResult<J::Output>> {
        self.results.lock().lookup(timestamps)
    }

    pub fn latest_good(&self) -> Option<TimedResult<J::Output>> {
        self.results.lock().latest_good().cloned()
    }

    /// Close the queue, let workers finish what is queued, and join them.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            }
        }
        for token in self.subscriptions.drain(..) {
            self.store.unsubscribe(token);
        }
    }
}

impl<J: FrameJob> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
