pub mod result_cache;
pub mod worker_pool;

pub use result_cache::{ResultCache, TimedResult};
pub use worker_pool::{FrameJob, PoolOptions, WorkerPool};
