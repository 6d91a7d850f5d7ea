pub mod events;
pub mod frame_store;
pub mod herder;
pub mod metrics;
pub mod stage_gate;

pub use events::{DrainObserver, EventNotifier, StageObserver, SubscriptionToken};
pub use frame_store::{FrameStore, SweepOutcome};
pub use herder::Herder;
pub use metrics::{FrameMetrics, MetricsSnapshot};
pub use stage_gate::{StageCheckpoints, StageRegistry};
