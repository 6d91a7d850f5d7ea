use crate::pipeline::types::{FrameTimestamps, Stage, STAGE_COUNT};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer pattern for frame stage transitions
pub trait StageObserver: Send + Sync {
    fn on_stage_change(&self, stage: Stage, timestamps: &FrameTimestamps);
}

impl<F> StageObserver for F
where
    F: Fn(Stage, &FrameTimestamps) + Send + Sync,
{
    fn on_stage_change(&self, stage: Stage, timestamps: &FrameTimestamps) {
        self(stage, timestamps)
    }
}

/// Notified once the store has drained after `set_draining`.
pub trait DrainObserver: Send + Sync {
    fn on_drained(&self);
}

impl<F> DrainObserver for F
where
    F: Fn() + Send + Sync,
{
    fn on_drained(&self) {
        self()
    }
}

/// Handle returned by every subscription, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type StageEntry = (SubscriptionToken, Arc<dyn StageObserver>);
type DrainEntry = (SubscriptionToken, Arc<dyn DrainObserver>);

/// Owns the subscription lists and dispatches events to them.
///
/// Observers are invoked with no lock held, so an observer may subscribe,
/// unsubscribe or call back into the frame store.
#[derive(Default)]
pub struct EventNotifier {
    next_token: AtomicU64,
    stage_observers: RwLock<[Vec<StageEntry>; STAGE_COUNT]>,
    drain_observers: RwLock<Vec<DrainEntry>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self) -> SubscriptionToken {
        SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe_stage(
        &self,
        stage: Stage,
        observer: Arc<dyn StageObserver>,
    ) -> SubscriptionToken {
        let token = self.token();
        self.stage_observers.write()[stage.index()].push((token, observer));
        token
    }

    pub fn subscribe_drained(&self, observer: Arc<dyn DrainObserver>) -> SubscriptionToken {
        let token = self.token();
        self.drain_observers.write().push((token, observer));
        token
    }

    /// Returns false if the token was unknown or already cancelled.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        {
            let mut stages = self.stage_observers.write();
            for observers in stages.iter_mut() {
                if let Some(position) = observers.iter().position(|(t, _)| *t == token) {
                    observers.remove(position);
                    return true;
                }
            }
        }
        let mut drains = self.drain_observers.write();
        match drains.iter().position(|(t, _)| *t == token) {
            Some(position) => {
                drains.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn notify_stage(&self, stage: Stage, timestamps: &FrameTimestamps) {
        let observers: Vec<Arc<dyn StageObserver>> = self.stage_observers.read()[stage.index()]
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_stage_change(stage, timestamps);
        }
    }

    pub fn notify_drained(&self) {
        let observers: Vec<Arc<dyn DrainObserver>> = self
            .drain_observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_drained();
        }
    }

    pub fn stage_observer_count(&self, stage: Stage) -> usize {
        self.stage_observers.read()[stage.index()].len()
    }

    /// Drop every subscription. Observers often hold handles back to the
    /// store, so this is what breaks those cycles at shutdown.
    pub fn clear(&self) {
        for observers in self.stage_observers.write().iter_mut() {
            observers.clear();
        }
        self.drain_observers.write().clear();
    }
}
