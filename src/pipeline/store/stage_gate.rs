use crate::error::FrameStoreError;
use crate::pipeline::types::{Stage, STAGE_COUNT};
use indexmap::{IndexMap, IndexSet};

/// Checkpoint names that must all be satisfied before a frame may leave each stage.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    checkpoints: [IndexSet<String>; STAGE_COUNT],
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` when the name was already registered for this stage.
    pub fn register(&mut self, stage: Stage, name: &str) -> Result<bool, FrameStoreError> {
        if stage.is_terminal() {
            return Err(FrameStoreError::CheckpointOnGone(name.to_string()));
        }
        Ok(self.checkpoints[stage.index()].insert(name.to_string()))
    }

    pub fn is_registered(&self, stage: Stage, name: &str) -> bool {
        self.checkpoints[stage.index()].contains(name)
    }

    pub fn checkpoints(&self, stage: Stage) -> impl Iterator<Item = &str> {
        self.checkpoints[stage.index()].iter().map(String::as_str)
    }
}

/// Per-frame checkpoint state, one map per stage.
///
/// Snapshotted from the registry when the frame is inserted, so a checkpoint
/// registered later never gates a frame that is already in flight.
#[derive(Debug, Clone)]
pub struct StageCheckpoints {
    stages: [IndexMap<String, bool>; STAGE_COUNT],
}

impl StageCheckpoints {
    pub fn from_registry(registry: &StageRegistry) -> Self {
        let stages = std::array::from_fn(|index| {
            registry.checkpoints[index]
                .iter()
                .map(|name| (name.clone(), false))
                .collect()
        });
        Self { stages }
    }

    /// Mark `name` as satisfied. Returns `Ok(false)` if it was already set.
    pub fn set(&mut self, stage: Stage, name: &str) -> Result<bool, FrameStoreError> {
        match self.stages[stage.index()].get_mut(name) {
            Some(done) => {
                let changed = !*done;
                *done = true;
                Ok(changed)
            }
            None => Err(FrameStoreError::UnknownCheckpoint {
                stage,
                name: name.to_string(),
            }),
        }
    }

    pub fn is_set(&self, stage: Stage, name: &str) -> bool {
        self.stages[stage.index()]
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_satisfied(&self, stage: Stage) -> bool {
        self.stages[stage.index()].values().all(|done| *done)
    }

    /// Names still blocking `stage`.
    pub fn pending(&self, stage: Stage) -> Vec<&str> {
        self.stages[stage.index()]
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Forget a stage the frame has already left.
    pub fn clear(&mut self, stage: Stage) {
        self.stages[stage.index()].clear();
    }
}
