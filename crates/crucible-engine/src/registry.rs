//! Process-wide map of live orchestrators.
//!
//! Explicitly constructed and injected; whoever needs control commands
//! or live event streaming looks orchestrators up here. Exactly one
//! orchestrator may be registered per experiment.

use std::sync::Arc;

use dashmap::DashMap;

use crucible_core::ids::ExperimentId;

use crate::orchestrator::ExperimentOrchestrator;

#[derive(Default)]
pub struct OrchestratorRegistry {
    orchestrators: DashMap<ExperimentId, Arc<ExperimentOrchestrator>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        Self {
            orchestrators: DashMap::new(),
        }
    }

    /// Register a live orchestrator, replacing any previous entry for
    /// the same experiment.
    pub fn register(&self, orchestrator: Arc<ExperimentOrchestrator>) {
        let _ = self
            .orchestrators
            .insert(orchestrator.experiment_id().clone(), orchestrator);
    }

    pub fn get(&self, experiment_id: &ExperimentId) -> Option<Arc<ExperimentOrchestrator>> {
        self.orchestrators
            .get(experiment_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, experiment_id: &ExperimentId) {
        let _ = self.orchestrators.remove(experiment_id);
    }

    pub fn contains(&self, experiment_id: &ExperimentId) -> bool {
        self.orchestrators.contains_key(experiment_id)
    }

    pub fn len(&self) -> usize {
        self.orchestrators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orchestrators.is_empty()
    }
}
