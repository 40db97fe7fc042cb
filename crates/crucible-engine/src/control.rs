//! External control commands and experiment launch.
//!
//! Commands take effect by writing the persisted status; a running loop
//! observes the change at the top of its next iteration. RESUME
//! additionally finds or constructs a live orchestrator and restarts its
//! loop (the loop exits when it observes PAUSED).

use std::sync::Arc;

use tracing::{error, info, instrument};

use crucible_core::experiment::{transition, ControlCommand, Experiment, ExperimentStatus};
use crucible_core::ids::{ExperimentId, PlanId};
use crucible_store::experiments::ExperimentRepo;
use crucible_store::plans::PlanRepo;

use crate::errors::EngineError;
use crate::orchestrator::{ExperimentOrchestrator, OrchestratorDeps};
use crate::registry::OrchestratorRegistry;

/// Create an experiment for a plan, register a fresh orchestrator, and
/// start its loop in the background. Returns the new experiment id.
#[instrument(skip(deps, registry))]
pub async fn launch_experiment(
    deps: &OrchestratorDeps,
    registry: &Arc<OrchestratorRegistry>,
    plan_id: &PlanId,
) -> Result<ExperimentId, EngineError> {
    let plan = PlanRepo::new(deps.db.clone())
        .find(plan_id)?
        .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;

    let experiment = Experiment::new(plan.id.clone());
    ExperimentRepo::new(deps.db.clone()).insert(&experiment)?;

    let orchestrator = Arc::new(ExperimentOrchestrator::new(
        experiment.id.clone(),
        deps.clone(),
    ));
    registry.register(Arc::clone(&orchestrator));
    spawn_loop(orchestrator, Arc::clone(registry), deps.clone());

    info!(experiment_id = %experiment.id, plan = %plan.name, "experiment launched");
    Ok(experiment.id)
}

/// Apply PAUSE/RESUME/STOP against the fixed transition matrix. Returns
/// the resulting status; invalid (status, command) pairs are rejected
/// with `EngineError::InvalidTransition`.
#[instrument(skip(deps, registry))]
pub async fn apply_control(
    deps: &OrchestratorDeps,
    registry: &Arc<OrchestratorRegistry>,
    experiment_id: &ExperimentId,
    command: ControlCommand,
) -> Result<ExperimentStatus, EngineError> {
    let experiments = ExperimentRepo::new(deps.db.clone());
    let experiment = experiments
        .find(experiment_id)?
        .ok_or_else(|| EngineError::ExperimentNotFound(experiment_id.to_string()))?;

    let next = transition(experiment.status, command).ok_or(EngineError::InvalidTransition {
        status: experiment.status,
        command,
    })?;

    experiments.update_status(experiment_id, next)?;
    info!(from = %experiment.status, to = %next, "control command applied");

    if command == ControlCommand::Resume {
        // Find a live orchestrator or construct and register a new one
        // (process-restart case), then restart its loop if idle.
        let orchestrator = match registry.get(experiment_id) {
            Some(orchestrator) => orchestrator,
            None => {
                let orchestrator = Arc::new(ExperimentOrchestrator::new(
                    experiment_id.clone(),
                    deps.clone(),
                ));
                registry.register(Arc::clone(&orchestrator));
                orchestrator
            }
        };
        if !orchestrator.is_running() {
            spawn_loop(orchestrator, Arc::clone(registry), deps.clone());
        }
    }

    Ok(next)
}

/// Drive an orchestrator's loop to its end on a detached task, then
/// deregister it once the experiment is terminal.
fn spawn_loop(
    orchestrator: Arc<ExperimentOrchestrator>,
    registry: Arc<OrchestratorRegistry>,
    deps: OrchestratorDeps,
) {
    drop(tokio::spawn(async move {
        let experiment_id = orchestrator.experiment_id().clone();
        if let Err(e) = orchestrator.start().await {
            error!(experiment_id = %experiment_id, error = %e, "orchestrator start failed");
        }

        let terminal = ExperimentRepo::new(deps.db)
            .find(&experiment_id)
            .ok()
            .flatten()
            .map(|experiment| experiment.status.is_terminal())
            .unwrap_or(true);
        if terminal {
            registry.remove(&experiment_id);
        }
    }));
}
