use crucible_core::environment::EnvironmentError;
use crucible_core::errors::ProviderError;
use crucible_core::experiment::{ControlCommand, ExperimentStatus};
use crucible_sandbox::SandboxError;
use crucible_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("experiment deleted during execution")]
    ExperimentDeleted,

    /// Invalid-state-transition rejections are 4xx-class: the caller
    /// asked for something the state machine forbids.
    #[error("cannot {command:?} an experiment in status {status}")]
    InvalidTransition {
        status: ExperimentStatus,
        command: ControlCommand,
    },

    #[error("goal evaluation failed: {0}")]
    GoalEvaluation(String),

    #[error("hook failed: {0}")]
    Hook(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("{0}")]
    Internal(String),
}
