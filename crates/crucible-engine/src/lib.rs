//! # crucible-engine
//!
//! The experiment execution engine: per-experiment event bus, lifecycle
//! hook dispatch, the step/role/tool-call orchestrator loop, goal
//! evaluation, the live-orchestrator registry, and external control
//! commands.
//!
//! Concurrency model: one single-threaded control flow per experiment
//! (the orchestrator's loop), many experiments side by side, and one
//! shared container pool underneath. The persisted experiment record is
//! the single source of truth for status; the loop re-reads it at the
//! top of every iteration, which is how PAUSE/STOP take effect.

pub mod bus;
pub mod control;
pub mod errors;
pub mod harness;
pub mod hooks;
pub mod orchestrator;
pub mod registry;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use control::{apply_control, launch_experiment};
pub use errors::EngineError;
pub use orchestrator::{ExperimentOrchestrator, OrchestratorDeps};
pub use registry::OrchestratorRegistry;
