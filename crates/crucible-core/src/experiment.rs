//! Experiment records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::ids::{ExperimentId, PlanId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl ExperimentStatus {
    /// Terminal statuses are absorbing: no control command applies and the
    /// experiment may be deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

impl std::str::FromStr for ControlCommand {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "STOP" => Ok(Self::Stop),
            other => Err(format!("unknown control command: {other}")),
        }
    }
}

/// The fixed (status, command) transition table. `None` means rejected.
///
/// PAUSE on PAUSED and RESUME on RUNNING are idempotent successes; STOP
/// succeeds from any non-terminal status; terminal statuses reject every
/// command.
pub fn transition(status: ExperimentStatus, command: ControlCommand) -> Option<ExperimentStatus> {
    use ControlCommand::{Pause, Resume, Stop};
    use ExperimentStatus::{Initializing, Paused, Running, Stopped};

    match (status, command) {
        (Running | Paused, Pause) => Some(Paused),
        (Running | Paused, Resume) => Some(Running),
        (Initializing | Running | Paused, Stop) => Some(Stopped),
        _ => None,
    }
}

/// One running or finished instantiation of a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: ExperimentId,
    pub plan_id: PlanId,
    pub status: ExperimentStatus,
    pub current_step: u32,
    #[serde(default)]
    pub current_environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Experiment {
    /// A fresh experiment for a plan, as created at launch.
    pub fn new(plan_id: PlanId) -> Self {
        Self {
            id: ExperimentId::new(),
            plan_id,
            status: ExperimentStatus::Initializing,
            current_step: 0,
            current_environment: Environment::new(),
            start_time: None,
            end_time: None,
            result: None,
        }
    }

    /// Elapsed wall-clock duration in milliseconds, once ended.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                u64::try_from((end - start).num_milliseconds().max(0)).ok()
            }
            _ => None,
        }
    }
}
