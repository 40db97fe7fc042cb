//! One-shot execution contexts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crucible_core::ids::ContextId;

use crate::errors::SandboxError;
use crate::runtime::ContainerRuntime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextStatus {
    Starting,
    Ready,
    Busy,
    Terminated,
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Result of one sandboxed execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
}

/// An isolated, resource-limited, single-use sandbox instance.
///
/// Owned exclusively by whoever acquired it from the pool. One `execute`
/// moves it READY → BUSY and it never returns to READY; the owner must
/// call `destroy` regardless of outcome. A second `execute`, or one after
/// `destroy`, is a programming error and fails fast.
pub struct ExecutionContext {
    id: ContextId,
    container_id: String,
    status: ContextStatus,
    expiry: Option<DateTime<Utc>>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecutionContext {
    pub fn new(container_id: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            id: ContextId::new(),
            container_id,
            status: ContextStatus::Ready,
            expiry: None,
            runtime,
        }
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: DateTime<Utc>) {
        self.expiry = Some(expiry);
    }

    /// Run a python script in the container: `code` is streamed over
    /// stdin (`python3 -`), `env_vars` become process environment, `args`
    /// are passed through to the script.
    #[instrument(skip(self, code, env_vars, args), fields(context = %self.id))]
    pub async fn execute(
        &mut self,
        code: &str,
        env_vars: &[(String, String)],
        args: &[String],
    ) -> Result<ExecResult, SandboxError> {
        if self.status != ContextStatus::Ready {
            return Err(SandboxError::InvalidState {
                context: self.id.to_string(),
                status: self.status.to_string(),
            });
        }
        // One-shot: stays BUSY until destroyed, preventing accidental reuse.
        self.status = ContextStatus::Busy;

        let start = Instant::now();
        let mut cmd: Vec<String> = vec!["python3".into(), "-".into()];
        cmd.extend(args.iter().cloned());

        let output = self
            .runtime
            .exec(&self.container_id, env_vars, &cmd, code)
            .await?;

        let result = ExecResult {
            stdout: output.stdout.trim().to_string(),
            stderr: output.stderr.trim().to_string(),
            exit_code: output.exit_code,
            duration: start.elapsed(),
        };
        debug!(
            context = %self.id,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "sandbox execution finished"
        );
        Ok(result)
    }

    /// Force-terminate and remove the container. Tolerates "already gone";
    /// any other runtime failure propagates, but the context is marked
    /// TERMINATED either way so it can never be reused.
    #[instrument(skip(self), fields(context = %self.id))]
    pub async fn destroy(&mut self) -> Result<(), SandboxError> {
        if self.status == ContextStatus::Terminated {
            return Ok(());
        }
        let result = self.runtime.remove_container(&self.container_id).await;
        self.status = ContextStatus::Terminated;
        result
    }
}
