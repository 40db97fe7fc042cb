//! Container runtime collaborator boundary.
//!
//! [`ContainerRuntime`] is the seam between the pool and whatever actually
//! isolates code. The production implementation drives the `docker` CLI;
//! tests use the scripted runtime in [`crate::testutil`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::errors::SandboxError;

/// Per-context resource ceilings. These are the security boundary for
/// untrusted code and are applied to every container unconditionally.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerLimits {
    pub memory_bytes: u64,
    pub pids_limit: u32,
    /// Fraction of one CPU, e.g. 0.5 for half a core.
    pub cpu_quota: f64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            pids_limit: 50,
            cpu_quota: 0.5,
        }
    }
}

/// Captured output of one exec inside a container.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Operations the pool needs from an OCI-compatible runtime: image
/// presence, create/start, exec with stdin delivery and demultiplexed
/// stdout/stderr capture, and forced removal.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ensure the base image is present locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Create and start a container with the given limits and no network
    /// access. Returns the runtime's container identifier.
    async fn create_container(
        &self,
        image: &str,
        limits: &ContainerLimits,
    ) -> Result<String, SandboxError>;

    /// Run `cmd` inside the container with `env` injected and `stdin`
    /// streamed to the process, resolving once it exits.
    async fn exec(
        &self,
        container_id: &str,
        env: &[(String, String)],
        cmd: &[String],
        stdin: &str,
    ) -> Result<ExecOutput, SandboxError>;

    /// Force-terminate and remove. "Already gone" is success.
    async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError>;
}

/// Production runtime driving the `docker` CLI.
pub struct DockerCli {
    binary: String,
    /// Optional hard bound on a single exec. `None` preserves the
    /// historical behavior of waiting indefinitely.
    exec_timeout: Option<Duration>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".into(),
            exec_timeout: None,
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = Some(timeout);
        self
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        debug!(args = ?args, "docker invocation");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("spawn {}: {e}", self.binary)))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        let inspect = self.run(&["image", "inspect", image]).await?;
        if inspect.status.success() {
            return Ok(());
        }

        info!(image, "base image missing, pulling");
        let pull = self.run(&["pull", image]).await?;
        if !pull.status.success() {
            return Err(SandboxError::Runtime(format!(
                "pull {image}: {}",
                stderr_text(&pull)
            )));
        }
        info!(image, "image pulled");
        Ok(())
    }

    #[instrument(skip(self, limits))]
    async fn create_container(
        &self,
        image: &str,
        limits: &ContainerLimits,
    ) -> Result<String, SandboxError> {
        let memory = limits.memory_bytes.to_string();
        let pids = limits.pids_limit.to_string();
        let cpus = format!("{:.2}", limits.cpu_quota);

        // -i -t keep /bin/sh alive so the container accepts execs until
        // destroyed. --network none is unconditional.
        let create = self
            .run(&[
                "create", "-i", "-t",
                "--network", "none",
                "--memory", &memory,
                "--pids-limit", &pids,
                "--cpus", &cpus,
                image,
                "/bin/sh",
            ])
            .await?;
        if !create.status.success() {
            return Err(SandboxError::Runtime(format!(
                "create: {}",
                stderr_text(&create)
            )));
        }
        let container_id = String::from_utf8_lossy(&create.stdout).trim().to_string();

        let start = self.run(&["start", &container_id]).await?;
        if !start.status.success() {
            // Do not leak the created container on a failed start.
            let _ = self.run(&["rm", "-f", &container_id]).await;
            return Err(SandboxError::Runtime(format!(
                "start {container_id}: {}",
                stderr_text(&start)
            )));
        }

        debug!(container_id = %container_id, "container started");
        Ok(container_id)
    }

    #[instrument(skip(self, env, cmd, stdin))]
    async fn exec(
        &self,
        container_id: &str,
        env: &[(String, String)],
        cmd: &[String],
        stdin: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let mut command = Command::new(&self.binary);
        let _ = command.args(["exec", "-i"]);
        for (key, value) in env {
            let _ = command.arg("-e").arg(format!("{key}={value}"));
        }
        let _ = command.arg(container_id).args(cmd);
        let _ = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("spawn exec: {e}")))?;

        // Deliver the script and close stdin to signal EOF.
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = match self.exec_timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    warn!(container_id, timeout_secs = timeout.as_secs(), "exec timed out");
                    SandboxError::ExecTimeout(timeout)
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
        })
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let rm = self.run(&["rm", "-f", container_id]).await?;
        if rm.status.success() {
            return Ok(());
        }
        let stderr = stderr_text(&rm);
        if stderr.contains("No such container") {
            debug!(container_id, "container already gone");
            return Ok(());
        }
        Err(SandboxError::Runtime(format!("rm {container_id}: {stderr}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let limits = ContainerLimits::default();
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.pids_limit, 50);
        assert!((limits.cpu_quota - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn docker_cli_defaults() {
        let cli = DockerCli::new();
        assert_eq!(cli.binary, "docker");
        assert!(cli.exec_timeout.is_none());

        let bounded = DockerCli::new().with_exec_timeout(Duration::from_secs(30));
        assert_eq!(bounded.exec_timeout, Some(Duration::from_secs(30)));
    }
}
