//! Scripted container runtime for deterministic tests without Docker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::SandboxError;
use crate::runtime::{ContainerLimits, ContainerRuntime, ExecOutput};

/// One recorded `exec` invocation.
#[derive(Clone, Debug)]
pub struct ExecCall {
    pub container_id: String,
    pub env: Vec<(String, String)>,
    pub cmd: Vec<String>,
    pub stdin: String,
}

/// In-memory runtime that returns pre-programmed exec results in order.
/// An empty queue yields a successful exec with empty output.
pub struct FakeRuntime {
    exec_results: Mutex<VecDeque<Result<ExecOutput, SandboxError>>>,
    exec_calls: Mutex<Vec<ExecCall>>,
    created: AtomicUsize,
    removed: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_remove_reason: Mutex<Option<String>>,
    fail_image: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            exec_results: Mutex::new(VecDeque::new()),
            exec_calls: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_remove_reason: Mutex::new(None),
            fail_image: AtomicBool::new(false),
        }
    }

    /// Queue the result of the next exec.
    pub fn push_exec(&self, result: Result<ExecOutput, SandboxError>) {
        self.exec_results.lock().push_back(result);
    }

    /// Queue a successful exec whose stdout is the given string.
    pub fn push_stdout(&self, stdout: &str) {
        self.push_exec(Ok(ExecOutput {
            stdout: stdout.to_owned(),
            stderr: String::new(),
            exit_code: 0,
        }));
    }

    /// Queue an exec that exits non-zero with the given stderr.
    pub fn push_failure(&self, stderr: &str, exit_code: i64) {
        self.push_exec(Ok(ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_owned(),
            exit_code,
        }));
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_remove(&self, reason: &str) {
        *self.fail_remove_reason.lock() = Some(reason.to_owned());
    }

    pub fn fail_image(&self) {
        self.fail_image.store(true, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.exec_calls.lock().clone()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.fail_image.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::Runtime(format!("pull {image}: unreachable")));
        }
        Ok(())
    }

    async fn create_container(
        &self,
        _image: &str,
        _limits: &ContainerLimits,
    ) -> Result<String, SandboxError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::Runtime("create: daemon down".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ctr-{n}"))
    }

    async fn exec(
        &self,
        container_id: &str,
        env: &[(String, String)],
        cmd: &[String],
        stdin: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec_calls.lock().push(ExecCall {
            container_id: container_id.to_owned(),
            env: env.to_vec(),
            cmd: cmd.to_vec(),
            stdin: stdin.to_owned(),
        });
        match self.exec_results.lock().pop_front() {
            Some(result) => result,
            None => Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            }),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError> {
        if let Some(reason) = self.fail_remove_reason.lock().take() {
            return Err(SandboxError::Runtime(reason));
        }
        self.removed.lock().push(container_id.to_owned());
        Ok(())
    }
}
