use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("context {context} is not READY (status: {status})")]
    InvalidState { context: String, status: String },

    #[error("execution timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
