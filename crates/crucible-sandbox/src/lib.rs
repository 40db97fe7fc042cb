//! # crucible-sandbox
//!
//! Isolated, single-use execution contexts backed by an external
//! OCI-compatible container runtime, plus the pre-warmed pool that hands
//! them out.
//!
//! The security boundary for untrusted code is the container itself:
//! every context is created with no network access, a fixed memory
//! ceiling, and pid/cpu ceilings. Contexts are one-shot: after one
//! `execute` they must be destroyed, never reused.

pub mod context;
pub mod errors;
pub mod pool;
pub mod runtime;
pub mod testutil;

pub use context::{ContextStatus, ExecResult, ExecutionContext};
pub use errors::SandboxError;
pub use pool::{ContainerPool, PoolConfig};
pub use runtime::{ContainerLimits, ContainerRuntime, DockerCli, ExecOutput};
