//! # crucible-llm
//!
//! One `chat` contract over heterogeneous model backends.
//!
//! Each backend family implements [`crucible_core::provider::ProviderStrategy`];
//! the [`ProviderRouter`] dispatches by the record's declared
//! [`crucible_core::provider::ProviderKind`] and wraps every chat connection
//! attempt in retry-with-full-jitter. Backends stream, and those that
//! fragment tool-call arguments buffer them per index until the turn
//! completes.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod retry;
pub mod router;
pub mod sse;

pub use retry::RetryConfig;
pub use router::ProviderRouter;
