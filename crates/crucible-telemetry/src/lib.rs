//! # crucible-telemetry
//!
//! Logging initialization for the Crucible binaries. Every component logs
//! through `tracing` with structured fields; this crate owns the subscriber
//! setup so the binary configures it exactly once at startup.

pub mod logging;

pub use logging::init_logging;
