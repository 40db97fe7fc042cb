//! # crucible-store
//!
//! SQLite persistence for plans, experiments, tools, providers, and
//! secrets. The persisted experiment record is the single source of truth
//! for experiment status: the orchestrator re-reads it every loop
//! iteration, and control commands take effect by writing it here.

pub mod database;
pub mod error;
pub mod experiments;
pub mod plans;
pub mod providers;
pub mod schema;
pub mod secrets;
pub mod tools;

pub use database::Database;
pub use error::StoreError;
