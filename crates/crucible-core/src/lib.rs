//! # crucible-core
//!
//! Foundation types for the Crucible experiment engine.
//!
//! This crate provides the shared vocabulary that all other Crucible crates
//! depend on:
//!
//! - **Branded IDs**: [`ids::ExperimentId`], [`ids::PlanId`], [`ids::ToolId`]
//!   and friends as newtypes
//! - **Environment**: [`environment::Environment`] typed key/value state with
//!   schema-driven validation
//! - **Plan / Experiment / Tool records**: the persisted data model
//! - **Chat messages**: [`messages::ChatMessage`] history types
//! - **Stream events**: [`stream::ChatEvent`] yielded by provider chats
//! - **Lifecycle events**: [`events::ExperimentEvent`] carried on the bus
//! - **Errors**: [`errors::ProviderError`] with retryable classification
//! - **Provider seam**: [`provider::ProviderStrategy`] implemented per backend
//! - **Secret store seam**: [`secrets::SecretStore`]
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other crucible crates.

#![deny(unsafe_code)]

pub mod environment;
pub mod errors;
pub mod events;
pub mod experiment;
pub mod ids;
pub mod messages;
pub mod plan;
pub mod provider;
pub mod secrets;
pub mod stream;
pub mod tool;
