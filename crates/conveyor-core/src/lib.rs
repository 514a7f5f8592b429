//! Conveyor Core — Transport-agnostic workflow orchestration for the
//! Conveyor platform.
//!
//! This crate contains the workflow engine: definitions, runs, the
//! orchestrator driving step-by-step execution, and the trigger listeners.
//! It has **no HTTP framework dependency**, making it suitable for use in:
//!
//! - HTTP servers (mount the engine behind route handlers)
//! - Desktop apps (direct IPC)
//! - CLI tools
//!
//! Agent task dispatch and the tabular store are external systems; this
//! crate talks to them through the `StepExecutor` trait and the
//! `MutationFeed`, so tests can run against in-process fakes.

pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod state;
pub mod store;
pub mod triggers;

// Convenience re-exports
pub use db::Database;
pub use error::EngineError;
pub use state::{Engine, EngineInner};
