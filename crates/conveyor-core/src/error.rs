//! Core error type for the Conveyor engine.
//!
//! `EngineError` is used throughout the core domain (stores, orchestrator,
//! triggers). Rejected operations (approving a step that is not awaiting
//! approval, canceling a finished run) surface as `Conflict`; malformed
//! workflow definitions are caught at save/start time as `InvalidDefinition`
//! and never reach run state.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
