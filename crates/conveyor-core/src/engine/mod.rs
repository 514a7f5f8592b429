//! Run engine — orchestrator state machine, step-dispatch boundary, and
//! variable interpolation.
//!
//! # Architecture
//!
//! ```text
//! trigger ──► Orchestrator::start_run ──► RunStore (run + all steps, pending)
//!                    │
//!                    ▼ advance: next pending step, interpolate, dispatch
//!              StepExecutor::begin ──► external task system (async)
//!                    │
//!        TaskSignal channel ◄── completion / failure callback
//!                    │
//!              Orchestrator::handle_task_signal ──► advance / gate / fail
//! ```
//!
//! Runs suspend as persisted state, not blocked tasks: a step sits `running`
//! or `awaiting_approval` in storage until the next signal (task completion,
//! timeout tick, approval call) drives a conditional transition.

pub mod executor;
pub mod orchestrator;
pub mod task_client;
pub mod variables;

pub use executor::{DispatchRequest, StepExecutor, TaskHandle, TaskOutcome, TaskSignal};
pub use orchestrator::{Orchestrator, TriggerContext};
pub use task_client::HttpTaskClient;
pub use variables::VariableContext;
