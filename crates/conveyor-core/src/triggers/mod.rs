//! Trigger Listener — decides which workflows should start a run right now.
//!
//! Three producers feed the orchestrator:
//! - `manual`: a direct `start_workflow_run` call, no listener logic
//! - `scheduled`: a minute-resolution ticker evaluating `ScheduleSpec`s
//! - `row_added` / `row_updated`: a table-mutation feed matched against each
//!   workflow's source table
//!
//! Producers are independent and may race to start runs; every resulting run
//! is its own entity, so no cross-producer coordination is needed.

pub mod mutations;
pub mod schedule;

pub use mutations::{MutationFeed, MutationListener, TableEvent, TableEventKind};
pub use schedule::{ScheduleSpec, Scheduler};
