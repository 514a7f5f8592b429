//! SQLite database layer for the Conveyor engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.
//!
//! RunStep status is the source of truth for run progression: advancement is
//! re-derived from these tables after a restart, so suspended runs (steps
//! waiting on an external task or a human approval) survive process death.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    trigger_kind    TEXT NOT NULL DEFAULT 'manual',
                    schedule_spec   TEXT,
                    source_table    TEXT,
                    status          TEXT NOT NULL DEFAULT 'active',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    position        INTEGER NOT NULL,
                    title           TEXT NOT NULL,
                    description     TEXT,
                    agent_id        TEXT,
                    gate            TEXT NOT NULL DEFAULT 'auto',
                    timeout_minutes INTEGER,
                    config          TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow
                    ON workflow_steps(workflow_id, position);

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    status          TEXT NOT NULL DEFAULT 'running',
                    error           TEXT,
                    variables       TEXT NOT NULL DEFAULT '{}',
                    started_at      INTEGER NOT NULL,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id);

                CREATE TABLE IF NOT EXISTS workflow_run_steps (
                    id              TEXT PRIMARY KEY,
                    run_id          TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    position        INTEGER NOT NULL,
                    title           TEXT NOT NULL,
                    description     TEXT,
                    agent_id        TEXT,
                    gate            TEXT NOT NULL DEFAULT 'auto',
                    timeout_minutes INTEGER,
                    config          TEXT NOT NULL DEFAULT '{}',
                    status          TEXT NOT NULL DEFAULT 'pending',
                    task_id         TEXT,
                    output          TEXT,
                    error           TEXT,
                    started_at      INTEGER,
                    deadline_at     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_run_steps_run
                    ON workflow_run_steps(run_id, position);
                CREATE INDEX IF NOT EXISTS idx_run_steps_task ON workflow_run_steps(task_id);
                CREATE INDEX IF NOT EXISTS idx_run_steps_deadline
                    ON workflow_run_steps(deadline_at) WHERE status = 'running';
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::run::{RunStatus, RunStepStatus};
    use crate::models::workflow::{CreateStepInput, CreateWorkflowInput, StepConfig, StepGate,
        TriggerKind};
    use crate::store::{RunStore, WorkflowStore};

    #[tokio::test]
    async fn test_suspended_run_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.db");
        let path_str = path.to_str().unwrap().to_string();

        let run_id;
        {
            let db = Database::open(&path_str).unwrap();
            let workflows = WorkflowStore::new(db.clone());
            let runs = RunStore::new(db);

            let w = workflows
                .create(CreateWorkflowInput {
                    name: "durable".to_string(),
                    description: String::new(),
                    trigger_kind: TriggerKind::Manual,
                    schedule_spec: None,
                    source_table: None,
                })
                .await
                .unwrap();
            let step = workflows
                .add_step(
                    &w.id,
                    CreateStepInput {
                        title: "Long task".to_string(),
                        description: None,
                        agent_id: Some("agent-1".to_string()),
                        gate: StepGate::Auto,
                        timeout_minutes: None,
                        config: StepConfig::default(),
                    },
                )
                .await
                .unwrap();

            let run =
                crate::models::run::WorkflowRun::new(w.id.clone(), Default::default());
            let run_steps = vec![crate::models::run::RunStep::from_definition(
                run.id.clone(),
                &step,
            )];
            runs.create_run(&run, &run_steps).await.unwrap();
            run_id = run.id.clone();

            let steps = runs.run_steps(&run_id).await.unwrap();
            assert!(runs
                .mark_step_running(&steps[0].id, "task-1", None)
                .await
                .unwrap());
        }

        // Reopen from the same file, as a restarted process would.
        let db = Database::open(&path_str).unwrap();
        let runs = RunStore::new(db);
        let run = runs.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let steps = runs.run_steps(&run_id).await.unwrap();
        assert_eq!(steps[0].status, RunStepStatus::Running);
        assert_eq!(steps[0].task_id.as_deref(), Some("task-1"));
    }
}
