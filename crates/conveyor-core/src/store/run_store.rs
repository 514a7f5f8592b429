//! Persistence for runs and run steps.
//!
//! All status changes go through conditional updates
//! (`UPDATE ... WHERE status IN (...)`) so that racing signals — completion
//! vs. cancellation vs. timeout — resolve to "first valid transition wins"
//! and later ones are no-ops. Correctness under concurrent delivery lives
//! here, not in in-memory locking.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::engine::variables::VariableContext;
use crate::error::EngineError;
use crate::models::run::{RunStatus, RunStep, RunStepStatus, RunWithSteps, WorkflowRun};
use crate::models::workflow::{StepConfig, StepGate};

const RUN_STEP_COLUMNS: &str = "id, run_id, step_id, position, title, description, agent_id, \
    gate, timeout_minutes, config, status, task_id, output, error, started_at, deadline_at";

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a run and its full step list in one transaction. The step
    /// list is immutable afterwards; only statuses mutate.
    pub async fn create_run(
        &self,
        run: &WorkflowRun,
        steps: &[RunStep],
    ) -> Result<(), EngineError> {
        let r = run.clone();
        let steps = steps.to_vec();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO workflow_runs (id, workflow_id, status, error, variables, \
                     started_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.status.as_str(),
                        r.error,
                        serde_json::to_string(&r.variables).unwrap_or_else(|_| "{}".to_string()),
                        r.started_at.timestamp_millis(),
                        r.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                for s in &steps {
                    tx.execute(
                        &format!(
                            "INSERT INTO workflow_run_steps ({}) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                             ?14, ?15, ?16)",
                            RUN_STEP_COLUMNS
                        ),
                        rusqlite::params![
                            s.id,
                            s.run_id,
                            s.step_id,
                            s.position,
                            s.title,
                            s.description,
                            s.agent_id,
                            s.gate.as_str(),
                            s.timeout_minutes,
                            serde_json::to_string(&s.config)
                                .unwrap_or_else(|_| "{}".to_string()),
                            s.status.as_str(),
                            s.task_id,
                            s.output,
                            s.error,
                            s.started_at.map(|t| t.timestamp_millis()),
                            s.deadline_at.map(|t| t.timestamp_millis()),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, workflow_id, status, error, variables, started_at, completed_at \
                     FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn get_run_with_steps(&self, id: &str) -> Result<Option<RunWithSteps>, EngineError> {
        let Some(run) = self.get_run(id).await? else {
            return Ok(None);
        };
        let steps = self.run_steps(id).await?;
        Ok(Some(RunWithSteps { run, steps }))
    }

    pub async fn list_runs(&self) -> Result<Vec<WorkflowRun>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, status, error, variables, started_at, completed_at \
                     FROM workflow_runs ORDER BY started_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn run_steps(&self, run_id: &str) -> Result<Vec<RunStep>, EngineError> {
        let rid = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_run_steps WHERE run_id = ?1 ORDER BY position",
                    RUN_STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![rid], |row| Ok(row_to_run_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn get_step(&self, run_step_id: &str) -> Result<Option<RunStep>, EngineError> {
        let id = run_step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM workflow_run_steps WHERE id = ?1",
                        RUN_STEP_COLUMNS
                    ),
                    rusqlite::params![id],
                    |row| Ok(row_to_run_step(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn find_step_by_task(&self, task_id: &str) -> Result<Option<RunStep>, EngineError> {
        let tid = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM workflow_run_steps WHERE task_id = ?1",
                        RUN_STEP_COLUMNS
                    ),
                    rusqlite::params![tid],
                    |row| Ok(row_to_run_step(row)),
                )
                .optional()
            })
            .await
    }

    /// The next step to dispatch: lowest position still `pending`.
    pub async fn next_pending_step(&self, run_id: &str) -> Result<Option<RunStep>, EngineError> {
        let rid = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM workflow_run_steps \
                         WHERE run_id = ?1 AND status = 'pending' ORDER BY position LIMIT 1",
                        RUN_STEP_COLUMNS
                    ),
                    rusqlite::params![rid],
                    |row| Ok(row_to_run_step(row)),
                )
                .optional()
            })
            .await
    }

    /// Conditional step transition: applied only if the current status is in
    /// `from`. Returns whether a row actually changed.
    pub async fn transition_step(
        &self,
        run_step_id: &str,
        from: &[RunStepStatus],
        to: RunStepStatus,
        error: Option<String>,
    ) -> Result<bool, EngineError> {
        let id = run_step_id.to_string();
        let guard = status_in_clause(from.iter().map(|s| s.as_str()));
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE workflow_run_steps SET status = ?1, error = COALESCE(?2, error) \
                         WHERE id = ?3 AND status IN ({})",
                        guard
                    ),
                    rusqlite::params![to.as_str(), error, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Conditional step transition that also stores the task output, in one
    /// statement: either the step moves and carries its output, or neither
    /// happens.
    pub async fn transition_step_with_output(
        &self,
        run_step_id: &str,
        from: &[RunStepStatus],
        to: RunStepStatus,
        output: &str,
    ) -> Result<bool, EngineError> {
        let id = run_step_id.to_string();
        let output = output.to_string();
        let guard = status_in_clause(from.iter().map(|s| s.as_str()));
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE workflow_run_steps SET status = ?1, output = ?2 \
                         WHERE id = ?3 AND status IN ({})",
                        guard
                    ),
                    rusqlite::params![to.as_str(), output, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// `pending → running` plus the dispatch bookkeeping (task id, start
    /// time, timeout deadline) in one conditional update.
    pub async fn mark_step_running(
        &self,
        run_step_id: &str,
        task_id: &str,
        deadline_at: Option<DateTime<Utc>>,
    ) -> Result<bool, EngineError> {
        let id = run_step_id.to_string();
        let tid = task_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_run_steps SET status = 'running', task_id = ?1, \
                     started_at = ?2, deadline_at = ?3 WHERE id = ?4 AND status = 'pending'",
                    rusqlite::params![tid, now, deadline_at.map(|t| t.timestamp_millis()), id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Bulk-transition every remaining `pending` step of a run to `skipped`.
    pub async fn skip_pending_steps(&self, run_id: &str) -> Result<usize, EngineError> {
        let rid = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_run_steps SET status = 'skipped' \
                     WHERE run_id = ?1 AND status = 'pending'",
                    rusqlite::params![rid],
                )?;
                Ok(n)
            })
            .await
    }

    /// Conditional run transition. Terminal targets also stamp `completed_at`.
    pub async fn transition_run(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> Result<bool, EngineError> {
        let id = run_id.to_string();
        let guard = status_in_clause(from.iter().map(|s| s.as_str()));
        let completed_at = to.is_terminal().then(|| Utc::now().timestamp_millis());
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE workflow_runs SET status = ?1, error = COALESCE(?2, error), \
                         completed_at = COALESCE(?3, completed_at) \
                         WHERE id = ?4 AND status IN ({})",
                        guard
                    ),
                    rusqlite::params![to.as_str(), error, completed_at, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn save_variables(
        &self,
        run_id: &str,
        variables: &VariableContext,
    ) -> Result<(), EngineError> {
        let id = run_id.to_string();
        let json = serde_json::to_string(variables)
            .map_err(|e| EngineError::Internal(format!("Failed to serialize variables: {}", e)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET variables = ?1 WHERE id = ?2",
                    rusqlite::params![json, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Steps still `running` whose timeout deadline has passed.
    pub async fn expired_steps(&self, now: DateTime<Utc>) -> Result<Vec<RunStep>, EngineError> {
        let now_ms = now.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_run_steps \
                     WHERE status = 'running' AND deadline_at IS NOT NULL AND deadline_at <= ?1",
                    RUN_STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms], |row| Ok(row_to_run_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Quoted `IN (...)` list built from static status strings.
fn status_in_clause<'a>(statuses: impl Iterator<Item = &'a str>) -> String {
    statuses
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_run(row: &rusqlite::Row<'_>) -> WorkflowRun {
    let variables_str: String = row.get(4).unwrap_or_default();
    let variables: VariableContext = serde_json::from_str(&variables_str).unwrap_or_default();
    let started_ms: i64 = row.get(5).unwrap_or(0);

    WorkflowRun {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        status: RunStatus::from_str(&row.get::<_, String>(2).unwrap_or_default()),
        error: row.get(3).unwrap_or(None),
        variables,
        started_at: chrono::DateTime::from_timestamp_millis(started_ms).unwrap_or_else(Utc::now),
        completed_at: row
            .get::<_, Option<i64>>(6)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
    }
}

fn row_to_run_step(row: &rusqlite::Row<'_>) -> RunStep {
    let config_str: String = row.get(9).unwrap_or_default();
    let config: StepConfig = serde_json::from_str(&config_str).unwrap_or_default();

    RunStep {
        id: row.get(0).unwrap_or_default(),
        run_id: row.get(1).unwrap_or_default(),
        step_id: row.get(2).unwrap_or_default(),
        position: row.get(3).unwrap_or(0),
        title: row.get(4).unwrap_or_default(),
        description: row.get(5).unwrap_or(None),
        agent_id: row.get(6).unwrap_or(None),
        gate: StepGate::from_str(&row.get::<_, String>(7).unwrap_or_default()),
        timeout_minutes: row.get(8).unwrap_or(None),
        config,
        status: RunStepStatus::from_str(&row.get::<_, String>(10).unwrap_or_default()),
        task_id: row.get(11).unwrap_or(None),
        output: row.get(12).unwrap_or(None),
        error: row.get(13).unwrap_or(None),
        started_at: row
            .get::<_, Option<i64>>(14)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
        deadline_at: row
            .get::<_, Option<i64>>(15)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
    }
}
