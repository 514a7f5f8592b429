//! Run Orchestrator — owns the lifecycle of every run.
//!
//! One instance supervises any number of concurrent runs; within a run,
//! steps are strictly sequential. Every transition is a conditional update
//! in the run store, so duplicate or racing signals (completion vs. cancel
//! vs. timeout) collapse to "first valid transition wins" and the rest are
//! no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use crate::engine::executor::{DispatchRequest, StepExecutor, TaskOutcome, TaskSignal};
use crate::engine::variables::VariableContext;
use crate::error::EngineError;
use crate::events::{EventBus, RunEvent, RunEventType};
use crate::models::run::{RunStatus, RunStep, RunStepStatus, RunWithSteps, WorkflowRun};
use crate::models::workflow::{StepGate, WorkflowStatus};
use crate::store::{RunStore, WorkflowStore};

/// What started a run, reduced to the variables it seeds.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub variables: VariableContext,
}

impl TriggerContext {
    /// A direct external call. Seeds nothing.
    pub fn manual() -> Self {
        Self::default()
    }

    /// A scheduler tick. Seeds `trigger.firedAt`.
    pub fn schedule(fired_at: DateTime<Utc>) -> Self {
        let mut variables = VariableContext::new();
        variables.insert("trigger.firedAt", fired_at.to_rfc3339());
        Self { variables }
    }

    /// A table mutation. Seeds one `row.<Field>` entry per field.
    pub fn row(fields: &HashMap<String, String>) -> Self {
        Self {
            variables: VariableContext::from_row(fields),
        }
    }
}

pub struct Orchestrator {
    workflow_store: WorkflowStore,
    run_store: RunStore,
    executor: Arc<dyn StepExecutor>,
    event_bus: EventBus,
}

impl Orchestrator {
    pub fn new(
        workflow_store: WorkflowStore,
        run_store: RunStore,
        executor: Arc<dyn StepExecutor>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            workflow_store,
            run_store,
            executor,
            event_bus,
        }
    }

    /// Create a run for a workflow: all RunSteps up front (`pending`), the
    /// variable context seeded from the trigger, then advance to the first
    /// step. Archived workflows and empty step lists are rejected before any
    /// run state exists.
    pub async fn start_run(
        &self,
        workflow_id: &str,
        trigger: TriggerContext,
    ) -> Result<RunWithSteps, EngineError> {
        let Some(workflow) = self.workflow_store.get_with_steps(workflow_id).await? else {
            return Err(EngineError::NotFound(format!(
                "Workflow {} not found",
                workflow_id
            )));
        };
        if workflow.workflow.status == WorkflowStatus::Archived {
            return Err(EngineError::Conflict(format!(
                "Workflow \"{}\" is archived",
                workflow.workflow.name
            )));
        }
        if workflow.steps.is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "Workflow \"{}\" has no steps",
                workflow.workflow.name
            )));
        }

        // Snapshot every definition onto the run: edits or deletions after
        // this point never change how this run executes.
        let run = WorkflowRun::new(workflow_id.to_string(), trigger.variables);
        let steps: Vec<RunStep> = workflow
            .steps
            .iter()
            .map(|s| RunStep::from_definition(run.id.clone(), s))
            .collect();
        self.run_store.create_run(&run, &steps).await?;

        tracing::info!(
            "[Orchestrator] Started run {} of workflow \"{}\" ({} steps)",
            run.id,
            workflow.workflow.name,
            steps.len()
        );
        self.emit(RunEventType::RunStarted, &run.id, workflow_id, None, None);

        self.advance(&run.id).await?;

        self.run_store
            .get_run_with_steps(&run.id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("Run {} vanished after creation", run.id)))
    }

    /// Dispatch the next pending step, or complete the run if none remains.
    ///
    /// Re-entrant and idempotent: every state change is a conditional update,
    /// so a concurrent cancel or duplicate call leaves at most one winner.
    pub async fn advance(&self, run_id: &str) -> Result<(), EngineError> {
        let Some(run) = self.run_store.get_run(run_id).await? else {
            tracing::warn!("[Orchestrator] advance for unknown run {}, ignoring", run_id);
            return Ok(());
        };
        if run.status != RunStatus::Running {
            return Ok(());
        }

        let Some(run_step) = self.run_store.next_pending_step(run_id).await? else {
            if self
                .run_store
                .transition_run(run_id, &[RunStatus::Running], RunStatus::Completed, None)
                .await?
            {
                tracing::info!("[Orchestrator] Run {} completed", run_id);
                self.emit(
                    RunEventType::RunCompleted,
                    run_id,
                    &run.workflow_id,
                    None,
                    None,
                );
            }
            return Ok(());
        };

        let instructions = {
            let mut parts: Vec<String> = Vec::new();
            if let Some(ref description) = run_step.description {
                parts.push(run.variables.render(description));
            }
            if let Some(ref extra) = run_step.config.instructions {
                parts.push(run.variables.render(extra));
            }
            parts.join("\n\n")
        };

        let request = DispatchRequest {
            run_id: run_id.to_string(),
            run_step_id: run_step.id.clone(),
            agent_id: run_step.agent_id.clone(),
            title: run_step.title.clone(),
            instructions,
            skills: run_step.config.skills.clone(),
        };

        match self.executor.begin(&request).await {
            Ok(handle) => {
                let deadline = run_step
                    .timeout_minutes
                    .map(|minutes| Utc::now() + Duration::minutes(minutes));
                if self
                    .run_store
                    .mark_step_running(&run_step.id, &handle.task_id, deadline)
                    .await?
                {
                    tracing::info!(
                        "[Orchestrator] Step \"{}\" dispatched as task {} (run {})",
                        run_step.title,
                        handle.task_id,
                        run_id
                    );
                    self.emit(
                        RunEventType::StepStarted,
                        run_id,
                        &run.workflow_id,
                        Some(&run_step.id),
                        None,
                    );
                }
                // Lost the race with a cancel: the task is orphaned and its
                // eventual signal will be a no-op.
            }
            Err(dispatch_error) => {
                tracing::warn!(
                    "[Orchestrator] Step \"{}\" failed to dispatch: {}",
                    run_step.title,
                    dispatch_error
                );
                if self
                    .run_store
                    .transition_step(
                        &run_step.id,
                        &[RunStepStatus::Pending],
                        RunStepStatus::Failed,
                        Some(dispatch_error.clone()),
                    )
                    .await?
                {
                    self.emit(
                        RunEventType::StepFailed,
                        run_id,
                        &run.workflow_id,
                        Some(&run_step.id),
                        Some(&dispatch_error),
                    );
                    self.fail_run(
                        run_id,
                        &run.workflow_id,
                        format!(
                            "Step \"{}\" failed to dispatch: {}",
                            run_step.title, dispatch_error
                        ),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Apply a task completion/failure signal.
    ///
    /// Duplicate delivery is expected: a signal for an already-terminal step
    /// loses the conditional transition and is discarded.
    pub async fn handle_task_signal(&self, signal: TaskSignal) -> Result<(), EngineError> {
        let Some(run_step) = self.run_store.find_step_by_task(&signal.task_id).await? else {
            tracing::warn!(
                "[Orchestrator] Signal for unknown task {}, ignoring",
                signal.task_id
            );
            return Ok(());
        };
        let Some(run) = self.run_store.get_run(&run_step.run_id).await? else {
            return Ok(());
        };

        match signal.outcome {
            TaskOutcome::Succeeded { output } => {
                // The gate comes from the run's own snapshot, never from a
                // live definition lookup.
                if run_step.gate == StepGate::Approval {
                    // The underlying task is done, but advancement is
                    // withheld until an explicit approval call. Output is
                    // stored in the same update so an approval racing in
                    // right after the transition always sees it.
                    if self
                        .run_store
                        .transition_step_with_output(
                            &run_step.id,
                            &[RunStepStatus::Running],
                            RunStepStatus::AwaitingApproval,
                            &output,
                        )
                        .await?
                    {
                        tracing::info!(
                            "[Orchestrator] Step \"{}\" awaiting approval (run {})",
                            run_step.title,
                            run_step.run_id
                        );
                        self.emit(
                            RunEventType::StepAwaitingApproval,
                            &run_step.run_id,
                            &run.workflow_id,
                            Some(&run_step.id),
                            None,
                        );
                    }
                } else if self
                    .run_store
                    .transition_step_with_output(
                        &run_step.id,
                        &[RunStepStatus::Running],
                        RunStepStatus::Completed,
                        &output,
                    )
                    .await?
                {
                    self.commit_output_variable(&run_step, &output).await?;
                    self.emit(
                        RunEventType::StepCompleted,
                        &run_step.run_id,
                        &run.workflow_id,
                        Some(&run_step.id),
                        None,
                    );
                    self.advance(&run_step.run_id).await?;
                }
            }
            TaskOutcome::Failed { error } => {
                if self
                    .run_store
                    .transition_step(
                        &run_step.id,
                        &[RunStepStatus::Running, RunStepStatus::AwaitingApproval],
                        RunStepStatus::Failed,
                        Some(error.clone()),
                    )
                    .await?
                {
                    self.emit(
                        RunEventType::StepFailed,
                        &run_step.run_id,
                        &run.workflow_id,
                        Some(&run_step.id),
                        Some(&error),
                    );
                    self.fail_run(
                        &run_step.run_id,
                        &run.workflow_id,
                        format!("Step \"{}\" failed: {}", run_step.title, error),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// External approval for a step parked `awaiting_approval`. Commits the
    /// held task output to the declared output variable and advances.
    pub async fn approve_step(&self, run_step_id: &str) -> Result<(), EngineError> {
        let Some(run_step) = self.run_store.get_step(run_step_id).await? else {
            return Err(EngineError::NotFound(format!(
                "Run step {} not found",
                run_step_id
            )));
        };
        if !self
            .run_store
            .transition_step(
                run_step_id,
                &[RunStepStatus::AwaitingApproval],
                RunStepStatus::Completed,
                None,
            )
            .await?
        {
            return Err(EngineError::Conflict(format!(
                "Run step \"{}\" is not awaiting approval",
                run_step.title
            )));
        }

        if let Some(ref output) = run_step.output {
            self.commit_output_variable(&run_step, output).await?;
        }
        let workflow_id = self
            .run_store
            .get_run(&run_step.run_id)
            .await?
            .map(|r| r.workflow_id)
            .unwrap_or_default();
        tracing::info!(
            "[Orchestrator] Step \"{}\" approved (run {})",
            run_step.title,
            run_step.run_id
        );
        self.emit(
            RunEventType::StepCompleted,
            &run_step.run_id,
            &workflow_id,
            Some(run_step_id),
            None,
        );
        self.advance(&run_step.run_id).await?;
        Ok(())
    }

    /// External cancellation. Terminal runs are rejected; a racing completion
    /// signal for the active step may still win that step's transition, in
    /// which case it stays terminal as completed/failed.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), EngineError> {
        let Some(run) = self.run_store.get_run(run_id).await? else {
            return Err(EngineError::NotFound(format!("Run {} not found", run_id)));
        };
        if !self
            .run_store
            .transition_run(run_id, &[RunStatus::Running], RunStatus::Canceled, None)
            .await?
        {
            return Err(EngineError::Conflict(format!(
                "Run {} is already {}",
                run_id,
                run.status.as_str()
            )));
        }

        for step in self.run_store.run_steps(run_id).await? {
            if matches!(
                step.status,
                RunStepStatus::Running | RunStepStatus::AwaitingApproval
            ) {
                self.run_store
                    .transition_step(
                        &step.id,
                        &[RunStepStatus::Running, RunStepStatus::AwaitingApproval],
                        RunStepStatus::Skipped,
                        None,
                    )
                    .await?;
            }
        }
        self.run_store.skip_pending_steps(run_id).await?;

        tracing::info!("[Orchestrator] Run {} canceled", run_id);
        self.emit(
            RunEventType::RunCanceled,
            run_id,
            &run.workflow_id,
            None,
            None,
        );
        Ok(())
    }

    /// Fail every `running` step whose deadline has passed, and its run.
    /// Steps awaiting approval carry no deadline and are never swept.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        for step in self.run_store.expired_steps(now).await? {
            let message = "Timed out waiting for task completion".to_string();
            if self
                .run_store
                .transition_step(
                    &step.id,
                    &[RunStepStatus::Running],
                    RunStepStatus::Failed,
                    Some(message.clone()),
                )
                .await?
            {
                tracing::warn!(
                    "[Orchestrator] Step \"{}\" timed out (run {})",
                    step.title,
                    step.run_id
                );
                let workflow_id = self
                    .run_store
                    .get_run(&step.run_id)
                    .await?
                    .map(|r| r.workflow_id)
                    .unwrap_or_default();
                self.emit(
                    RunEventType::StepFailed,
                    &step.run_id,
                    &workflow_id,
                    Some(&step.id),
                    Some(&message),
                );
                self.fail_run(
                    &step.run_id,
                    &workflow_id,
                    format!("Step \"{}\" timed out", step.title),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Drain task signals from the executor-side channel. Signals are
    /// serialized through this single consumer; conditional updates cover
    /// races with approvals and cancellations arriving on other tasks.
    pub fn spawn_signal_loop(
        self: &Arc<Self>,
        mut signals: mpsc::Receiver<TaskSignal>,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if let Err(e) = orchestrator.handle_task_signal(signal).await {
                    tracing::error!("[Orchestrator] Failed to apply task signal: {}", e);
                }
            }
            tracing::info!("[Orchestrator] Signal channel closed, loop exiting");
        })
    }

    /// Periodic timeout sweep. Restartable; a sweep failure is logged and
    /// isolated from run state.
    pub fn spawn_timeout_sweeper(
        self: &Arc<Self>,
        period: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.sweep_timeouts(Utc::now()).await {
                    tracing::error!("[Orchestrator] Timeout sweep failed: {}", e);
                }
            }
        })
    }

    async fn commit_output_variable(
        &self,
        run_step: &RunStep,
        output: &str,
    ) -> Result<(), EngineError> {
        let Some(ref name) = run_step.config.output_variable else {
            return Ok(());
        };
        let Some(mut run) = self.run_store.get_run(&run_step.run_id).await? else {
            return Ok(());
        };
        run.variables.insert(name.clone(), output);
        self.run_store
            .save_variables(&run_step.run_id, &run.variables)
            .await
    }

    async fn fail_run(
        &self,
        run_id: &str,
        workflow_id: &str,
        error: String,
    ) -> Result<(), EngineError> {
        if self
            .run_store
            .transition_run(run_id, &[RunStatus::Running], RunStatus::Failed, Some(error))
            .await?
        {
            self.run_store.skip_pending_steps(run_id).await?;
            tracing::warn!("[Orchestrator] Run {} failed", run_id);
            self.emit(RunEventType::RunFailed, run_id, workflow_id, None, None);
        }
        Ok(())
    }

    fn emit(
        &self,
        event_type: RunEventType,
        run_id: &str,
        workflow_id: &str,
        run_step_id: Option<&str>,
        error: Option<&str>,
    ) {
        self.event_bus.emit(RunEvent {
            event_type,
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_step_id: run_step_id.map(|s| s.to_string()),
            data: match error {
                Some(e) => serde_json::json!({ "error": e }),
                None => serde_json::Value::Null,
            },
            timestamp: Utc::now(),
        });
    }
}
