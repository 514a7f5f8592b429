//! Time-based triggers: `daily:HH:MM` and `weekly:<day>:HH:MM` specs plus
//! the background ticker that fires them.
//!
//! The ticker is coarse-grained (minute resolution) and fires a workflow at
//! most once per matching minute. Ticks missed during downtime are skipped,
//! never backfilled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::engine::orchestrator::{Orchestrator, TriggerContext};
use crate::error::EngineError;
use crate::models::workflow::TriggerKind;
use crate::store::WorkflowStore;

/// Parsed schedule specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleSpec {
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl ScheduleSpec {
    /// Parse `daily:HH:MM` or `weekly:<day>:HH:MM` (day names like
    /// `monday`/`mon`, case-insensitive).
    pub fn parse(spec: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            ["daily", hour, minute] => {
                let (hour, minute) = parse_time(hour, minute)?;
                Ok(Self::Daily { hour, minute })
            }
            ["weekly", day, hour, minute] => {
                let weekday: Weekday = day
                    .parse()
                    .map_err(|_| format!("Invalid day of week \"{}\" in \"{}\"", day, spec))?;
                let (hour, minute) = parse_time(hour, minute)?;
                Ok(Self::Weekly {
                    weekday,
                    hour,
                    minute,
                })
            }
            _ => Err(format!(
                "Invalid schedule spec \"{}\" (expected daily:HH:MM or weekly:<day>:HH:MM)",
                spec
            )),
        }
    }

    /// Whether this spec matches the given instant's minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        match *self {
            Self::Daily { hour, minute } => at.hour() == hour && at.minute() == minute,
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => at.weekday() == weekday && at.hour() == hour && at.minute() == minute,
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Daily { hour, minute } => write!(f, "daily:{:02}:{:02}", hour, minute),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => write!(
                f,
                "weekly:{}:{:02}:{:02}",
                weekday_name(weekday),
                hour,
                minute
            ),
        }
    }
}

fn parse_time(hour: &str, minute: &str) -> Result<(u32, u32), String> {
    let hour: u32 = hour
        .parse()
        .map_err(|_| format!("Invalid hour \"{}\"", hour))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| format!("Invalid minute \"{}\"", minute))?;
    if hour > 23 {
        return Err(format!("Hour {} out of range", hour));
    }
    if minute > 59 {
        return Err(format!("Minute {} out of range", minute));
    }
    Ok((hour, minute))
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Background ticker for `scheduled` workflows.
///
/// Restartable and failure-isolated: a fault in one tick (or one workflow)
/// is logged and never corrupts already-started runs.
pub struct Scheduler {
    workflow_store: WorkflowStore,
    orchestrator: Arc<Orchestrator>,
    /// workflow id → minute bucket last fired, to enforce at-most-once per
    /// matching minute.
    fired: Mutex<HashMap<String, i64>>,
}

impl Scheduler {
    pub fn new(workflow_store: WorkflowStore, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            workflow_store,
            orchestrator,
            fired: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate all scheduled workflows against `now`. Returns how many runs
    /// were started.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let bucket = now.timestamp() / 60;
        {
            let mut fired = self
                .fired
                .lock()
                .map_err(|e| EngineError::Internal(format!("Scheduler lock poisoned: {}", e)))?;
            fired.retain(|_, b| *b == bucket);
        }

        let workflows = self
            .workflow_store
            .list_active_by_trigger(TriggerKind::Scheduled)
            .await?;

        let mut started = 0;
        for workflow in workflows {
            let Some(ref spec_str) = workflow.schedule_spec else {
                continue;
            };
            let spec = match ScheduleSpec::parse(spec_str) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(
                        "[Scheduler] Workflow \"{}\" has invalid schedule: {}",
                        workflow.name,
                        e
                    );
                    continue;
                }
            };
            if !spec.matches(now) {
                continue;
            }

            let already_fired = {
                let mut fired = self.fired.lock().map_err(|e| {
                    EngineError::Internal(format!("Scheduler lock poisoned: {}", e))
                })?;
                match fired.get(&workflow.id) {
                    Some(&b) if b == bucket => true,
                    _ => {
                        fired.insert(workflow.id.clone(), bucket);
                        false
                    }
                }
            };
            if already_fired {
                continue;
            }

            tracing::info!(
                "[Scheduler] Firing workflow \"{}\" ({})",
                workflow.name,
                spec
            );
            match self
                .orchestrator
                .start_run(&workflow.id, TriggerContext::schedule(now))
                .await
            {
                Ok(_) => started += 1,
                Err(e) => {
                    // Isolated: one workflow failing to start never stops
                    // the tick or touches other runs.
                    tracing::error!(
                        "[Scheduler] Failed to start workflow \"{}\": {}",
                        workflow.name,
                        e
                    );
                }
            }
        }
        Ok(started)
    }

    /// Spawn the ticker loop. Missed ticks are skipped, not queued.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    tracing::error!("[Scheduler] Tick failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::db::Database;
    use crate::engine::executor::{DispatchRequest, StepExecutor, TaskHandle};
    use crate::events::EventBus;
    use crate::models::workflow::{CreateStepInput, CreateWorkflowInput, StepConfig, StepGate};
    use crate::store::RunStore;

    #[test]
    fn test_parse_daily() {
        assert_eq!(
            ScheduleSpec::parse("daily:09:30").unwrap(),
            ScheduleSpec::Daily { hour: 9, minute: 30 }
        );
        assert!(ScheduleSpec::parse("daily:24:00").is_err());
        assert!(ScheduleSpec::parse("daily:09").is_err());
        assert!(ScheduleSpec::parse("hourly:09:30").is_err());
    }

    #[test]
    fn test_parse_weekly() {
        assert_eq!(
            ScheduleSpec::parse("weekly:monday:08:00").unwrap(),
            ScheduleSpec::Weekly {
                weekday: Weekday::Mon,
                hour: 8,
                minute: 0
            }
        );
        // Abbreviations and case-insensitivity come with the day parser.
        assert!(ScheduleSpec::parse("weekly:Fri:17:45").is_ok());
        assert!(ScheduleSpec::parse("weekly:someday:08:00").is_err());
        assert!(ScheduleSpec::parse("weekly:monday:08:61").is_err());
    }

    #[test]
    fn test_matches_minute() {
        // 2026-01-05 is a Monday.
        let monday_0930 = Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap();
        let daily = ScheduleSpec::parse("daily:09:30").unwrap();
        assert!(daily.matches(monday_0930));
        assert!(!daily.matches(monday_0930 + chrono::Duration::minutes(1)));

        let weekly = ScheduleSpec::parse("weekly:monday:09:30").unwrap();
        assert!(weekly.matches(monday_0930));
        assert!(!weekly.matches(monday_0930 + chrono::Duration::days(1)));
    }

    #[test]
    fn test_display_round_trip() {
        for spec in ["daily:09:05", "weekly:friday:17:45"] {
            assert_eq!(ScheduleSpec::parse(spec).unwrap().to_string(), spec);
        }
    }

    struct NullExecutor;

    #[async_trait::async_trait]
    impl StepExecutor for NullExecutor {
        async fn begin(&self, request: &DispatchRequest) -> Result<TaskHandle, String> {
            Ok(TaskHandle {
                task_id: format!("task-{}", request.run_step_id),
            })
        }
    }

    async fn scheduler_harness() -> (Scheduler, WorkflowStore, RunStore) {
        let db = Database::open_in_memory().unwrap();
        let workflow_store = WorkflowStore::new(db.clone());
        let run_store = RunStore::new(db);
        let orchestrator = Arc::new(Orchestrator::new(
            workflow_store.clone(),
            run_store.clone(),
            Arc::new(NullExecutor),
            EventBus::new(),
        ));
        (
            Scheduler::new(workflow_store.clone(), orchestrator),
            workflow_store,
            run_store,
        )
    }

    #[tokio::test]
    async fn test_tick_fires_at_most_once_per_minute() {
        let (scheduler, workflow_store, run_store) = scheduler_harness().await;
        let w = workflow_store
            .create(CreateWorkflowInput {
                name: "daily digest".to_string(),
                description: String::new(),
                trigger_kind: TriggerKind::Scheduled,
                schedule_spec: Some("daily:09:30".to_string()),
                source_table: None,
            })
            .await
            .unwrap();
        workflow_store
            .add_step(
                &w.id,
                CreateStepInput {
                    title: "Send digest".to_string(),
                    description: None,
                    agent_id: Some("agent-1".to_string()),
                    gate: StepGate::Auto,
                    timeout_minutes: None,
                    config: StepConfig::default(),
                },
            )
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap();
        assert_eq!(scheduler.tick(at).await.unwrap(), 1);
        // Same minute, second tick: no duplicate run.
        assert_eq!(scheduler.tick(at + chrono::Duration::seconds(30)).await.unwrap(), 0);
        // Non-matching minute: nothing fires.
        assert_eq!(scheduler.tick(at + chrono::Duration::minutes(5)).await.unwrap(), 0);
        // Next day's matching minute fires again.
        assert_eq!(scheduler.tick(at + chrono::Duration::days(1)).await.unwrap(), 1);

        assert_eq!(run_store.list_runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_skips_invalid_and_nonmatching_workflows() {
        let (scheduler, workflow_store, run_store) = scheduler_harness().await;
        // Valid spec, but its minute never matches this tick.
        workflow_store
            .create(CreateWorkflowInput {
                name: "other time".to_string(),
                description: String::new(),
                trigger_kind: TriggerKind::Scheduled,
                schedule_spec: Some("daily:23:00".to_string()),
                source_table: None,
            })
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap();
        assert_eq!(scheduler.tick(at).await.unwrap(), 0);
        assert!(run_store.list_runs().await.unwrap().is_empty());
    }
}
