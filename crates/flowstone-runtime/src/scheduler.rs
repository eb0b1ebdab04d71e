//! Scheduler: cron-triggered executions and sleep wake-ups.
//!
//! One component, two timers. The cron registry keeps an in-memory map of
//! workflow schedules (reconciled against the database every few minutes to
//! pick up edits from other processes); the sleep poller scans the
//! `sleep_schedules` table and re-queues suspended executions whose wake
//! time has arrived.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowstone_core::TriggerType;
use flowstone_storage::{StoreError, WorkflowStore};

use crate::config::RuntimeConfig;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct CronEntry {
    cron_expr: String,
    timezone: String,
    schedule: Schedule,
    tz: Tz,
    next_fire: DateTime<Utc>,
}

/// Accepts 5-field (minute-first) and 6/7-field (seconds-first) forms; the
/// parser wants seconds, so 5-field expressions get a zero prepended.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// IANA timezone lookup, falling back to UTC on invalid names.
fn parse_timezone(name: &str) -> Tz {
    Tz::from_str(name).unwrap_or_else(|_| {
        warn!(timezone = name, "invalid timezone; falling back to UTC");
        Tz::UTC
    })
}

fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Cron registry plus sleep poller.
pub struct Scheduler {
    store: Arc<dyn WorkflowStore>,
    config: RuntimeConfig,
    entries: Mutex<HashMap<Uuid, CronEntry>>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        config: RuntimeConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            entries: Mutex::new(HashMap::new()),
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register (or replace) a workflow's cron schedule. Idempotent.
    pub fn add_schedule(
        &self,
        workflow_id: Uuid,
        cron_expr: &str,
        timezone: &str,
    ) -> Result<(), SchedulerError> {
        let normalized = normalize_cron(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        let tz = parse_timezone(timezone);
        let Some(fire_at) = next_fire(&schedule, tz, Utc::now()) else {
            return Err(SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: "schedule has no upcoming fire time".to_string(),
            });
        };

        debug!(%workflow_id, cron_expr, timezone, %fire_at, "registered cron schedule");
        self.entries.lock().insert(
            workflow_id,
            CronEntry {
                cron_expr: cron_expr.to_string(),
                timezone: timezone.to_string(),
                schedule,
                tz,
                next_fire: fire_at,
            },
        );
        Ok(())
    }

    /// Remove a workflow's schedule. Idempotent.
    pub fn remove_schedule(&self, workflow_id: Uuid) {
        if self.entries.lock().remove(&workflow_id).is_some() {
            debug!(%workflow_id, "removed cron schedule");
        }
    }

    /// Replace a workflow's schedule. Idempotent.
    pub fn update_schedule(
        &self,
        workflow_id: Uuid,
        cron_expr: &str,
        timezone: &str,
    ) -> Result<(), SchedulerError> {
        self.add_schedule(workflow_id, cron_expr, timezone)
    }

    pub fn schedule_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Load every workflow with a cron expression, active or not; the fire
    /// path re-checks activity so a deactivated workflow simply skips.
    pub async fn load_schedules(&self) -> Result<usize, SchedulerError> {
        let workflows = self.store.list_cron_workflows().await?;
        let mut loaded = 0;
        for workflow in workflows {
            let Some(expr) = workflow.cron_expr.as_deref() else {
                continue;
            };
            match self.add_schedule(workflow.id, expr, &workflow.timezone) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(workflow_id = %workflow.id, "skipping schedule: {e}"),
            }
        }
        info!(loaded, "cron schedules loaded");
        Ok(loaded)
    }

    /// Reconcile the in-memory registry against the database, picking up
    /// schedule edits made by other processes.
    pub async fn sync_schedules(&self) -> Result<(), SchedulerError> {
        let workflows = self.store.list_cron_workflows().await?;
        let in_db: HashMap<Uuid, _> = workflows.into_iter().map(|w| (w.id, w)).collect();

        let stale: Vec<Uuid> = {
            let entries = self.entries.lock();
            entries
                .keys()
                .filter(|id| !in_db.contains_key(id))
                .copied()
                .collect()
        };
        for id in stale {
            self.remove_schedule(id);
        }

        for (id, workflow) in in_db {
            let Some(expr) = workflow.cron_expr.as_deref() else {
                continue;
            };
            let changed = {
                let entries = self.entries.lock();
                entries.get(&id).map_or(true, |entry| {
                    entry.cron_expr != expr || entry.timezone != workflow.timezone
                })
            };
            if changed {
                if let Err(e) = self.add_schedule(id, expr, &workflow.timezone) {
                    warn!(workflow_id = %id, "skipping schedule: {e}");
                }
            }
        }
        Ok(())
    }

    /// Fire every cron entry whose time has come. Returns how many fired.
    pub async fn tick_cron(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Uuid> = {
            let mut entries = self.entries.lock();
            let mut due = Vec::new();
            for (id, entry) in entries.iter_mut() {
                if entry.next_fire <= now {
                    due.push(*id);
                    match next_fire(&entry.schedule, entry.tz, now) {
                        Some(next) => entry.next_fire = next,
                        None => entry.next_fire = DateTime::<Utc>::MAX_UTC,
                    }
                }
            }
            due
        };

        let mut fired = 0;
        for workflow_id in due {
            match self.fire(workflow_id).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => error!(%workflow_id, "cron fire failed: {e}"),
            }
        }
        fired
    }

    /// Trigger one scheduled execution, re-checking workflow activity.
    pub async fn fire(&self, workflow_id: Uuid) -> Result<bool, SchedulerError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.is_active {
            debug!(%workflow_id, "workflow inactive; skipping cron fire");
            return Ok(false);
        }
        let (execution, _job) = self
            .store
            .create_execution_with_job(workflow_id, None, TriggerType::Scheduled)
            .await?;
        info!(%workflow_id, execution_id = %execution.id, "cron fired");
        Ok(true)
    }

    /// One sleep-poller pass: wake every due suspended execution.
    pub async fn poll_sleep(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.due_sleep_schedules(now, 50).await {
            Ok(due) => due,
            Err(e) => {
                error!("sleep poll failed: {e}");
                return 0;
            }
        };

        let mut woken = 0;
        for schedule in due {
            match self.store.wake_execution(schedule.id).await {
                Ok(Some(job)) => {
                    info!(
                        execution_id = %schedule.execution_id,
                        job_id = %job.id,
                        "woke sleeping execution"
                    );
                    woken += 1;
                }
                Ok(None) => {
                    debug!(
                        execution_id = %schedule.execution_id,
                        "stale sleep schedule dropped"
                    );
                }
                Err(e) => error!(execution_id = %schedule.execution_id, "wake failed: {e}"),
            }
        }
        woken
    }

    /// Spawn the cron tick, sleep poll and registry sync loops.
    pub fn start(self: Arc<Self>) {
        let mut handles = self.handles.lock();

        let scheduler = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { scheduler.tick_cron(Utc::now()).await; }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("cron tick loop exited");
        }));

        let scheduler = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let sleep_interval = self.config.sleep_poll_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sleep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { scheduler.poll_sleep(Utc::now()).await; }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("sleep poll loop exited");
        }));

        let scheduler = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let sync_interval = self.config.cron_sync_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_interval);
            // The first tick is immediate and load_schedules already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.sync_schedules().await {
                            error!("schedule sync failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("schedule sync loop exited");
        }));

        info!("scheduler started");
    }

    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
