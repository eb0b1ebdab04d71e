//! In-memory implementation of `WorkflowStore`.
//!
//! Used by tests and embedded setups. A single lock guards all tables so
//! every trait method is as atomic as its PostgreSQL counterpart's
//! transaction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use flowstone_core::{
    ExecutionStatus, JobStatus, NodeExecutionStatus, OutboxStatus, TriggerType,
};

use crate::models::*;
use crate::store::*;

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowRow>,
    versions: Vec<WorkflowVersionRow>,
    executions: HashMap<Uuid, WorkflowExecutionRow>,
    node_executions: HashMap<Uuid, NodeExecutionRow>,
    messages: HashMap<Uuid, OutboxMessageRow>,
    sleep_schedules: HashMap<Uuid, SleepScheduleRow>,
    jobs: HashMap<Uuid, JobRow>,
}

impl Inner {
    fn execution_of_message(&self, message: &OutboxMessageRow) -> Option<Uuid> {
        self.node_executions
            .get(&message.node_execution_id)
            .map(|n| n.execution_id)
    }

    fn open_message_count(&self, execution_id: Uuid) -> u64 {
        self.messages
            .values()
            .filter(|m| {
                m.status.is_open() && self.execution_of_message(m) == Some(execution_id)
            })
            .count() as u64
    }

    /// Execution-failure reconciliation once no open messages remain.
    fn reconcile_failed_execution(&mut self, execution_id: Uuid) -> Option<ExecutionStatus> {
        if self.open_message_count(execution_id) > 0 {
            return None;
        }
        let execution = self.executions.get(&execution_id)?;
        if execution.status.is_terminal() {
            return None;
        }

        let nodes: Vec<_> = self
            .node_executions
            .values()
            .filter(|n| n.execution_id == execution_id)
            .collect();
        let total = nodes.len();
        let failed = nodes
            .iter()
            .filter(|n| n.status == NodeExecutionStatus::Error)
            .count();
        let success = nodes
            .iter()
            .filter(|n| {
                n.status == NodeExecutionStatus::Success
                    && !flowstone_core::definition::is_marker_type(&n.node_type)
            })
            .count();

        let status = if failed > 0 && success > 0 {
            ExecutionStatus::PartiallyFailed
        } else if failed > 0 {
            ExecutionStatus::Error
        } else {
            return None;
        };

        let execution = self.executions.get_mut(&execution_id)?;
        execution.status = status;
        execution.error = Some(format!("{failed} out of {total} nodes failed"));
        execution.completed_at = Some(Utc::now());
        Some(status)
    }

    fn job_for_execution(
        &mut self,
        execution_id: Uuid,
        trigger: TriggerType,
    ) -> Result<JobRow, StoreError> {
        let execution = self
            .executions
            .get(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        let input_json = execution
            .input
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        let job = JobRow {
            id: Uuid::now_v7(),
            workflow_id: execution.workflow_id,
            execution_id,
            input_json,
            trigger_type: trigger,
            status: JobStatus::Pending,
            attempts: 0,
            visible_at: Utc::now(),
            claimed_by: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }
}

/// In-memory `WorkflowStore` with the same semantics as [`crate::PostgresStore`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Number of jobs currently pending (test helper).
    pub fn pending_job_count(&self) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    /// All outbox messages (test helper).
    pub fn all_messages(&self) -> Vec<OutboxMessageRow> {
        self.inner.read().messages.values().cloned().collect()
    }

    /// All sleep schedules (test helper).
    pub fn all_sleep_schedules(&self) -> Vec<SleepScheduleRow> {
        self.inner.read().sleep_schedules.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, StoreError> {
        let now = Utc::now();
        let row = WorkflowRow {
            id: Uuid::now_v7(),
            account_id: new.account_id,
            name: new.name,
            current_version: 0,
            is_active: true,
            cron_expr: new.cron_expr,
            timezone: new.timezone,
            webhook_path: new.webhook_path,
            webhook_secret_hash: new.webhook_secret_hash,
            webhook_require_auth: new.webhook_require_auth,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.workflows.remove(&id).is_none() {
            return Err(StoreError::WorkflowNotFound(id));
        }
        inner.versions.retain(|v| v.workflow_id != id);
        let executions: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| e.workflow_id == id)
            .map(|e| e.id)
            .collect();
        for execution_id in executions {
            inner.executions.remove(&execution_id);
            inner
                .node_executions
                .retain(|_, n| n.execution_id != execution_id);
            inner
                .sleep_schedules
                .retain(|_, s| s.execution_id != execution_id);
            inner.jobs.retain(|_, j| j.execution_id != execution_id);
        }
        Ok(())
    }

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.is_active = active;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn update_cron(
        &self,
        id: Uuid,
        cron_expr: Option<String>,
        timezone: String,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.cron_expr = cron_expr;
        workflow.timezone = timezone;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .workflows
            .values()
            .filter(|w| w.cron_expr.as_deref().is_some_and(|c| !c.is_empty()))
            .cloned()
            .collect())
    }

    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
        change_log: Option<String>,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.current_version += 1;
        workflow.updated_at = Utc::now();
        let row = WorkflowVersionRow {
            id: Uuid::now_v7(),
            workflow_id,
            version: workflow.current_version,
            definition,
            change_log,
            created_at: Utc::now(),
        };
        inner.versions.push(row.clone());
        Ok(row)
    }

    async fn latest_version(&self, workflow_id: Uuid) -> Result<WorkflowVersionRow, StoreError> {
        self.inner
            .read()
            .versions
            .iter()
            .filter(|v| v.workflow_id == workflow_id)
            .max_by_key(|v| v.version)
            .cloned()
            .ok_or(StoreError::VersionNotFound {
                workflow_id,
                version: 0,
            })
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRow, StoreError> {
        self.inner
            .read()
            .versions
            .iter()
            .find(|v| v.workflow_id == workflow_id && v.version == version)
            .cloned()
            .ok_or(StoreError::VersionNotFound {
                workflow_id,
                version,
            })
    }

    async fn create_execution_with_job(
        &self,
        workflow_id: Uuid,
        input: Option<serde_json::Value>,
        trigger: TriggerType,
    ) -> Result<(WorkflowExecutionRow, JobRow), StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let execution = WorkflowExecutionRow {
            id: Uuid::now_v7(),
            workflow_id,
            version: workflow.current_version,
            status: ExecutionStatus::Queued,
            trigger_type: trigger,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        inner.executions.insert(execution.id, execution.clone());
        let job = inner.job_for_execution(execution.id, trigger)?;
        Ok((execution, job))
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow, StoreError> {
        self.inner
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn mark_execution_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        // Error is re-openable via resume; the other terminal states are
        // final (a racing cancel must not be resurrected).
        if execution.status.is_terminal() && execution.status != ExecutionStatus::Error {
            return Err(StoreError::InvalidState(format!(
                "cannot run execution in status {}",
                execution.status
            )));
        }
        execution.status = ExecutionStatus::Running;
        execution.completed_at = None;
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = status;
        if output.is_some() {
            execution.output = output;
        }
        if error.is_some() {
            execution.error = error;
        }
        execution.completed_at = status.is_terminal().then(Utc::now);
        Ok(true)
    }

    async fn interrupt_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        execution.status = ExecutionStatus::Interrupted;
        execution.error = Some(error.to_string());
        execution.completed_at = None;
        Ok(())
    }

    async fn set_execution_output(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution.output = Some(output);
        Ok(())
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if !matches!(
            execution.status,
            ExecutionStatus::Running | ExecutionStatus::Queued
        ) {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .node_executions
            .values()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.started_at);
        Ok(rows)
    }

    async fn successful_checkpoints(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .node_executions
            .values()
            .filter(|n| {
                n.execution_id == execution_id
                    && n.status == NodeExecutionStatus::Success
                    && n.parent_loop_node_id.is_none()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.started_at);
        Ok(rows)
    }

    async fn insert_node_execution(
        &self,
        new: NewNodeExecution,
    ) -> Result<NodeExecutionRow, StoreError> {
        let row = NodeExecutionRow {
            id: Uuid::now_v7(),
            execution_id: new.execution_id,
            node_id: new.node_id,
            node_type: new.node_type,
            status: NodeExecutionStatus::Running,
            input: new.input,
            output: None,
            error: None,
            parent_loop_node_id: new.parent_loop_node_id,
            idempotency_key: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.inner
            .write()
            .node_executions
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let node = inner
            .node_executions
            .get_mut(&id)
            .ok_or(StoreError::NodeExecutionNotFound(id))?;
        node.status = NodeExecutionStatus::Success;
        node.output = Some(output);
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let node = inner
            .node_executions
            .get_mut(&id)
            .ok_or(StoreError::NodeExecutionNotFound(id))?;
        node.status = NodeExecutionStatus::Error;
        node.error = Some(error.to_string());
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn suspend_execution(
        &self,
        execution_id: Uuid,
        node_execution_id: Uuid,
        output: serde_json::Value,
        wake_up_at: DateTime<Utc>,
    ) -> Result<SleepScheduleRow, StoreError> {
        let mut inner = self.inner.write();

        let workflow_id = {
            let execution = inner
                .executions
                .get(&execution_id)
                .ok_or(StoreError::ExecutionNotFound(execution_id))?;
            if execution.status != ExecutionStatus::Running {
                return Err(StoreError::InvalidState(format!(
                    "cannot suspend execution in status {}",
                    execution.status
                )));
            }
            execution.workflow_id
        };

        let node_id = {
            let node = inner
                .node_executions
                .get_mut(&node_execution_id)
                .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
            node.status = NodeExecutionStatus::Success;
            node.output = Some(output);
            node.completed_at = Some(Utc::now());
            node.node_id.clone()
        };

        let execution = inner
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        execution.status = ExecutionStatus::Sleeping;

        let schedule = SleepScheduleRow {
            id: Uuid::now_v7(),
            execution_id,
            workflow_id,
            node_id,
            wake_up_at,
            created_at: Utc::now(),
        };
        inner.sleep_schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRow>, StoreError> {
        let mut due: Vec<_> = self
            .inner
            .read()
            .sleep_schedules
            .values()
            .filter(|s| s.wake_up_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.wake_up_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn wake_execution(&self, schedule_id: Uuid) -> Result<Option<JobRow>, StoreError> {
        let mut inner = self.inner.write();
        let Some(schedule) = inner.sleep_schedules.remove(&schedule_id) else {
            return Ok(None);
        };

        let sleeping = inner
            .executions
            .get(&schedule.execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Sleeping);
        if !sleeping {
            return Ok(None);
        }

        let execution = inner
            .executions
            .get_mut(&schedule.execution_id)
            .ok_or(StoreError::ExecutionNotFound(schedule.execution_id))?;
        execution.status = ExecutionStatus::Running;

        let job = inner.job_for_execution(schedule.execution_id, TriggerType::ResumeFromSleep)?;
        Ok(Some(job))
    }

    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        trigger: TriggerType,
    ) -> Result<JobRow, StoreError> {
        self.inner.write().job_for_execution(execution_id, trigger)
    }

    async fn dequeue_jobs(
        &self,
        worker_id: &str,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<JobRow>, StoreError> {
        let now = Utc::now();
        let invisible_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut inner = self.inner.write();
        let mut candidates: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.visible_at <= now)
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| inner.jobs[id].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Claimed;
                job.claimed_by = Some(worker_id.to_string());
                job.attempts += 1;
                job.visible_at = invisible_until;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.status = JobStatus::Completed;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn release_expired_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut released = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Claimed && job.visible_at <= now {
                job.status = JobStatus::Pending;
                job.claimed_by = None;
                job.visible_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn create_node_with_outbox(
        &self,
        req: OutboxEnqueue,
    ) -> Result<(NodeExecutionRow, OutboxMessageRow), StoreError> {
        let mut inner = self.inner.write();
        if !inner.executions.contains_key(&req.execution_id) {
            return Err(StoreError::ExecutionNotFound(req.execution_id));
        }

        let idempotency_key =
            format!("{}-{}-{}", req.execution_id, req.node_id, Uuid::now_v7());
        let max_retries = req
            .config
            .get("maxRetries")
            .and_then(|v| v.as_i64())
            .unwrap_or(3)
            .clamp(0, 10) as i32;

        let node = NodeExecutionRow {
            id: Uuid::now_v7(),
            execution_id: req.execution_id,
            node_id: req.node_id.clone(),
            node_type: req.node_type.clone(),
            status: NodeExecutionStatus::Pending,
            input: Some(req.input.clone()),
            output: None,
            error: None,
            parent_loop_node_id: req.parent_loop_node_id,
            idempotency_key: Some(idempotency_key.clone()),
            started_at: Utc::now(),
            completed_at: None,
        };

        let payload = serde_json::json!({
            "node_id": req.node_id,
            "node_config": req.config,
            "input": req.input,
            "workflow_data": req.workflow_data,
            "execution_id": req.execution_id,
            "account_id": req.account_id,
        });

        let message = OutboxMessageRow {
            id: Uuid::now_v7(),
            node_execution_id: node.id,
            event_type: req.event_type,
            payload,
            status: OutboxStatus::Pending,
            idempotency_key,
            attempts: 0,
            max_attempts: max_retries + 1,
            next_retry_at: Some(Utc::now()),
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        };

        inner.node_executions.insert(node.id, node.clone());
        inner.messages.insert(message.id, message.clone());
        Ok((node, message))
    }

    async fn fetch_ready_messages(&self, limit: usize) -> Result<Vec<ReadyMessage>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut ready: Vec<_> = inner
            .messages
            .values()
            .filter(|m| {
                m.status == OutboxStatus::Pending
                    && m.next_retry_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        ready.sort_by_key(|m| m.created_at);
        ready.truncate(limit);

        let mut out = Vec::with_capacity(ready.len());
        for message in ready {
            // Orphans are skipped here; recovery dead-letters them.
            let Some(node_execution) = inner
                .node_executions
                .get(&message.node_execution_id)
                .cloned()
            else {
                continue;
            };
            out.push(ReadyMessage {
                message,
                node_execution,
            });
        }
        Ok(out)
    }

    async fn mark_message_processing(&self, message_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if message.status != OutboxStatus::Pending {
            return Ok(false);
        }
        message.status = OutboxStatus::Processing;
        message.attempts += 1;
        message.last_attempt_at = Some(Utc::now());
        Ok(true)
    }

    async fn complete_message(
        &self,
        message_id: Uuid,
        output: serde_json::Value,
    ) -> Result<Option<ExecutionStatus>, StoreError> {
        let mut inner = self.inner.write();

        let (node_execution_id, execution_id) = {
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            if message.status != OutboxStatus::Processing {
                return Ok(None);
            }
            message.status = OutboxStatus::Completed;
            message.processed_at = Some(Utc::now());
            message.next_retry_at = None;
            let node_execution_id = message.node_execution_id;
            let execution_id = inner
                .node_executions
                .get(&node_execution_id)
                .map(|n| n.execution_id)
                .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
            (node_execution_id, execution_id)
        };

        {
            let node = inner
                .node_executions
                .get_mut(&node_execution_id)
                .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
            node.status = NodeExecutionStatus::Success;
            node.output = Some(output);
            node.completed_at = Some(Utc::now());
        }

        // Execution-completion check: last open message finishing a still
        // running execution completes it.
        if inner.open_message_count(execution_id) == 0 {
            let execution = inner
                .executions
                .get_mut(&execution_id)
                .ok_or(StoreError::ExecutionNotFound(execution_id))?;
            if execution.status == ExecutionStatus::Running {
                execution.status = ExecutionStatus::Success;
                execution.completed_at = Some(Utc::now());
                return Ok(Some(ExecutionStatus::Success));
            }
        }
        Ok(None)
    }

    async fn fail_message(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError> {
        let mut inner = self.inner.write();

        let (attempts, max_attempts, node_execution_id) = {
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            if message.status != OutboxStatus::Processing {
                return Err(StoreError::InvalidState(format!(
                    "cannot fail message in status {}",
                    message.status
                )));
            }
            (message.attempts, message.max_attempts, message.node_execution_id)
        };

        if attempts < max_attempts {
            let next_retry_at = Utc::now() + retry_backoff(attempts);
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            message.status = OutboxStatus::Pending;
            message.next_retry_at = Some(next_retry_at);
            message.last_error = Some(error.to_string());
            return Ok(OutboxFailureOutcome::WillRetry {
                attempt: attempts,
                next_retry_at,
            });
        }

        {
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            message.status = OutboxStatus::DeadLetter;
            message.next_retry_at = None;
            message.last_error = Some(error.to_string());
        }

        let execution_id = {
            let node = inner
                .node_executions
                .get_mut(&node_execution_id)
                .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
            node.status = NodeExecutionStatus::Error;
            node.error = Some(format!("Failed after {attempts} attempts: {error}"));
            node.completed_at = Some(Utc::now());
            node.execution_id
        };

        let execution_status = inner.reconcile_failed_execution(execution_id);
        Ok(OutboxFailureOutcome::DeadLettered { execution_status })
    }

    async fn cancel_pending_messages(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let open_ids: Vec<(Uuid, Uuid)> = inner
            .messages
            .values()
            .filter(|m| {
                m.status.is_open() && inner.execution_of_message(m) == Some(execution_id)
            })
            .map(|m| (m.id, m.node_execution_id))
            .collect();

        for (message_id, node_execution_id) in &open_ids {
            if let Some(message) = inner.messages.get_mut(message_id) {
                message.status = OutboxStatus::Cancelled;
                message.next_retry_at = None;
            }
            if let Some(node) = inner.node_executions.get_mut(node_execution_id) {
                node.status = NodeExecutionStatus::Cancelled;
                node.completed_at = Some(Utc::now());
            }
        }
        Ok(open_ids.len() as u64)
    }

    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if message.status != OutboxStatus::DeadLetter {
            return Err(StoreError::InvalidState(format!(
                "cannot retry message in status {}",
                message.status
            )));
        }
        message.status = OutboxStatus::Pending;
        message.attempts = 0;
        message.next_retry_at = Some(Utc::now());
        message.last_error = None;
        message.last_attempt_at = None;
        Ok(())
    }

    async fn count_open_messages(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.inner.read().open_message_count(execution_id))
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessageRow>, StoreError> {
        let mut dead: Vec<_> = self
            .inner
            .read()
            .messages
            .values()
            .filter(|m| m.status == OutboxStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by_key(|m| m.created_at);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecutionRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.started_at);
        Ok(rows)
    }

    async fn execution_recovery_stats(
        &self,
        execution_id: Uuid,
    ) -> Result<RecoveryStats, StoreError> {
        let inner = self.inner.read();
        let mut stats = RecoveryStats::default();
        for node in inner
            .node_executions
            .values()
            .filter(|n| n.execution_id == execution_id)
        {
            stats.total_nodes += 1;
            match node.status {
                NodeExecutionStatus::Error => stats.failed_nodes += 1,
                NodeExecutionStatus::Success => {
                    if node.node_type == flowstone_core::definition::END_NODE_TYPE {
                        stats.end_node_succeeded = true;
                    }
                    if !flowstone_core::definition::is_marker_type(&node.node_type) {
                        stats.success_nodes += 1;
                    }
                }
                NodeExecutionStatus::Running => stats.stuck_running_nodes += 1,
                NodeExecutionStatus::Pending | NodeExecutionStatus::Cancelled => {}
            }
        }
        stats.open_messages = inner.open_message_count(execution_id);
        Ok(stats)
    }

    async fn mark_stuck_nodes_failed(
        &self,
        execution_id: Uuid,
        error: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for node in inner
            .node_executions
            .values_mut()
            .filter(|n| n.execution_id == execution_id)
        {
            if node.status == NodeExecutionStatus::Running {
                node.status = NodeExecutionStatus::Error;
                node.error = Some(error.to_string());
                node.completed_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn orphaned_outbox_messages(&self) -> Result<Vec<OutboxMessageRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .messages
            .values()
            .filter(|m| {
                !matches!(
                    m.status,
                    OutboxStatus::Completed | OutboxStatus::DeadLetter
                ) && !inner.node_executions.contains_key(&m.node_execution_id)
            })
            .cloned()
            .collect())
    }

    async fn dead_letter_orphan(&self, message_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        message.status = OutboxStatus::DeadLetter;
        message.next_retry_at = None;
        message.last_error = Some(error.to_string());
        Ok(())
    }
}
