//! The `WorkflowStore` trait.
//!
//! Backends must be thread-safe and keep the data-model invariants inside
//! each method: idempotency keys are only ever created together with their
//! node execution, completion checks run in the same transaction as the
//! message transition that caused them, and sleep transitions either fully
//! register the wake-up or roll back.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowstone_core::{ExecutionStatus, TriggerType};

use crate::models::*;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow version not found: {workflow_id} v{version}")]
    VersionNotFound { workflow_id: Uuid, version: i32 },

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    #[error("outbox message not found: {0}")]
    MessageNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Fields for a new workflow.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub account_id: Uuid,
    pub name: String,
    pub cron_expr: Option<String>,
    pub timezone: String,
    pub webhook_path: Option<String>,
    pub webhook_secret_hash: Option<String>,
    pub webhook_require_auth: bool,
}

/// Fields for a new node execution row.
#[derive(Debug, Clone)]
pub struct NewNodeExecution {
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub input: Option<serde_json::Value>,
    pub parent_loop_node_id: Option<String>,
}

/// Request to create a side-effectful node together with its outbox message.
#[derive(Debug, Clone)]
pub struct OutboxEnqueue {
    pub execution_id: Uuid,
    pub account_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub config: serde_json::Value,
    pub input: serde_json::Value,
    pub workflow_data: serde_json::Value,
    pub event_type: String,
    pub parent_loop_node_id: Option<String>,
}

/// What `fail_message` decided.
#[derive(Debug, Clone)]
pub enum OutboxFailureOutcome {
    /// The message went back to `pending` for another attempt.
    WillRetry {
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    },

    /// Retries exhausted; the message is dead-lettered. When the failure
    /// check reconciled the owning execution, the new status is carried.
    DeadLettered {
        execution_status: Option<ExecutionStatus>,
    },
}

/// Counts the recovery service reconciles a `running` execution from.
///
/// `success_nodes` counts meaningful work only: start/end marker rows are
/// excluded, matching the execution-failure check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub total_nodes: u64,
    pub failed_nodes: u64,
    pub success_nodes: u64,
    pub stuck_running_nodes: u64,
    pub open_messages: u64,
    pub end_node_succeeded: bool,
}

/// Retry delay after `attempts` delivery attempts: `2^(attempts-1)` minutes,
/// capped at one hour.
pub fn retry_backoff(attempts: i32) -> chrono::Duration {
    let exp = attempts.saturating_sub(1).clamp(0, 30) as u32;
    let minutes = 2i64.saturating_pow(exp).min(60);
    chrono::Duration::minutes(minutes)
}

/// Transactional store for workflows, executions, the job queue, the outbox
/// and sleep schedules.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflows and versions
    // =========================================================================

    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError>;

    /// Delete a workflow, cascading versions, executions, node executions,
    /// sleep schedules and jobs. Outbox messages are deliberately not
    /// cascaded; recovery dead-letters the orphans.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    /// Replace the cron trigger; `None` removes it.
    async fn update_cron(
        &self,
        id: Uuid,
        cron_expr: Option<String>,
        timezone: String,
    ) -> Result<(), StoreError>;

    /// Workflows with a non-empty cron expression, active or not. The fire
    /// callback re-checks `is_active`.
    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError>;

    /// Append a definition snapshot, bumping `current_version`.
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
        change_log: Option<String>,
    ) -> Result<WorkflowVersionRow, StoreError>;

    async fn latest_version(&self, workflow_id: Uuid) -> Result<WorkflowVersionRow, StoreError>;

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRow, StoreError>;

    // =========================================================================
    // Triggering and executions
    // =========================================================================

    /// Insert the execution row (status `queued`) and its job in one
    /// transaction.
    async fn create_execution_with_job(
        &self,
        workflow_id: Uuid,
        input: Option<serde_json::Value>,
        trigger: TriggerType,
    ) -> Result<(WorkflowExecutionRow, JobRow), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow, StoreError>;

    /// Transition to `running` for a fresh or resumed attempt. Clears
    /// `completed_at` so resumed `error` executions satisfy the
    /// completed-at-iff-terminal invariant again.
    async fn mark_execution_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Terminal transition. Returns `false` without touching the row when it
    /// is already terminal, which makes racing completion checks idempotent.
    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Transition to `interrupted` (resumable): `completed_at` stays NULL.
    async fn interrupt_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Record the execution output without changing status. Used when
    /// traversal finishes while outbox messages are still open.
    async fn set_execution_output(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Cancel a `running`/`queued` execution. Returns `false` when the
    /// current status does not allow cancellation.
    async fn cancel_execution(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError>;

    /// Successful top-level node executions forming the checkpoint set.
    /// Loop-body rows (tagged with `parent_loop_node_id`) are excluded:
    /// loops are never partially resumed.
    async fn successful_checkpoints(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError>;

    // =========================================================================
    // Node executions
    // =========================================================================

    async fn insert_node_execution(
        &self,
        new: NewNodeExecution,
    ) -> Result<NodeExecutionRow, StoreError>;

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Sleep
    // =========================================================================

    /// Within one transaction: mark the sleep node successful, transition the
    /// execution to `sleeping` and register the wake-up.
    async fn suspend_execution(
        &self,
        execution_id: Uuid,
        node_execution_id: Uuid,
        output: serde_json::Value,
        wake_up_at: DateTime<Utc>,
    ) -> Result<SleepScheduleRow, StoreError>;

    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRow>, StoreError>;

    /// Wake a sleeping execution: transition it to `running`, enqueue a
    /// `resume_from_sleep` job and delete the schedule, all in one
    /// transaction. Returns `None` (deleting the schedule) when the
    /// execution is no longer `sleeping`.
    async fn wake_execution(&self, schedule_id: Uuid) -> Result<Option<JobRow>, StoreError>;

    // =========================================================================
    // Job queue
    // =========================================================================

    /// Enqueue a job for an existing execution (resume paths).
    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        trigger: TriggerType,
    ) -> Result<JobRow, StoreError>;

    /// Claim up to `limit` jobs with a visibility timeout. Claimed jobs whose
    /// timeout elapses are released back to `pending` by
    /// [`release_expired_jobs`](WorkflowStore::release_expired_jobs).
    async fn dequeue_jobs(
        &self,
        worker_id: &str,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<JobRow>, StoreError>;

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Release claimed jobs whose visibility timeout elapsed. Returns how
    /// many were released.
    async fn release_expired_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Insert the node execution (status `pending`, idempotency key set) and
    /// its outbox message (status `pending`, immediately eligible) in one
    /// transaction.
    async fn create_node_with_outbox(
        &self,
        req: OutboxEnqueue,
    ) -> Result<(NodeExecutionRow, OutboxMessageRow), StoreError>;

    /// Ready messages: `pending` with `next_retry_at <= now`, oldest first,
    /// node execution eager-loaded.
    async fn fetch_ready_messages(&self, limit: usize) -> Result<Vec<ReadyMessage>, StoreError>;

    /// Claim a message for dispatch: `pending` → `processing`, incrementing
    /// `attempts`. Returns `false` when another worker already took it.
    async fn mark_message_processing(&self, message_id: Uuid) -> Result<bool, StoreError>;

    /// Terminal success: message `completed`, node execution `success`, then
    /// the execution-completion check, all in one transaction. Returns the
    /// execution status the check decided, if it transitioned anything.
    async fn complete_message(
        &self,
        message_id: Uuid,
        output: serde_json::Value,
    ) -> Result<Option<ExecutionStatus>, StoreError>;

    /// Failure: retry with exponential backoff, or dead-letter plus the
    /// execution-failure check once attempts are exhausted.
    async fn fail_message(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError>;

    /// Cancel all open messages (and their node executions) for an
    /// execution. Returns how many messages were cancelled.
    async fn cancel_pending_messages(&self, execution_id: Uuid) -> Result<u64, StoreError>;

    /// Requeue a dead-lettered message: attempts reset, immediately
    /// eligible.
    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError>;

    async fn count_open_messages(&self, execution_id: Uuid) -> Result<u64, StoreError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessageRow>, StoreError>;

    // =========================================================================
    // Recovery
    // =========================================================================

    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecutionRow>, StoreError>;

    async fn execution_recovery_stats(
        &self,
        execution_id: Uuid,
    ) -> Result<RecoveryStats, StoreError>;

    /// Mark node executions stuck in `running` as failed with `error`.
    /// Returns how many rows changed.
    async fn mark_stuck_nodes_failed(
        &self,
        execution_id: Uuid,
        error: &str,
    ) -> Result<u64, StoreError>;

    /// Non-terminal outbox messages whose node execution no longer exists.
    async fn orphaned_outbox_messages(&self) -> Result<Vec<OutboxMessageRow>, StoreError>;

    /// Dead-letter an orphaned message.
    async fn dead_letter_orphan(&self, message_id: Uuid, error: &str) -> Result<(), StoreError>;
}
