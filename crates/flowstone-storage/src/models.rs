//! Row models for the flowstone tables.
//!
//! These are plain data carriers; status columns are stored as text and
//! parsed through the `FromStr` impls in `flowstone-core`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowstone_core::{
    ExecutionStatus, JobStatus, NodeExecutionStatus, OutboxStatus, TriggerType,
};

/// A named, versioned workflow belonging to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub current_version: i32,
    pub is_active: bool,
    pub cron_expr: Option<String>,
    pub timezone: String,
    pub webhook_path: Option<String>,
    pub webhook_secret_hash: Option<String>,
    pub webhook_require_auth: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only definition snapshot; one row per `(workflow_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub definition: serde_json::Value,
    pub change_log: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One attempt to run a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One attempt to execute one node; loop bodies create one row per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub parent_loop_node_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable queue row coupling a side-effectful node execution to its retry
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessageRow {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub idempotency_key: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessageRow {
    /// Execution id carried in the payload, set at enqueue time.
    pub fn execution_id(&self) -> Option<Uuid> {
        self.payload
            .get("execution_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// A ready outbox message with its node execution eager-loaded.
#[derive(Debug, Clone)]
pub struct ReadyMessage {
    pub message: OutboxMessageRow,
    pub node_execution: NodeExecutionRow,
}

/// One-shot wake-up registration for a sleeping execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepScheduleRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub wake_up_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Work-queue entry dispatching an execution to an engine worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub input_json: String,
    pub trigger_type: TriggerType,
    pub status: JobStatus,
    pub attempts: i32,
    pub visible_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
