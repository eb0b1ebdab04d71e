//! The executor contract consumed by the engine.
//!
//! Executors are pure with respect to engine state: they never touch the
//! node-execution tables. Side effects performed externally must be
//! idempotent given the `idempotency_key` the outbox supplies on retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// How the engine dispatches a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// start/end markers: no executor work, input passes through.
    Skippable,
    /// Executed inline by the engine worker.
    Synchronous,
    /// Executed at-least-once through the outbox (http, email, slack).
    AsyncSideEffect,
}

/// Everything an executor sees for one node attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub node_id: String,
    pub node_config: Value,
    pub input: Value,
    /// `{"nodeOutputs": {...}, "input": <initial input>}` for template use.
    pub workflow_data: Value,
    pub execution_id: Uuid,
    pub account_id: Uuid,
    /// Present for outbox-dispatched attempts; stable across retries.
    pub idempotency_key: Option<String>,
}

/// Result of one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    /// Sleep side-channel: the node succeeded and the execution should
    /// suspend until `wake_up_at`.
    pub needs_sleep: bool,
    pub wake_up_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            needs_sleep: false,
            wake_up_at: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            needs_sleep: false,
            wake_up_at: None,
        }
    }

    pub fn sleep(output: Value, wake_up_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            needs_sleep: true,
            wake_up_at: Some(wake_up_at),
        }
    }
}

/// Errors an executor can raise. Treated like `success = false` by the
/// engine, but kept separate so configuration faults read differently from
/// runtime failures in execution records.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid node config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Failed(String),
}

/// A node-type implementation.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError>;
}
