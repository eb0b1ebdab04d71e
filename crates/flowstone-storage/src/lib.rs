//! Persistent store and job queue for the flowstone engine.
//!
//! All cross-worker state lives here. The [`WorkflowStore`] trait exposes one
//! method per semantic step; every multi-row state change (node + outbox
//! creation, outbox completion + execution check, sleep transition + schedule
//! insert) happens inside a single backend transaction so the data model
//! invariants cannot be observed half-applied.
//!
//! Two implementations ship: [`PostgresStore`] for production and
//! [`MemoryStore`] with identical semantics for tests and embedded use.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use models::{
    JobRow, NodeExecutionRow, OutboxMessageRow, ReadyMessage, SleepScheduleRow,
    WorkflowExecutionRow, WorkflowRow, WorkflowVersionRow,
};
pub use postgres::PostgresStore;
pub use store::{
    retry_backoff, NewNodeExecution, NewWorkflow, OutboxEnqueue, OutboxFailureOutcome,
    RecoveryStats, StoreError, WorkflowStore,
};
