//! Core domain types for the flowstone workflow engine.
//!
//! This crate is I/O-free: it defines the workflow definition format and its
//! validation rules, the status vocabulary shared by every component, the
//! abuse-prevention limits, and the engine error taxonomy. Storage and
//! execution live in `flowstone-storage` and `flowstone-engine`.

pub mod definition;
pub mod error;
pub mod limits;
pub mod status;

pub use definition::{DefinitionError, EdgeDef, NodeDef, WorkflowDefinition};
pub use error::{EngineError, LimitKind};
pub use limits::ExecutionLimits;
pub use status::{
    ExecutionStatus, JobStatus, NodeExecutionStatus, OutboxStatus, TriggerType,
};
