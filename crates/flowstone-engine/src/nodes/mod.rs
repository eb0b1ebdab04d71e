//! Built-in node executors.
//!
//! Side-effect types (http, email, slack) are adapters the embedding process
//! registers; only the engine-owned node types live here.

mod loop_source;
mod sleep;
mod transform;

pub use loop_source::LoopSourceExecutor;
pub use sleep::SleepExecutor;
pub use transform::TransformExecutor;

use async_trait::async_trait;

use crate::executor::{ExecutionContext, ExecutionResult, Executor, ExecutorError};

/// Returns its input unchanged. Backs the start/end markers.
pub struct PassthroughExecutor;

#[async_trait]
impl Executor for PassthroughExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult::ok(ctx.input))
    }
}

/// Junction node: passes its input through so the conditions on its
/// out-edges decide the path.
pub struct BranchExecutor;

#[async_trait]
impl Executor for BranchExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult::ok(ctx.input))
    }
}
