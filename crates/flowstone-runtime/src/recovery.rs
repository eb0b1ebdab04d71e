//! Startup recovery: reconcile state left behind by a crashed process.
//!
//! Runs once, before any worker begins dequeuing. Deterministic and
//! idempotent: running it twice produces the same row states as running it
//! once.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use flowstone_core::ExecutionStatus;
use flowstone_storage::{RecoveryStats, StoreError, WorkflowStore};

const CRASH_NODE_ERROR: &str =
    "Node execution interrupted by server crash/restart - workflow can be resumed";
const CRASH_EXECUTION_ERROR: &str =
    "Execution interrupted by server crash/restart - workflow can be resumed";
const MID_RUN_ERROR: &str =
    "Execution was interrupted mid-run and can be resumed";
const ORPHAN_ERROR: &str = "Node execution not found (orphaned message)";

/// What one recovery run changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Executions examined in pass A.
    pub examined: usize,
    /// Executions left alone because outbox messages are still open.
    pub left_running: usize,
    /// Executions marked interrupted (crash or mid-run).
    pub interrupted: usize,
    /// Executions finalized because their end node had completed.
    pub finalized: usize,
    /// Orphaned outbox messages dead-lettered in pass B.
    pub orphaned_messages: usize,
}

/// Startup reconciliation service.
pub struct RecoveryService {
    store: Arc<dyn WorkflowStore>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Run both passes.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        self.reconcile_stuck_executions(&mut report).await?;
        self.reconcile_orphaned_messages(&mut report).await?;
        info!(?report, "recovery complete");
        Ok(report)
    }

    /// Pass A: every execution still marked `running` is either legitimately
    /// owned by the outbox, crashed mid-node, actually finished, or was
    /// interrupted between nodes.
    async fn reconcile_stuck_executions(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        let running = self
            .store
            .executions_with_status(ExecutionStatus::Running)
            .await?;
        report.examined = running.len();

        for execution in running {
            let stats = self.store.execution_recovery_stats(execution.id).await?;

            if stats.open_messages > 0 {
                // Outbox workers will finish it (or the failure check will).
                report.left_running += 1;
                continue;
            }

            if stats.stuck_running_nodes > 0 {
                let marked = self
                    .store
                    .mark_stuck_nodes_failed(execution.id, CRASH_NODE_ERROR)
                    .await?;
                self.store
                    .interrupt_execution(execution.id, CRASH_EXECUTION_ERROR)
                    .await?;
                warn!(
                    execution_id = %execution.id,
                    stuck_nodes = marked,
                    "crashed execution marked interrupted"
                );
                report.interrupted += 1;
                continue;
            }

            if stats.end_node_succeeded {
                let (status, error) = final_status(&stats);
                self.store
                    .finish_execution(execution.id, status, None, error)
                    .await?;
                info!(execution_id = %execution.id, %status, "finalized completed execution");
                report.finalized += 1;
                continue;
            }

            self.store
                .interrupt_execution(execution.id, MID_RUN_ERROR)
                .await?;
            warn!(execution_id = %execution.id, "mid-run execution marked interrupted");
            report.interrupted += 1;
        }
        Ok(())
    }

    /// Pass B: dead-letter outbox messages whose node execution vanished.
    async fn reconcile_orphaned_messages(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        let orphans = self.store.orphaned_outbox_messages().await?;
        for message in orphans {
            self.store.dead_letter_orphan(message.id, ORPHAN_ERROR).await?;
            warn!(message_id = %message.id, "orphaned outbox message dead-lettered");
            report.orphaned_messages += 1;
        }
        Ok(())
    }
}

/// Final status per the execution-failure-check rules, given that the end
/// node completed.
fn final_status(stats: &RecoveryStats) -> (ExecutionStatus, Option<String>) {
    if stats.failed_nodes > 0 {
        let error = Some(format!(
            "{} out of {} nodes failed",
            stats.failed_nodes, stats.total_nodes
        ));
        if stats.success_nodes > 0 {
            (ExecutionStatus::PartiallyFailed, error)
        } else {
            (ExecutionStatus::Error, error)
        }
    } else {
        (ExecutionStatus::Success, None)
    }
}
