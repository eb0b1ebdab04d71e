//! Process runtime for the flowstone engine.
//!
//! Wires the store, executor registry, engine, worker pools, scheduler and
//! recovery into one process, and exposes the core-boundary operations
//! (trigger, resume, cancel, dead-letter requeue) to the embedding
//! application.

pub mod config;
pub mod job_worker;
pub mod outbox_worker;
pub mod recovery;
pub mod scheduler;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use flowstone_core::TriggerType;
use flowstone_engine::{EngineConfig, ExecutorRegistry, WorkflowEngine};
use flowstone_storage::{
    JobRow, OutboxMessageRow, StoreError, WorkflowExecutionRow, WorkflowStore,
};

pub use config::RuntimeConfig;
pub use job_worker::JobWorkerPool;
pub use outbox_worker::OutboxWorkerPool;
pub use recovery::{RecoveryReport, RecoveryService};
pub use scheduler::{Scheduler, SchedulerError};

/// Errors surfaced at the runtime boundary.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// One engine process: worker pools, scheduler, recovery and the
/// core-boundary API.
pub struct Runtime {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<ExecutorRegistry>,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<Scheduler>,
    job_pool: JobWorkerPool,
    outbox_pool: OutboxWorkerPool,
    shutdown_tx: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<ExecutorRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(WorkflowEngine::with_config(
            Arc::clone(&store),
            Arc::clone(&registry),
            EngineConfig::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            config.clone(),
            shutdown_rx.clone(),
        ));
        let job_pool = JobWorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            config.clone(),
            shutdown_rx.clone(),
        );
        let outbox_pool = OutboxWorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config,
            shutdown_rx,
        );

        Self {
            store,
            registry,
            engine,
            scheduler,
            job_pool,
            outbox_pool,
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Recover leftover state, load cron schedules, then start every pool.
    /// Recovery runs strictly before workers begin dequeuing.
    pub async fn start(&self) -> Result<RecoveryReport, RuntimeError> {
        let report = RecoveryService::new(Arc::clone(&self.store)).run().await?;
        self.scheduler.load_schedules().await?;
        Arc::clone(&self.scheduler).start();
        self.outbox_pool.start();
        self.job_pool.start();
        info!("runtime started");
        Ok(report)
    }

    /// Signal shutdown and wait for in-flight work to drain.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        self.job_pool.join().await;
        self.outbox_pool.join().await;
        self.scheduler.join().await;
        info!("runtime stopped");
    }

    // =========================================================================
    // Core-boundary operations
    // =========================================================================

    /// Trigger a new execution of a workflow.
    pub async fn trigger(
        &self,
        workflow_id: Uuid,
        input: Option<serde_json::Value>,
        trigger: TriggerType,
    ) -> Result<WorkflowExecutionRow, RuntimeError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.is_active {
            return Err(RuntimeError::InvalidState(format!(
                "workflow {workflow_id} is not active"
            )));
        }
        let (execution, _job) = self
            .store
            .create_execution_with_job(workflow_id, input, trigger)
            .await?;
        Ok(execution)
    }

    /// Re-queue an `error`, `running` or `interrupted` execution. No state
    /// changes happen until a worker picks the job up.
    pub async fn resume(&self, execution_id: Uuid) -> Result<JobRow, RuntimeError> {
        let execution = self.store.get_execution(execution_id).await?;
        if !execution.status.is_resumable() {
            return Err(RuntimeError::InvalidState(format!(
                "execution {execution_id} is {} and cannot be resumed",
                execution.status
            )));
        }
        let job = self.store.enqueue_job(execution_id, TriggerType::Resume).await?;
        info!(%execution_id, job_id = %job.id, "resume queued");
        Ok(job)
    }

    /// Cancel a `running`/`queued` execution and its open outbox messages.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, RuntimeError> {
        let cancelled = self.store.cancel_execution(execution_id).await?;
        if cancelled {
            let messages = self.store.cancel_pending_messages(execution_id).await?;
            info!(%execution_id, cancelled_messages = messages, "execution cancelled");
        }
        Ok(cancelled)
    }

    /// Requeue a dead-lettered outbox message.
    pub async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), RuntimeError> {
        self.store.retry_dead_letter(message_id).await?;
        Ok(())
    }

    /// Inspect the dead-letter queue.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessageRow>, RuntimeError> {
        Ok(self.store.list_dead_letters(limit).await?)
    }
}
