//! Job-queue workers: dequeue execution jobs and drive the engine.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowstone_engine::WorkflowEngine;
use flowstone_storage::{JobRow, WorkflowStore};

use crate::config::RuntimeConfig;

/// Pool of workers dequeuing workflow-execution jobs.
pub struct JobWorkerPool {
    store: Arc<dyn WorkflowStore>,
    engine: Arc<WorkflowEngine>,
    config: RuntimeConfig,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorkerPool {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        engine: Arc<WorkflowEngine>,
        config: RuntimeConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops and the expired-claim reclaimer.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for index in 0..self.config.job_workers.max(1) {
            let worker_id = format!("job-worker-{index}");
            let store = Arc::clone(&self.store);
            let engine = Arc::clone(&self.engine);
            let config = self.config.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, store, engine, config, shutdown_rx).await;
            }));
        }
        handles.push(self.spawn_reclaim_loop());
        info!(workers = self.config.job_workers, "job worker pool started");
    }

    /// Wait for all workers to drain after the shutdown signal.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.job_reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.release_expired_jobs(chrono::Utc::now()).await {
                            Ok(0) => {}
                            Ok(released) => info!(released, "released expired job claims"),
                            Err(e) => error!("job reclamation failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("job reclaim loop exited");
        })
    }
}

async fn run_worker(
    worker_id: String,
    store: Arc<dyn WorkflowStore>,
    engine: Arc<WorkflowEngine>,
    config: RuntimeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "job worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let jobs = match store
            .dequeue_jobs(&worker_id, 1, config.job_visibility_timeout)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker_id, "dequeue failed: {e}");
                Vec::new()
            }
        };

        if jobs.is_empty() {
            // Idle wait, interruptible by shutdown.
            tokio::select! {
                _ = tokio::time::sleep(config.job_poll_interval) => {}
                _ = shutdown_rx.changed() => break,
            }
            continue;
        }

        for job in jobs {
            process_job(&worker_id, &store, &engine, &shutdown_rx, job).await;
        }
    }
    debug!(worker_id, "job worker exited");
}

async fn process_job(
    worker_id: &str,
    store: &Arc<dyn WorkflowStore>,
    engine: &Arc<WorkflowEngine>,
    shutdown_rx: &watch::Receiver<bool>,
    job: JobRow,
) {
    debug!(worker_id, job_id = %job.id, execution_id = %job.execution_id, "running job");

    let input = serde_json::from_str(&job.input_json).ok();

    // Fresh executions inherit the process shutdown signal; resumed ones run
    // on their remaining wall-clock budget even while the process drains.
    let cancel = if job.trigger_type.is_resume() {
        None
    } else {
        Some(shutdown_rx.clone())
    };

    let result = engine
        .execute(job.workflow_id, job.execution_id, input, job.trigger_type, cancel)
        .await;

    match result {
        Ok(status) => {
            debug!(job_id = %job.id, %status, "job finished");
            if let Err(e) = store.complete_job(job.id).await {
                error!(job_id = %job.id, "failed to complete job: {e}");
            }
        }
        Err(e) => {
            // System fault: leave the execution for recovery, fail the job.
            warn!(job_id = %job.id, "job failed: {e}");
            if let Err(e) = store.fail_job(job.id, &e.to_string()).await {
                error!(job_id = %job.id, "failed to record job failure: {e}");
            }
        }
    }
}
