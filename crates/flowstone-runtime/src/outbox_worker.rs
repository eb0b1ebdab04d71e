//! Outbox worker pool: dispatch ready messages to side-effect executors.
//!
//! Workers poll for ready messages, claim them with a compare-and-swap
//! transition, invoke the executor, and report the result back to the store,
//! which owns the retry/dead-letter state machine and the execution
//! completion/failure checks.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowstone_engine::{ExecutionContext, ExecutorRegistry};
use flowstone_storage::{OutboxFailureOutcome, ReadyMessage, WorkflowStore};

use crate::config::RuntimeConfig;

/// Fixed-size pool of outbox dispatch workers.
pub struct OutboxWorkerPool {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<ExecutorRegistry>,
    config: RuntimeConfig,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl OutboxWorkerPool {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<ExecutorRegistry>,
        config: RuntimeConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for index in 0..self.config.outbox_workers.max(1) {
            let worker_id = format!("outbox-worker-{index}");
            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let config = self.config.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "outbox worker started");
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    let processed =
                        drain_ready(&store, &registry, config.outbox_batch_size).await;
                    if processed == 0 {
                        tokio::select! {
                            _ = tokio::time::sleep(config.outbox_poll_interval) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                }
                debug!(worker_id, "outbox worker exited");
            }));
        }
        info!(workers = self.config.outbox_workers, "outbox worker pool started");
    }

    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One poll pass: fetch, claim and dispatch ready messages.
///
/// Returns the number of messages this call actually claimed. Public for the
/// pool's workers and for tests that drive the pipeline without timers.
pub async fn drain_ready(
    store: &Arc<dyn WorkflowStore>,
    registry: &Arc<ExecutorRegistry>,
    batch_size: usize,
) -> usize {
    let ready = match store.fetch_ready_messages(batch_size).await {
        Ok(ready) => ready,
        Err(e) => {
            error!("outbox fetch failed: {e}");
            return 0;
        }
    };

    let mut processed = 0;
    for entry in ready {
        // Another worker may have taken it between fetch and claim.
        match store.mark_message_processing(entry.message.id).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!(message_id = %entry.message.id, "claim failed: {e}");
                continue;
            }
        }
        processed += 1;
        dispatch_message(store, registry, entry).await;
    }
    processed
}

async fn dispatch_message(
    store: &Arc<dyn WorkflowStore>,
    registry: &Arc<ExecutorRegistry>,
    entry: ReadyMessage,
) {
    let message_id = entry.message.id;
    let node_type = entry.node_execution.node_type.clone();

    let Some(executor) = registry.get(&node_type) else {
        warn!(%message_id, node_type, "no executor registered");
        report_failure(store, message_id, &format!("no executor registered for {node_type}"))
            .await;
        return;
    };

    let payload = &entry.message.payload;
    let ctx = ExecutionContext {
        node_id: entry.node_execution.node_id.clone(),
        node_config: payload.get("node_config").cloned().unwrap_or(Value::Null),
        input: payload.get("input").cloned().unwrap_or(Value::Null),
        workflow_data: payload.get("workflow_data").cloned().unwrap_or(Value::Null),
        execution_id: payload_uuid(payload, "execution_id")
            .unwrap_or(entry.node_execution.execution_id),
        account_id: payload_uuid(payload, "account_id").unwrap_or_else(Uuid::nil),
        idempotency_key: Some(entry.message.idempotency_key.clone()),
    };

    match executor.execute(ctx).await {
        Ok(result) if result.success => {
            debug!(%message_id, node_type, "message dispatched");
            if let Err(e) = store.complete_message(message_id, result.output).await {
                error!(%message_id, "failed to complete message: {e}");
            }
        }
        Ok(result) => {
            let error = result
                .error
                .unwrap_or_else(|| "executor reported failure".to_string());
            report_failure(store, message_id, &error).await;
        }
        Err(e) => {
            report_failure(store, message_id, &e.to_string()).await;
        }
    }
}

async fn report_failure(store: &Arc<dyn WorkflowStore>, message_id: Uuid, error: &str) {
    match store.fail_message(message_id, error).await {
        Ok(OutboxFailureOutcome::WillRetry { attempt, next_retry_at }) => {
            warn!(%message_id, attempt, %next_retry_at, "message failed; will retry");
        }
        Ok(OutboxFailureOutcome::DeadLettered { execution_status }) => {
            warn!(%message_id, ?execution_status, "message dead-lettered");
        }
        Err(e) => {
            error!(%message_id, "failed to record message failure: {e}");
        }
    }
}

fn payload_uuid(payload: &Value, key: &str) -> Option<Uuid> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
