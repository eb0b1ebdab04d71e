//! Store semantics tests, run against the in-memory backend.
//!
//! The memory and PostgreSQL backends implement the same contract; these
//! tests pin down the transactional semantics every backend must provide.

use serde_json::json;
use std::time::Duration;

use flowstone_core::{ExecutionStatus, NodeExecutionStatus, OutboxStatus, TriggerType};
use flowstone_storage::{
    MemoryStore, NewNodeExecution, NewWorkflow, OutboxEnqueue, OutboxFailureOutcome,
    WorkflowStore,
};

fn new_workflow() -> NewWorkflow {
    NewWorkflow {
        account_id: uuid::Uuid::now_v7(),
        name: "test".into(),
        cron_expr: None,
        timezone: "UTC".into(),
        webhook_path: None,
        webhook_secret_hash: None,
        webhook_require_auth: false,
    }
}

async fn running_execution(store: &MemoryStore) -> uuid::Uuid {
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    let (execution, _job) = store
        .create_execution_with_job(workflow.id, Some(json!({"n": 1})), TriggerType::Manual)
        .await
        .unwrap();
    store.mark_execution_running(execution.id).await.unwrap();
    execution.id
}

fn outbox_enqueue(execution_id: uuid::Uuid, node_id: &str, max_retries: i64) -> OutboxEnqueue {
    OutboxEnqueue {
        execution_id,
        account_id: uuid::Uuid::now_v7(),
        node_id: node_id.into(),
        node_type: "email".into(),
        config: json!({"maxRetries": max_retries}),
        input: json!({"to": "ops@example.com"}),
        workflow_data: json!({"nodeOutputs": {}, "input": {"n": 1}}),
        event_type: "email".into(),
        parent_loop_node_id: None,
    }
}

#[tokio::test]
async fn version_numbers_are_monotonic() {
    let store = MemoryStore::new();
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    assert_eq!(workflow.current_version, 0);

    let v1 = store
        .create_version(workflow.id, json!({"nodes": [], "edges": []}), None)
        .await
        .unwrap();
    let v2 = store
        .create_version(workflow.id, json!({"nodes": [], "edges": []}), Some("edit".into()))
        .await
        .unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);

    let latest = store.latest_version(workflow.id).await.unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(store.get_workflow(workflow.id).await.unwrap().current_version, 2);

    // Earlier versions stay addressable.
    let first = store.get_version(workflow.id, 1).await.unwrap();
    assert_eq!(first.id, v1.id);
    assert!(first.change_log.is_none());
}

#[tokio::test]
async fn deleting_a_workflow_cascades_its_children() {
    let store = MemoryStore::new();
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    let (execution, _) = store
        .create_execution_with_job(workflow.id, None, TriggerType::Manual)
        .await
        .unwrap();

    store.delete_workflow(workflow.id).await.unwrap();

    assert!(store.get_workflow(workflow.id).await.is_err());
    assert!(store.get_execution(execution.id).await.is_err());
    assert_eq!(store.pending_job_count(), 0);
}

#[tokio::test]
async fn trigger_creates_execution_and_job_together() {
    let store = MemoryStore::new();
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    let (execution, job) = store
        .create_execution_with_job(workflow.id, Some(json!({"x": 7})), TriggerType::Webhook)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert_eq!(execution.trigger_type, TriggerType::Webhook);
    assert!(execution.completed_at.is_none());

    assert_eq!(job.execution_id, execution.id);
    assert_eq!(job.workflow_id, workflow.id);
    assert_eq!(job.trigger_type, TriggerType::Webhook);
    assert_eq!(job.input_json, r#"{"x":7}"#);
    assert_eq!(store.pending_job_count(), 1);
}

#[tokio::test]
async fn outbox_enqueue_sets_idempotency_key_and_attempt_budget() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    let (node, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "send-email", 1))
        .await
        .unwrap();

    assert_eq!(node.status, NodeExecutionStatus::Pending);
    assert_eq!(node.idempotency_key.as_deref(), Some(message.idempotency_key.as_str()));
    assert!(message
        .idempotency_key
        .starts_with(&format!("{execution_id}-send-email-")));
    assert_eq!(message.status, OutboxStatus::Pending);
    assert_eq!(message.attempts, 0);
    // maxRetries = 1 allows one initial attempt plus one retry.
    assert_eq!(message.max_attempts, 2);
    assert_eq!(message.execution_id(), Some(execution_id));
}

#[tokio::test]
async fn max_retries_is_clamped() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    let (_, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "a", 99))
        .await
        .unwrap();
    assert_eq!(message.max_attempts, 11);

    let (_, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "b", -5))
        .await
        .unwrap();
    assert_eq!(message.max_attempts, 1);
}

#[tokio::test]
async fn only_one_worker_claims_a_message() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (_, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "n", 3))
        .await
        .unwrap();

    assert!(store.mark_message_processing(message.id).await.unwrap());
    assert!(!store.mark_message_processing(message.id).await.unwrap());
}

#[tokio::test]
async fn completing_last_message_completes_the_execution() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (node, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "n", 3))
        .await
        .unwrap();

    store.mark_message_processing(message.id).await.unwrap();
    let decided = store
        .complete_message(message.id, json!({"sent": true}))
        .await
        .unwrap();
    assert_eq!(decided, Some(ExecutionStatus::Success));

    let nodes = store.list_node_executions(execution_id).await.unwrap();
    let node = nodes.iter().find(|n| n.id == node.id).unwrap();
    assert_eq!(node.status, NodeExecutionStatus::Success);
    assert_eq!(node.output, Some(json!({"sent": true})));
    assert!(node.completed_at.unwrap() >= node.started_at);

    let execution = store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn completion_waits_for_all_messages() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (_, first) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "a", 3))
        .await
        .unwrap();
    let (_, second) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "b", 3))
        .await
        .unwrap();

    store.mark_message_processing(first.id).await.unwrap();
    let decided = store.complete_message(first.id, json!({})).await.unwrap();
    assert_eq!(decided, None);
    assert_eq!(
        store.get_execution(execution_id).await.unwrap().status,
        ExecutionStatus::Running
    );

    store.mark_message_processing(second.id).await.unwrap();
    let decided = store.complete_message(second.id, json!({})).await.unwrap();
    assert_eq!(decided, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn failed_message_retries_then_dead_letters() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (node, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "send-email", 1))
        .await
        .unwrap();

    // First attempt fails: retried with backoff.
    store.mark_message_processing(message.id).await.unwrap();
    let outcome = store.fail_message(message.id, "smtp timeout").await.unwrap();
    match outcome {
        OutboxFailureOutcome::WillRetry { attempt, next_retry_at } => {
            assert_eq!(attempt, 1);
            assert!(next_retry_at > chrono::Utc::now());
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // A message waiting for its backoff is not ready.
    assert!(store.fetch_ready_messages(10).await.unwrap().is_empty());

    // Second (final) attempt fails: dead-lettered and the execution is
    // reconciled to error since its only node failed.
    store.mark_message_processing(message.id).await.unwrap();
    let outcome = store.fail_message(message.id, "smtp timeout").await.unwrap();
    match outcome {
        OutboxFailureOutcome::DeadLettered { execution_status } => {
            assert_eq!(execution_status, Some(ExecutionStatus::Error));
        }
        other => panic!("expected dead letter, got {other:?}"),
    }

    let nodes = store.list_node_executions(execution_id).await.unwrap();
    let node = nodes.iter().find(|n| n.id == node.id).unwrap();
    assert_eq!(node.status, NodeExecutionStatus::Error);
    assert_eq!(
        node.error.as_deref(),
        Some("Failed after 2 attempts: smtp timeout")
    );

    let dead = store.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, dead[0].max_attempts);
}

#[tokio::test]
async fn mixed_failure_is_partially_failed() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    // One successful synchronous node.
    let ok = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "t".into(),
            node_type: "transform".into(),
            input: Some(json!(1)),
            parent_loop_node_id: None,
        })
        .await
        .unwrap();
    store.complete_node_execution(ok.id, json!(2)).await.unwrap();

    // One async node that exhausts its attempts.
    let (_, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "send", 0))
        .await
        .unwrap();
    store.mark_message_processing(message.id).await.unwrap();
    let outcome = store.fail_message(message.id, "boom").await.unwrap();
    match outcome {
        OutboxFailureOutcome::DeadLettered { execution_status } => {
            assert_eq!(execution_status, Some(ExecutionStatus::PartiallyFailed));
        }
        other => panic!("expected dead letter, got {other:?}"),
    }

    let execution = store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.error.as_deref(), Some("1 out of 2 nodes failed"));
}

#[tokio::test]
async fn retry_from_dead_letter_resets_attempts() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (_, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "n", 0))
        .await
        .unwrap();
    store.mark_message_processing(message.id).await.unwrap();
    store.fail_message(message.id, "boom").await.unwrap();

    store.retry_dead_letter(message.id).await.unwrap();
    let ready = store.fetch_ready_messages(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].message.attempts, 0);
    assert_eq!(ready[0].message.status, OutboxStatus::Pending);
    assert!(ready[0].message.last_error.is_none());
}

#[tokio::test]
async fn suspend_and_wake_round_trip() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let node = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "sleep-1".into(),
            node_type: "sleep".into(),
            input: None,
            parent_loop_node_id: None,
        })
        .await
        .unwrap();

    let wake_up_at = chrono::Utc::now() + chrono::Duration::seconds(2);
    let schedule = store
        .suspend_execution(execution_id, node.id, json!({"slept": true}), wake_up_at)
        .await
        .unwrap();

    // Sleeping executions carry exactly one schedule row.
    let execution = store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Sleeping);
    assert_eq!(store.all_sleep_schedules().len(), 1);

    // Not due yet.
    assert!(store
        .due_sleep_schedules(chrono::Utc::now(), 10)
        .await
        .unwrap()
        .is_empty());
    let due = store
        .due_sleep_schedules(wake_up_at + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);

    let job = store.wake_execution(schedule.id).await.unwrap().unwrap();
    assert_eq!(job.trigger_type, TriggerType::ResumeFromSleep);
    assert_eq!(
        store.get_execution(execution_id).await.unwrap().status,
        ExecutionStatus::Running
    );
    assert!(store.all_sleep_schedules().is_empty());

    // Second wake on the same schedule is a no-op.
    assert!(store.wake_execution(schedule.id).await.unwrap().is_none());
}

#[tokio::test]
async fn suspend_requires_running_execution() {
    let store = MemoryStore::new();
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    let (execution, _) = store
        .create_execution_with_job(workflow.id, None, TriggerType::Manual)
        .await
        .unwrap();
    let node = store
        .insert_node_execution(NewNodeExecution {
            execution_id: execution.id,
            node_id: "s".into(),
            node_type: "sleep".into(),
            input: None,
            parent_loop_node_id: None,
        })
        .await
        .unwrap();

    let result = store
        .suspend_execution(
            execution.id,
            node.id,
            json!({}),
            chrono::Utc::now() + chrono::Duration::seconds(5),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn job_claims_respect_visibility_timeout() {
    let store = MemoryStore::new();
    let workflow = store.create_workflow(new_workflow()).await.unwrap();
    store
        .create_execution_with_job(workflow.id, None, TriggerType::Manual)
        .await
        .unwrap();

    let claimed = store
        .dequeue_jobs("worker-a", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempts, 1);

    // Claimed jobs are invisible to other workers.
    let claimed_again = store
        .dequeue_jobs("worker-b", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(claimed_again.is_empty());

    // Past the visibility timeout the job is released for re-delivery.
    let released = store
        .release_expired_jobs(chrono::Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(released, 1);
    let reclaimed = store
        .dequeue_jobs("worker-b", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);
}

#[tokio::test]
async fn finish_execution_is_idempotent_on_terminal_rows() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    assert!(store
        .finish_execution(execution_id, ExecutionStatus::Success, Some(json!(1)), None)
        .await
        .unwrap());
    // A racing completion check loses quietly.
    assert!(!store
        .finish_execution(execution_id, ExecutionStatus::Error, None, Some("late".into()))
        .await
        .unwrap());

    let execution = store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.output, Some(json!(1)));
    assert!(execution.error.is_none());
}

#[tokio::test]
async fn cancel_execution_cancels_open_messages() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;
    let (node, message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "n", 3))
        .await
        .unwrap();
    let (done_node, done_message) = store
        .create_node_with_outbox(outbox_enqueue(execution_id, "m", 3))
        .await
        .unwrap();
    store.mark_message_processing(done_message.id).await.unwrap();
    store.complete_message(done_message.id, json!({})).await.unwrap();

    assert!(store.cancel_execution(execution_id).await.unwrap());
    let cancelled = store.cancel_pending_messages(execution_id).await.unwrap();
    assert_eq!(cancelled, 1);

    let messages = store.all_messages();
    let open = messages.iter().find(|m| m.id == message.id).unwrap();
    assert_eq!(open.status, OutboxStatus::Cancelled);
    let done = messages.iter().find(|m| m.id == done_message.id).unwrap();
    assert_eq!(done.status, OutboxStatus::Completed);

    let nodes = store.list_node_executions(execution_id).await.unwrap();
    assert_eq!(
        nodes.iter().find(|n| n.id == node.id).unwrap().status,
        NodeExecutionStatus::Cancelled
    );
    assert_eq!(
        nodes.iter().find(|n| n.id == done_node.id).unwrap().status,
        NodeExecutionStatus::Success
    );
}

#[tokio::test]
async fn checkpoints_exclude_loop_body_rows() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    let top = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "t".into(),
            node_type: "transform".into(),
            input: None,
            parent_loop_node_id: None,
        })
        .await
        .unwrap();
    store.complete_node_execution(top.id, json!(1)).await.unwrap();

    let body = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "b".into(),
            node_type: "transform".into(),
            input: None,
            parent_loop_node_id: Some("loop-1".into()),
        })
        .await
        .unwrap();
    store.complete_node_execution(body.id, json!(2)).await.unwrap();

    let checkpoints = store.successful_checkpoints(execution_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].node_id, "t");
}

#[tokio::test]
async fn recovery_stats_count_stuck_nodes_and_end_success() {
    let store = MemoryStore::new();
    let execution_id = running_execution(&store).await;

    let stuck = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "hung".into(),
            node_type: "transform".into(),
            input: None,
            parent_loop_node_id: None,
        })
        .await
        .unwrap();
    let end = store
        .insert_node_execution(NewNodeExecution {
            execution_id,
            node_id: "end".into(),
            node_type: "end".into(),
            input: None,
            parent_loop_node_id: None,
        })
        .await
        .unwrap();
    store.complete_node_execution(end.id, json!({})).await.unwrap();

    let stats = store.execution_recovery_stats(execution_id).await.unwrap();
    assert_eq!(stats.total_nodes, 2);
    assert_eq!(stats.stuck_running_nodes, 1);
    // Marker rows are not meaningful successes.
    assert_eq!(stats.success_nodes, 0);
    assert!(stats.end_node_succeeded);

    let changed = store
        .mark_stuck_nodes_failed(execution_id, "Node execution interrupted")
        .await
        .unwrap();
    assert_eq!(changed, 1);
    let nodes = store.list_node_executions(execution_id).await.unwrap();
    assert_eq!(
        nodes.iter().find(|n| n.id == stuck.id).unwrap().status,
        NodeExecutionStatus::Error
    );
}
