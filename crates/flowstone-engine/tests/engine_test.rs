//! End-to-end traversal tests against the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowstone_core::{ExecutionLimits, ExecutionStatus, NodeExecutionStatus, TriggerType};
use flowstone_engine::{
    EngineConfig, ExecutionContext, ExecutionResult, Executor, ExecutorError, ExecutorRegistry,
    NodeClass, WorkflowEngine,
};
use flowstone_storage::{MemoryStore, NewWorkflow, WorkflowStore};

/// Adds one to `input.item`, emitting `{"data": item + 1}`.
struct IncrementExecutor;

#[async_trait]
impl Executor for IncrementExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let item = ctx
            .input
            .get("item")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ExecutorError::Failed("input.item is not a number".into()))?;
        Ok(ExecutionResult::ok(json!({ "data": item + 1 })))
    }
}

/// Fails until `healed` flips to true.
struct FlakyExecutor {
    healed: Arc<AtomicBool>,
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        if self.healed.load(Ordering::SeqCst) {
            Ok(ExecutionResult::ok(json!({ "data": "recovered" })))
        } else {
            Ok(ExecutionResult::failed(format!(
                "node {} is flaky today",
                ctx.node_id
            )))
        }
    }
}

/// Never invoked by the engine; side-effect nodes go through the outbox.
struct UnreachableExecutor;

#[async_trait]
impl Executor for UnreachableExecutor {
    async fn execute(&self, _ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        Err(ExecutorError::Failed(
            "async executor invoked synchronously".into(),
        ))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    engine: WorkflowEngine,
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(ExecutionLimits::default())
    }

    fn with_limits(limits: ExecutionLimits) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ExecutorRegistry::with_builtins());
        registry.register("increment", NodeClass::Synchronous, Arc::new(IncrementExecutor));
        registry.register(
            "email",
            NodeClass::AsyncSideEffect,
            Arc::new(UnreachableExecutor),
        );
        let engine = WorkflowEngine::with_config(
            store.clone() as Arc<dyn WorkflowStore>,
            registry,
            EngineConfig {
                limits,
                sleep_enabled: true,
            },
        );
        Self { store, engine }
    }

    fn register(&self, node_type: &str, class: NodeClass, executor: Arc<dyn Executor>) {
        self.engine.registry().register(node_type, class, executor);
    }

    async fn workflow(&self, definition: Value) -> uuid::Uuid {
        let workflow = self
            .store
            .create_workflow(NewWorkflow {
                account_id: uuid::Uuid::now_v7(),
                name: "test".into(),
                cron_expr: None,
                timezone: "UTC".into(),
                webhook_path: None,
                webhook_secret_hash: None,
                webhook_require_auth: false,
            })
            .await
            .unwrap();
        self.store
            .create_version(workflow.id, definition, None)
            .await
            .unwrap();
        workflow.id
    }

    /// Trigger and run to the next stopping point.
    async fn run(&self, workflow_id: uuid::Uuid, input: Value) -> (uuid::Uuid, ExecutionStatus) {
        let (execution, _job) = self
            .store
            .create_execution_with_job(workflow_id, Some(input.clone()), TriggerType::Manual)
            .await
            .unwrap();
        let status = self
            .engine
            .execute(workflow_id, execution.id, Some(input), TriggerType::Manual, None)
            .await
            .unwrap();
        (execution.id, status)
    }
}

fn linear_transform_def() -> Value {
    json!({
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "extract", "type": "transform", "data": {"config": {"path": "$.x"}}},
            {"id": "end", "type": "end"},
        ],
        "edges": [
            {"source": "start", "target": "extract"},
            {"source": "extract", "target": "end"},
        ],
    })
}

#[tokio::test]
async fn linear_synchronous_graph() {
    let harness = Harness::new();
    let workflow_id = harness.workflow(linear_transform_def()).await;

    let (execution_id, status) = harness.run(workflow_id, json!({"x": 7, "y": 9})).await;
    assert_eq!(status, ExecutionStatus::Success);

    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.output, Some(json!({"data": 7})));
    assert!(execution.completed_at.is_some());

    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let transform = nodes.iter().find(|n| n.node_id == "extract").unwrap();
    assert_eq!(transform.status, NodeExecutionStatus::Success);
    assert_eq!(transform.output, Some(json!({"data": 7})));
}

#[tokio::test]
async fn conditional_branch_takes_one_path() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "big", "type": "transform", "data": {"config": {"path": "$.n"}}},
                {"id": "small", "type": "transform", "data": {"config": {"path": "$.n"}}},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "big", "condition": "input.n > 10"},
                {"source": "start", "target": "small", "condition": "input.n <= 10"},
                {"source": "big", "target": "end"},
                {"source": "small", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"n": 15})).await;
    assert_eq!(status, ExecutionStatus::Success);

    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert!(nodes.iter().any(|n| n.node_id == "big"));
    assert!(!nodes.iter().any(|n| n.node_id == "small"));
}

#[tokio::test]
async fn broken_condition_skips_the_edge() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "maybe", "type": "transform", "data": {"config": {"path": "$.n"}}},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                // Non-boolean result: the edge is skipped, not a failure.
                {"source": "start", "target": "maybe", "condition": "input.n + 1"},
                {"source": "start", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"n": 1})).await;
    assert_eq!(status, ExecutionStatus::Success);
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert!(!nodes.iter().any(|n| n.node_id == "maybe"));
}

#[tokio::test]
async fn empty_body_completes_with_input_as_output() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "end", "type": "end"},
            ],
            "edges": [{"source": "start", "target": "end"}],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"hello": "world"})).await;
    assert_eq!(status, ExecutionStatus::Success);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.output, Some(json!({"hello": "world"})));
}

#[tokio::test]
async fn async_node_is_queued_not_executed_inline() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "notify", "type": "email", "data": {"config": {"maxRetries": 2}}},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "notify"},
                {"source": "notify", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"n": 1})).await;
    // Traversal is done but the outbox message is still open.
    assert_eq!(status, ExecutionStatus::Running);

    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(execution.completed_at.is_none());

    let ready = harness.store.fetch_ready_messages(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].node_execution.node_id, "notify");
    assert_eq!(ready[0].message.max_attempts, 3);

    // The completion check finishes the execution once the message lands.
    let message_id = ready[0].message.id;
    harness.store.mark_message_processing(message_id).await.unwrap();
    let decided = harness
        .store
        .complete_message(message_id, json!({"sent": true}))
        .await
        .unwrap();
    assert_eq!(decided, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn loop_runs_body_once_per_element() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "each", "type": "loop", "data": {"config": {"items": "$.rows"}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "bump"},
                {"source": "bump", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"rows": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Success);

    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let body_rows: Vec<_> = nodes.iter().filter(|n| n.node_id == "bump").collect();
    assert_eq!(body_rows.len(), 3);
    assert!(body_rows
        .iter()
        .all(|n| n.parent_loop_node_id.as_deref() == Some("each")));

    let loop_row = nodes.iter().find(|n| n.node_id == "each").unwrap();
    assert_eq!(loop_row.status, NodeExecutionStatus::Success);
    let output = loop_row.output.clone().unwrap();
    assert_eq!(output["iteration_count"], json!(3));
    assert_eq!(
        output["results"],
        json!([{"data": 2}, {"data": 3}, {"data": 4}])
    );
}

#[tokio::test]
async fn loop_max_iterations_one_executes_once() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "each", "type": "loop",
                 "data": {"config": {"items": "$.rows", "max_iterations": 1}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "bump"},
                {"source": "bump", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"rows": [5, 6, 7]})).await;
    assert_eq!(status, ExecutionStatus::Success);
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert_eq!(nodes.iter().filter(|n| n.node_id == "bump").count(), 1);
}

#[tokio::test]
async fn loop_accumulator_array_mode() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "acc", "type": "loop-accumulator",
                 "data": {"config": {
                     "items": "$.values",
                     "accumulator_variable": "accumulated",
                     "accumulation_mode": "array",
                     "unwrap_data": true,
                 }}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "acc", "target": "bump", "sourceHandle": "loop-output"},
                {"source": "bump", "target": "acc"},
                {"source": "start", "target": "acc"},
                {"source": "acc", "target": "end", "sourceHandle": "output"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"values": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Success);

    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let acc = nodes.iter().find(|n| n.node_id == "acc").unwrap();
    assert_eq!(
        acc.output,
        Some(json!({"iteration_count": 3, "accumulated": [2, 3, 4]}))
    );

    // The final output flows through the "output" handle to the end node.
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(
        execution.output,
        Some(json!({"iteration_count": 3, "accumulated": [2, 3, 4]}))
    );
}

#[tokio::test]
async fn loop_accumulator_last_mode_keeps_final_value() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "acc", "type": "loop-accumulator",
                 "data": {"config": {
                     "items": "$.values",
                     "accumulation_mode": "last",
                 }}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "acc"},
                {"source": "acc", "target": "bump", "sourceHandle": "loop-output"},
                {"source": "bump", "target": "acc"},
                {"source": "acc", "target": "end", "sourceHandle": "output"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"values": [1, 5]})).await;
    assert_eq!(status, ExecutionStatus::Success);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(
        execution.output,
        Some(json!({"iteration_count": 2, "accumulated": 6}))
    );
}

#[tokio::test]
async fn nested_loops_beyond_depth_limit_fail() {
    let limits = ExecutionLimits::default().with_max_loop_depth(1);
    let harness = Harness::with_limits(limits);
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "outer", "type": "loop", "data": {"config": {"items": "$.rows"}}},
                {"id": "inner", "type": "loop", "data": {"config": {"items": "$.item"}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "outer"},
                {"source": "outer", "target": "inner"},
                {"source": "inner", "target": "bump"},
                {"source": "bump", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness
        .run(workflow_id, json!({"rows": [[1], [2]]}))
        .await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("maximum loop depth"));
}

#[tokio::test]
async fn depth_at_the_limit_succeeds() {
    let limits = ExecutionLimits::default().with_max_loop_depth(2);
    let harness = Harness::with_limits(limits);
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "outer", "type": "loop", "data": {"config": {"items": "$.rows"}}},
                {"id": "inner", "type": "loop", "data": {"config": {"items": "$.item"}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "outer"},
                {"source": "outer", "target": "inner"},
                {"source": "inner", "target": "bump"},
                {"source": "bump", "target": "end"},
            ],
        }))
        .await;

    let (_execution_id, status) = harness.run(workflow_id, json!({"rows": [[1], [2]]})).await;
    assert_eq!(status, ExecutionStatus::Success);
}

#[tokio::test]
async fn resumed_loop_checkpoint_does_not_rerun_the_body() {
    let harness = Harness::new();
    let healed = Arc::new(AtomicBool::new(false));
    harness.register(
        "flaky",
        NodeClass::Synchronous,
        Arc::new(FlakyExecutor {
            healed: healed.clone(),
        }),
    );

    // The loop branch completes first; the parallel flaky branch then fails
    // the execution, leaving the loop as a checkpoint.
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "each", "type": "loop", "data": {"config": {"items": "$.rows"}}},
                {"id": "bump", "type": "increment"},
                {"id": "wobbly", "type": "flaky"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "bump"},
                {"source": "bump", "target": "end"},
                {"source": "start", "target": "wobbly"},
                {"source": "wobbly", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"rows": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Error);

    healed.store(true, Ordering::SeqCst);
    let status = harness
        .engine
        .execute(workflow_id, execution_id, None, TriggerType::Resume, None)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Success);

    // Replaying the loop checkpoint keeps the body off the queue: the three
    // iteration rows from the first attempt are all there is, and none of
    // them re-ran at top level.
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let body_rows: Vec<_> = nodes.iter().filter(|n| n.node_id == "bump").collect();
    assert_eq!(body_rows.len(), 3);
    assert!(body_rows
        .iter()
        .all(|n| n.parent_loop_node_id.as_deref() == Some("each")));
    assert_eq!(nodes.iter().filter(|n| n.node_id == "each").count(), 1);
    assert_eq!(nodes.iter().filter(|n| n.node_id == "wobbly").count(), 2);
}

#[tokio::test]
async fn resumed_accumulator_checkpoint_continues_through_output_handle_only() {
    let harness = Harness::new();
    let healed = Arc::new(AtomicBool::new(false));
    harness.register(
        "flaky",
        NodeClass::Synchronous,
        Arc::new(FlakyExecutor {
            healed: healed.clone(),
        }),
    );

    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "acc", "type": "loop-accumulator",
                 "data": {"config": {"items": "$.values"}}},
                {"id": "bump", "type": "increment"},
                {"id": "wobbly", "type": "flaky"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "acc"},
                {"source": "acc", "target": "bump", "sourceHandle": "loop-output"},
                {"source": "bump", "target": "acc"},
                {"source": "acc", "target": "wobbly", "sourceHandle": "output"},
                {"source": "wobbly", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"values": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Error);

    healed.store(true, Ordering::SeqCst);
    let status = harness
        .engine
        .execute(workflow_id, execution_id, None, TriggerType::Resume, None)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Success);

    // The replayed accumulator follows only its "output" handle; the body
    // was not re-entered.
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let body_rows: Vec<_> = nodes.iter().filter(|n| n.node_id == "bump").collect();
    assert_eq!(body_rows.len(), 3);
    assert!(body_rows
        .iter()
        .all(|n| n.parent_loop_node_id.as_deref() == Some("acc")));
    assert_eq!(nodes.iter().filter(|n| n.node_id == "acc").count(), 1);
    assert_eq!(nodes.iter().filter(|n| n.node_id == "wobbly").count(), 2);

    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.output, Some(json!({"data": "recovered"})));
}

#[tokio::test]
async fn loop_aggregate_output_honors_the_size_cap() {
    // Every intermediate value fits; only the assembled aggregate does not.
    let aggregate = json!({
        "iteration_count": 3,
        "results": [{"data": 2}, {"data": 3}, {"data": 4}],
    });
    let limit = serde_json::to_vec(&aggregate).unwrap().len() - 1;

    let harness = Harness::with_limits(ExecutionLimits::default().with_max_data_bytes(limit));
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "each", "type": "loop", "data": {"config": {"items": "$.rows"}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "bump"},
                {"source": "bump", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"rows": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Error);

    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("maximum data size"));
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let loop_row = nodes.iter().find(|n| n.node_id == "each").unwrap();
    assert_eq!(loop_row.status, NodeExecutionStatus::Error);
}

#[tokio::test]
async fn accumulator_output_honors_the_size_cap() {
    let aggregate = json!({"iteration_count": 3, "accumulated": [2, 3, 4]});
    let limit = serde_json::to_vec(&aggregate).unwrap().len() - 1;

    let harness = Harness::with_limits(ExecutionLimits::default().with_max_data_bytes(limit));
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "acc", "type": "loop-accumulator",
                 "data": {"config": {"items": "$.values"}}},
                {"id": "bump", "type": "increment"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "acc"},
                {"source": "acc", "target": "bump", "sourceHandle": "loop-output"},
                {"source": "bump", "target": "acc"},
                {"source": "acc", "target": "end", "sourceHandle": "output"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"values": [1, 2, 3]})).await;
    assert_eq!(status, ExecutionStatus::Error);

    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("maximum data size"));
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    let acc_row = nodes.iter().find(|n| n.node_id == "acc").unwrap();
    assert_eq!(acc_row.status, NodeExecutionStatus::Error);
}

#[tokio::test]
async fn node_count_limit_fails_the_execution() {
    let limits = ExecutionLimits::default().with_max_node_executions(2);
    let harness = Harness::with_limits(limits);
    let workflow_id = harness.workflow(linear_transform_def()).await;

    let (execution_id, status) = harness.run(workflow_id, json!({"x": 1})).await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("maximum node executions"));
}

#[tokio::test]
async fn data_size_boundary_is_exact() {
    // The transform extracts a tiny value, so only the input check is in
    // play at the boundary.
    let input = json!({"x": 1, "padding": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"});
    let exact = serde_json::to_vec(&input).unwrap().len();

    // Exactly at the limit passes.
    let harness = Harness::with_limits(ExecutionLimits::default().with_max_data_bytes(exact));
    let workflow_id = harness.workflow(linear_transform_def()).await;
    let (_, status) = harness.run(workflow_id, input.clone()).await;
    assert_eq!(status, ExecutionStatus::Success);

    // A limit one byte smaller fails.
    let harness = Harness::with_limits(ExecutionLimits::default().with_max_data_bytes(exact - 1));
    let workflow_id = harness.workflow(linear_transform_def()).await;
    let (execution_id, status) = harness.run(workflow_id, input).await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("maximum data size"));
}

#[tokio::test]
async fn sleep_in_the_past_completes_immediately() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "nap", "type": "sleep",
                 "data": {"config": {"wake_up_at": "2020-01-01T00:00:00Z"}}},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "nap"},
                {"source": "nap", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({})).await;
    assert_eq!(status, ExecutionStatus::Success);
    assert!(harness.store.all_sleep_schedules().is_empty());
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn sleep_suspends_and_resumes_through_the_checkpoint() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "nap", "type": "sleep", "data": {"config": {"duration_ms": 60_000}}},
                {"id": "after", "type": "transform", "data": {"config": {"path": "$.wake_up_at"}}},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "nap"},
                {"source": "nap", "target": "after"},
                {"source": "after", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({})).await;
    assert_eq!(status, ExecutionStatus::Sleeping);

    let schedules = harness.store.all_sleep_schedules();
    assert_eq!(schedules.len(), 1);
    assert!(schedules[0].wake_up_at > chrono::Utc::now());

    // The downstream node has not run yet.
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert!(!nodes.iter().any(|n| n.node_id == "after"));

    // Wake and resume: the sleep checkpoint is replayed, not re-run.
    let job = harness
        .store
        .wake_execution(schedules[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.trigger_type, TriggerType::ResumeFromSleep);

    let status = harness
        .engine
        .execute(
            workflow_id,
            execution_id,
            None,
            TriggerType::ResumeFromSleep,
            None,
        )
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Success);

    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert_eq!(nodes.iter().filter(|n| n.node_id == "nap").count(), 1);
    assert!(nodes.iter().any(|n| n.node_id == "after"));
}

#[tokio::test]
async fn resume_skips_checkpointed_nodes() {
    let harness = Harness::new();
    let healed = Arc::new(AtomicBool::new(false));
    harness.register(
        "flaky",
        NodeClass::Synchronous,
        Arc::new(FlakyExecutor {
            healed: healed.clone(),
        }),
    );

    let workflow_id = harness
        .workflow(json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "extract", "type": "transform", "data": {"config": {"path": "$.x"}}},
                {"id": "wobbly", "type": "flaky"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"source": "start", "target": "extract"},
                {"source": "extract", "target": "wobbly"},
                {"source": "wobbly", "target": "end"},
            ],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({"x": 1})).await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution
        .error
        .as_deref()
        .unwrap()
        .contains("node execution failed (wobbly)"));

    healed.store(true, Ordering::SeqCst);
    let status = harness
        .engine
        .execute(workflow_id, execution_id, None, TriggerType::Resume, None)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Success);

    // The checkpointed transform ran exactly once across both attempts.
    let nodes = harness.store.list_node_executions(execution_id).await.unwrap();
    assert_eq!(nodes.iter().filter(|n| n.node_id == "extract").count(), 1);
    assert_eq!(nodes.iter().filter(|n| n.node_id == "wobbly").count(), 2);
}

#[tokio::test]
async fn shutdown_cancellation_interrupts_resumably() {
    let harness = Harness::new();
    let workflow_id = harness.workflow(linear_transform_def()).await;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(true);
    let (execution, _) = harness
        .store
        .create_execution_with_job(workflow_id, Some(json!({"x": 1})), TriggerType::Manual)
        .await
        .unwrap();
    let status = harness
        .engine
        .execute(
            workflow_id,
            execution.id,
            Some(json!({"x": 1})),
            TriggerType::Manual,
            Some(cancel_rx),
        )
        .await
        .unwrap();
    drop(cancel_tx);
    assert_eq!(status, ExecutionStatus::Interrupted);

    let row = harness.store.get_execution(execution.id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Interrupted);
    assert!(row.completed_at.is_none());
    assert!(row.status.is_resumable());
}

#[tokio::test]
async fn inactive_workflow_fails_fast() {
    let harness = Harness::new();
    let workflow_id = harness.workflow(linear_transform_def()).await;
    harness.store.set_workflow_active(workflow_id, false).await.unwrap();

    let (execution_id, status) = harness.run(workflow_id, json!({"x": 1})).await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("not active"));
}

#[tokio::test]
async fn invalid_definition_fails_fast() {
    let harness = Harness::new();
    let workflow_id = harness
        .workflow(json!({
            "nodes": [{"id": "start", "type": "start"}],
            "edges": [],
        }))
        .await;

    let (execution_id, status) = harness.run(workflow_id, json!({})).await;
    assert_eq!(status, ExecutionStatus::Error);
    let execution = harness.store.get_execution(execution_id).await.unwrap();
    assert!(execution.error.unwrap().contains("end node"));
}
