//! Graph execution engine.
//!
//! Traverses a workflow definition once per trigger: FIFO over ready nodes,
//! conditional edges, checkpoint replay for resumed executions, sequential
//! loop iteration with depth tracking, and the sleep side-channel. Limits
//! are checked before every node dispatch; the wall clock is measured from
//! the execution's original `started_at` so resumed attempts share the
//! budget.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use flowstone_core::definition::{
    EdgeDef, NodeDef, WorkflowDefinition, END_NODE_TYPE, LOOP_ACCUMULATOR_NODE_TYPE,
    LOOP_NODE_TYPE, OUTPUT_HANDLE,
};
use flowstone_core::{
    DefinitionError, EngineError, ExecutionLimits, ExecutionStatus, LimitKind, TriggerType,
};
use flowstone_storage::{NewNodeExecution, OutboxEnqueue, StoreError, WorkflowStore};

use crate::executor::{ExecutionContext, NodeClass};
use crate::expr::{eval_condition, ConditionScope};
use crate::registry::ExecutorRegistry;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: ExecutionLimits,
    /// Whether the sleep-timer subsystem is running. When it is not, a
    /// sleep signal fails the node instead of stranding the execution.
    pub sleep_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            sleep_enabled: true,
        }
    }
}

/// The workflow engine. Cheap to clone per worker via `Arc`s.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
}

fn store_err(e: StoreError) -> EngineError {
    EngineError::Store(e.to_string())
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            store,
            registry,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Execute (or resume) one workflow execution to its next stopping
    /// point: completion, suspension, or failure.
    ///
    /// Domain failures are recorded on the execution row and returned as the
    /// resulting status; only system faults (store errors, missing
    /// execution) surface as `Err` for the job worker to retry or log.
    #[instrument(skip(self, input, cancel), fields(%execution_id, %trigger))]
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        input: Option<Value>,
        trigger: TriggerType,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ExecutionStatus, EngineError> {
        let execution = match self.store.get_execution(execution_id).await {
            Ok(row) => row,
            Err(StoreError::ExecutionNotFound(id)) => {
                return Err(EngineError::ExecutionNotFound(id));
            }
            Err(e) => return Err(store_err(e)),
        };
        // Resume re-opens `error` executions; every other terminal status
        // stays final.
        let resuming_failed =
            trigger == TriggerType::Resume && execution.status.is_resumable();
        if execution.status.is_terminal() && !resuming_failed {
            debug!(status = %execution.status, "execution already terminal; nothing to do");
            return Ok(execution.status);
        }

        let workflow = self.store.get_workflow(workflow_id).await.map_err(store_err)?;
        if !workflow.is_active {
            let err = EngineError::WorkflowInactive(workflow_id);
            return self.record_failure(execution_id, err).await;
        }

        let version = self
            .store
            .latest_version(workflow_id)
            .await
            .map_err(store_err)?;
        let def = match WorkflowDefinition::from_value(version.definition.clone()) {
            Ok(def) => def,
            Err(e) => return self.record_failure(execution_id, e.into()).await,
        };
        if let Err(e) = def.validate(|t| self.registry.contains(t)) {
            return self.record_failure(execution_id, e.into()).await;
        }

        self.store
            .mark_execution_running(execution_id)
            .await
            .map_err(store_err)?;

        let checkpoint_rows = self
            .store
            .successful_checkpoints(execution_id)
            .await
            .map_err(store_err)?;
        let mut checkpoints = HashMap::new();
        for row in checkpoint_rows {
            if let Some(output) = row.output {
                checkpoints.insert(row.node_id, output);
            }
        }
        if !checkpoints.is_empty() {
            info!(checkpoints = checkpoints.len(), "resuming from checkpoints");
        }

        let initial_input = input
            .or_else(|| execution.input.clone())
            .unwrap_or(Value::Null);

        let budget = chrono::Duration::from_std(self.config.limits.max_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let deadline = execution.started_at + budget;

        // Resumed executions run on a detached, deadline-only context so a
        // draining process does not interrupt them again.
        let cancel = if trigger.is_resume() { None } else { cancel };

        let mut run = Run {
            engine: self,
            def,
            execution_id,
            account_id: workflow.account_id,
            initial_input,
            node_outputs: HashMap::new(),
            checkpoints,
            nodes_executed: 0,
            deadline,
            cancel,
            depth: 0,
            end_output: None,
        };

        match run.traverse().await {
            Ok(TraversalEnd::Suspended) => Ok(ExecutionStatus::Sleeping),
            Ok(TraversalEnd::Completed) => {
                let output = run
                    .end_output
                    .clone()
                    .unwrap_or_else(|| run.initial_input.clone());
                let open = self
                    .store
                    .count_open_messages(execution_id)
                    .await
                    .map_err(store_err)?;
                if open > 0 {
                    // Outbox completion finishes the execution once the last
                    // message lands; record the output now so it survives.
                    self.store
                        .set_execution_output(execution_id, output)
                        .await
                        .map_err(store_err)?;
                    debug!(open, "traversal done, waiting on outbox messages");
                    Ok(ExecutionStatus::Running)
                } else {
                    self.store
                        .finish_execution(
                            execution_id,
                            ExecutionStatus::Success,
                            Some(output),
                            None,
                        )
                        .await
                        .map_err(store_err)?;
                    info!("execution completed");
                    Ok(ExecutionStatus::Success)
                }
            }
            Err(err) => self.record_failure(execution_id, err).await,
        }
    }

    /// Record a traversal failure on the execution row and translate it into
    /// the resulting status.
    async fn record_failure(
        &self,
        execution_id: Uuid,
        err: EngineError,
    ) -> Result<ExecutionStatus, EngineError> {
        match &err {
            EngineError::Interrupted => {
                self.store
                    .interrupt_execution(
                        execution_id,
                        "Execution interrupted by shutdown - workflow can be resumed",
                    )
                    .await
                    .map_err(store_err)?;
                warn!(%execution_id, "execution interrupted");
                Ok(ExecutionStatus::Interrupted)
            }
            EngineError::Store(_) | EngineError::ExecutionNotFound(_) => Err(err),
            _ => {
                self.store
                    .finish_execution(
                        execution_id,
                        ExecutionStatus::Error,
                        None,
                        Some(err.to_string()),
                    )
                    .await
                    .map_err(store_err)?;
                warn!(%execution_id, error = %err, "execution failed");
                Ok(ExecutionStatus::Error)
            }
        }
    }
}

// =============================================================================
// Traversal
// =============================================================================

enum TraversalEnd {
    Completed,
    Suspended,
}

enum StepOutcome {
    Continue,
    Suspended,
}

enum SubOutcome {
    Completed(Value),
    Suspended,
}

enum LoopEnd {
    Done,
    Suspended,
}

/// Per-traversal-level scope: the top level and each loop iteration get
/// their own executed set and fallback input.
struct Scope {
    executed: HashSet<String>,
    /// Set inside loop bodies; edges back to this node are feedback edges
    /// and are never traversed.
    parent_loop: Option<String>,
    /// Input for nodes with no executed upstream source.
    default_input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ErrorHandling {
    Skip,
    Fail,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self::Fail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AccumulationMode {
    Array,
    Last,
}

impl Default for AccumulationMode {
    fn default() -> Self {
        Self::Array
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoopSettings {
    #[serde(default)]
    item_variable: Option<String>,
    #[serde(default)]
    index_variable: Option<String>,
    #[serde(default)]
    iteration_delay_ms: Option<u64>,
    #[serde(default)]
    error_handling: ErrorHandling,
}

#[derive(Debug, Deserialize)]
struct AccumulatorSettings {
    #[serde(default = "default_accumulator_variable")]
    accumulator_variable: String,
    #[serde(default)]
    accumulation_mode: AccumulationMode,
    #[serde(default = "default_true")]
    unwrap_data: bool,
    #[serde(default)]
    item_variable: Option<String>,
    #[serde(default)]
    index_variable: Option<String>,
    #[serde(default)]
    iteration_delay_ms: Option<u64>,
    #[serde(default)]
    error_handling: ErrorHandling,
}

fn default_accumulator_variable() -> String {
    "accumulated".to_string()
}

fn default_true() -> bool {
    true
}

struct Run<'e> {
    engine: &'e WorkflowEngine,
    def: WorkflowDefinition,
    execution_id: Uuid,
    account_id: Uuid,
    initial_input: Value,
    node_outputs: HashMap<String, Value>,
    checkpoints: HashMap<String, Value>,
    nodes_executed: u32,
    deadline: DateTime<Utc>,
    cancel: Option<watch::Receiver<bool>>,
    depth: u32,
    end_output: Option<Value>,
}

impl Run<'_> {
    fn limits(&self) -> &ExecutionLimits {
        &self.engine.config.limits
    }

    /// Context cancellation, wall clock and node-count checks, run before
    /// every node dispatch (top level and inside loops).
    fn check_limits(&self) -> Result<(), EngineError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Err(EngineError::Interrupted);
            }
        }
        if Utc::now() > self.deadline {
            return Err(EngineError::DeadlineExceeded);
        }
        if self.nodes_executed >= self.limits().max_node_executions {
            return Err(EngineError::LimitExceeded(LimitKind::NodeCount));
        }
        Ok(())
    }

    fn check_data_size(&self, value: &Value) -> Result<(), EngineError> {
        if ExecutionLimits::serialized_size(value) > self.limits().max_data_bytes {
            return Err(EngineError::LimitExceeded(LimitKind::DataSize));
        }
        Ok(())
    }

    fn workflow_data(&self) -> Value {
        json!({ "nodeOutputs": self.node_outputs, "input": self.initial_input })
    }

    /// Output of the first executed source targeting `node_id`, else the
    /// scope's fallback input.
    fn resolve_input(&self, node_id: &str, scope: &Scope) -> Value {
        for edge in self.def.incoming(node_id) {
            if let Some(output) = self.node_outputs.get(&edge.source) {
                return output.clone();
            }
        }
        scope.default_input.clone()
    }

    /// Evaluate an edge condition. A missing condition always passes; an
    /// evaluation error or non-boolean result skips the edge.
    fn edge_allows(&self, edge: &EdgeDef) -> bool {
        let Some(condition) = &edge.condition else {
            return true;
        };
        let current = self
            .node_outputs
            .get(&edge.source)
            .cloned()
            .unwrap_or(Value::Null);
        let scope = ConditionScope {
            data: &current,
            input: &self.initial_input,
            node_outputs: &self.node_outputs,
        };
        match eval_condition(condition, &scope) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    source = %edge.source,
                    target = %edge.target,
                    condition,
                    error = %e,
                    "edge condition rejected; skipping target"
                );
                false
            }
        }
    }

    /// Enqueue the conditional children of an executed node. Feedback edges
    /// into the enclosing loop node are refused.
    fn enqueue_children(&self, node_id: &str, queue: &mut VecDeque<String>, scope: &Scope) {
        let edges: Vec<EdgeDef> = self.def.outgoing(node_id).cloned().collect();
        for edge in edges {
            if scope
                .parent_loop
                .as_deref()
                .is_some_and(|parent| edge.target == parent)
            {
                continue;
            }
            if scope.executed.contains(&edge.target) {
                continue;
            }
            if self.edge_allows(&edge) {
                queue.push_back(edge.target);
            }
        }
    }

    /// Body roots of a plain loop: every outgoing edge.
    fn loop_body_roots(&self, node_id: &str) -> Vec<String> {
        self.def
            .outgoing(node_id)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Body roots of a loop-accumulator: "loop-output" feeds the body; edges
    /// without a handle are treated as body edges for designer leniency.
    fn accumulator_body_roots(&self, node_id: &str) -> Vec<String> {
        self.def
            .outgoing(node_id)
            .filter(|e| e.source_handle.as_deref() != Some(OUTPUT_HANDLE))
            .map(|e| e.target.clone())
            .collect()
    }

    /// Continue the outer graph from a finished loop-accumulator: only the
    /// "output" handle is followed.
    fn enqueue_output_handle_edges(
        &self,
        node_id: &str,
        queue: &mut VecDeque<String>,
        scope: &Scope,
    ) {
        let edges: Vec<EdgeDef> = self
            .def
            .outgoing(node_id)
            .filter(|e| e.source_handle.as_deref() == Some(OUTPUT_HANDLE))
            .cloned()
            .collect();
        for edge in edges {
            if !scope.executed.contains(&edge.target) && self.edge_allows(&edge) {
                queue.push_back(edge.target);
            }
        }
    }

    /// Top-level traversal.
    async fn traverse(&mut self) -> Result<TraversalEnd, EngineError> {
        let start_id = self
            .def
            .start_node()
            .map(|n| n.id.clone())
            .ok_or(EngineError::Definition(DefinitionError::StartNodeCount(0)))?;

        let mut scope = Scope {
            executed: HashSet::new(),
            parent_loop: None,
            default_input: self.initial_input.clone(),
        };
        let mut queue = VecDeque::new();
        queue.push_back(start_id);

        while let Some(current_id) = queue.pop_front() {
            if scope.executed.contains(&current_id) {
                continue;
            }
            self.check_limits()?;

            // Checkpoint replay: completed nodes contribute their stored
            // output and are not re-executed. Loop checkpoints mirror the
            // live dispatch: a finished loop keeps its whole body subgraph
            // off the queue (iterations are never replayed piecemeal), and a
            // loop-accumulator continues only through its "output" handle.
            if let Some(output) = self.checkpoints.get(&current_id).cloned() {
                debug!(node_id = %current_id, "replaying checkpoint");
                let node_type = self
                    .def
                    .node(&current_id)
                    .map(|n| n.node_type.clone())
                    .unwrap_or_default();
                if node_type == END_NODE_TYPE {
                    self.end_output = Some(output.clone());
                }
                self.node_outputs.insert(current_id.clone(), output);
                scope.executed.insert(current_id.clone());
                match node_type.as_str() {
                    LOOP_NODE_TYPE => {
                        let body_roots = self.loop_body_roots(&current_id);
                        self.mark_subgraph_executed(&body_roots, &current_id, &mut scope);
                    }
                    LOOP_ACCUMULATOR_NODE_TYPE => {
                        let body_roots = self.accumulator_body_roots(&current_id);
                        self.mark_subgraph_executed(&body_roots, &current_id, &mut scope);
                        self.enqueue_output_handle_edges(&current_id, &mut queue, &scope);
                    }
                    _ => self.enqueue_children(&current_id, &mut queue, &scope),
                }
                continue;
            }

            let node = self
                .def
                .node(&current_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Definition(DefinitionError::DanglingEdge(current_id.clone()))
                })?;
            self.nodes_executed += 1;

            match self.dispatch(&node, &mut queue, &mut scope).await? {
                StepOutcome::Continue => {}
                StepOutcome::Suspended => return Ok(TraversalEnd::Suspended),
            }
        }

        Ok(TraversalEnd::Completed)
    }

    /// Dispatch one node within a scope. Shared by the top-level traversal
    /// and loop sub-traversals.
    async fn dispatch(
        &mut self,
        node: &NodeDef,
        queue: &mut VecDeque<String>,
        scope: &mut Scope,
    ) -> Result<StepOutcome, EngineError> {
        match node.node_type.as_str() {
            LOOP_NODE_TYPE => match self.run_loop(node, scope).await? {
                // The loop marked its body subgraph executed; nothing to
                // enqueue.
                LoopEnd::Done => Ok(StepOutcome::Continue),
                LoopEnd::Suspended => Ok(StepOutcome::Suspended),
            },
            LOOP_ACCUMULATOR_NODE_TYPE => match self.run_loop_accumulator(node, scope).await? {
                LoopEnd::Done => {
                    self.enqueue_output_handle_edges(&node.id, queue, scope);
                    Ok(StepOutcome::Continue)
                }
                LoopEnd::Suspended => Ok(StepOutcome::Suspended),
            },
            _ => {
                let class = self
                    .engine
                    .registry
                    .class_of(&node.node_type)
                    .unwrap_or(NodeClass::Synchronous);
                match class {
                    NodeClass::Skippable => {
                        let input = self.resolve_input(&node.id, scope);
                        if node.node_type == END_NODE_TYPE {
                            // End nodes get a row so recovery can tell a
                            // finished graph from an interrupted one.
                            let row = self
                                .engine
                                .store
                                .insert_node_execution(NewNodeExecution {
                                    execution_id: self.execution_id,
                                    node_id: node.id.clone(),
                                    node_type: node.node_type.clone(),
                                    input: Some(input.clone()),
                                    parent_loop_node_id: scope.parent_loop.clone(),
                                })
                                .await
                                .map_err(store_err)?;
                            self.engine
                                .store
                                .complete_node_execution(row.id, input.clone())
                                .await
                                .map_err(store_err)?;
                            self.end_output = Some(input.clone());
                        }
                        self.node_outputs.insert(node.id.clone(), input);
                        scope.executed.insert(node.id.clone());
                        self.enqueue_children(&node.id, queue, scope);
                        Ok(StepOutcome::Continue)
                    }
                    NodeClass::AsyncSideEffect => {
                        self.dispatch_async(node, scope).await?;
                        scope.executed.insert(node.id.clone());
                        self.enqueue_children(&node.id, queue, scope);
                        Ok(StepOutcome::Continue)
                    }
                    NodeClass::Synchronous => {
                        let outcome = self.run_sync(node, scope).await?;
                        if matches!(outcome, StepOutcome::Continue) {
                            scope.executed.insert(node.id.clone());
                            self.enqueue_children(&node.id, queue, scope);
                        }
                        Ok(outcome)
                    }
                }
            }
        }
    }

    /// Hand a side-effect node to the outbox: node row and message are
    /// created in one transaction, the traversal sees only a queued stub.
    async fn dispatch_async(&mut self, node: &NodeDef, scope: &Scope) -> Result<(), EngineError> {
        let input = self.resolve_input(&node.id, scope);
        self.check_data_size(&input)?;

        self.engine
            .store
            .create_node_with_outbox(OutboxEnqueue {
                execution_id: self.execution_id,
                account_id: self.account_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                config: node.data.config.clone(),
                input,
                workflow_data: self.workflow_data(),
                event_type: node.node_type.clone(),
                parent_loop_node_id: scope.parent_loop.clone(),
            })
            .await
            .map_err(store_err)?;

        debug!(node_id = %node.id, node_type = %node.node_type, "queued side-effect node");
        self.node_outputs.insert(
            node.id.clone(),
            json!({ "status": "queued", "nodeId": node.id }),
        );
        Ok(())
    }

    /// Execute a synchronous node inline, handling the sleep side-channel.
    async fn run_sync(
        &mut self,
        node: &NodeDef,
        scope: &Scope,
    ) -> Result<StepOutcome, EngineError> {
        let input = self.resolve_input(&node.id, scope);
        self.check_data_size(&input)?;

        let executor = self
            .engine
            .registry
            .get(&node.node_type)
            .ok_or_else(|| EngineError::Store(format!("no executor for {}", node.node_type)))?;

        let row = self
            .engine
            .store
            .insert_node_execution(NewNodeExecution {
                execution_id: self.execution_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                input: Some(input.clone()),
                parent_loop_node_id: scope.parent_loop.clone(),
            })
            .await
            .map_err(store_err)?;

        let ctx = ExecutionContext {
            node_id: node.id.clone(),
            node_config: node.data.config.clone(),
            input,
            workflow_data: self.workflow_data(),
            execution_id: self.execution_id,
            account_id: self.account_id,
            idempotency_key: None,
        };

        let result = match executor.execute(ctx).await {
            Ok(result) if result.success => result,
            Ok(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                self.engine
                    .store
                    .fail_node_execution(row.id, &message)
                    .await
                    .map_err(store_err)?;
                return Err(EngineError::NodeFailed {
                    node_id: node.id.clone(),
                    message,
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.engine
                    .store
                    .fail_node_execution(row.id, &message)
                    .await
                    .map_err(store_err)?;
                return Err(EngineError::NodeFailed {
                    node_id: node.id.clone(),
                    message,
                });
            }
        };

        if let Err(e) = self.check_data_size(&result.output) {
            self.engine
                .store
                .fail_node_execution(row.id, "output exceeds the per-node size limit")
                .await
                .map_err(store_err)?;
            return Err(e);
        }

        // Sleep side-channel: a wake time in the past completes immediately.
        if result.needs_sleep {
            let wake_up_at = result.wake_up_at.unwrap_or_else(Utc::now);
            if wake_up_at > Utc::now() {
                if !self.engine.config.sleep_enabled {
                    let message = "sleep requested but no sleep scheduler is configured";
                    self.engine
                        .store
                        .fail_node_execution(row.id, message)
                        .await
                        .map_err(store_err)?;
                    return Err(EngineError::NodeFailed {
                        node_id: node.id.clone(),
                        message: message.to_string(),
                    });
                }
                self.engine
                    .store
                    .suspend_execution(self.execution_id, row.id, result.output.clone(), wake_up_at)
                    .await
                    .map_err(store_err)?;
                info!(node_id = %node.id, %wake_up_at, "execution suspended for sleep");
                self.node_outputs.insert(node.id.clone(), result.output);
                return Ok(StepOutcome::Suspended);
            }
        }

        self.engine
            .store
            .complete_node_execution(row.id, result.output.clone())
            .await
            .map_err(store_err)?;
        debug!(node_id = %node.id, "node completed");
        self.node_outputs.insert(node.id.clone(), result.output);
        Ok(StepOutcome::Continue)
    }

    // =========================================================================
    // Loops
    // =========================================================================

    fn enter_loop(&mut self) -> Result<(), EngineError> {
        self.depth += 1;
        if self.depth > self.limits().max_loop_depth {
            return Err(EngineError::LimitExceeded(LimitKind::LoopDepth));
        }
        Ok(())
    }

    /// Resolve the loop's iteration elements via its executor.
    async fn resolve_loop_items(
        &self,
        node: &NodeDef,
        input: &Value,
    ) -> Result<Vec<Value>, EngineError> {
        let executor = self
            .engine
            .registry
            .get(&node.node_type)
            .ok_or_else(|| EngineError::Store(format!("no executor for {}", node.node_type)))?;
        let ctx = ExecutionContext {
            node_id: node.id.clone(),
            node_config: node.data.config.clone(),
            input: input.clone(),
            workflow_data: self.workflow_data(),
            execution_id: self.execution_id,
            account_id: self.account_id,
            idempotency_key: None,
        };
        let result = executor
            .execute(ctx)
            .await
            .map_err(|e| EngineError::NodeFailed {
                node_id: node.id.clone(),
                message: e.to_string(),
            })?;
        if !result.success {
            return Err(EngineError::NodeFailed {
                node_id: node.id.clone(),
                message: result
                    .error
                    .unwrap_or_else(|| "loop source resolution failed".to_string()),
            });
        }
        let items = result
            .output
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if items.len() as u32 > self.limits().max_loop_iterations {
            return Err(EngineError::LimitExceeded(LimitKind::LoopIterations));
        }
        Ok(items)
    }

    fn iteration_input(
        item_variable: &Option<String>,
        index_variable: &Option<String>,
        element: &Value,
        extra: Option<(&str, Value)>,
    ) -> Value {
        let index = element.get("index").cloned().unwrap_or(Value::Null);
        let item = element.get("item").cloned().unwrap_or(Value::Null);
        let mut map = serde_json::Map::new();
        map.insert("index".to_string(), index.clone());
        map.insert("item".to_string(), item.clone());
        if let Some(name) = item_variable {
            map.insert(name.clone(), item);
        }
        if let Some(name) = index_variable {
            map.insert(name.clone(), index);
        }
        if let Some((name, value)) = extra {
            map.insert(name.to_string(), value);
        }
        Value::Object(map)
    }

    async fn iteration_delay(&self, node_id: &str, delay_ms: Option<u64>) {
        let Some(delay_ms) = delay_ms else { return };
        if delay_ms == 0 {
            return;
        }
        if delay_ms > 5_000 {
            warn!(
                node_id,
                delay_ms,
                "long iteration delay blocks a worker; prefer a sleep node in the loop body"
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }

    /// Mark every node reachable from the loop body as executed so the
    /// outer traversal does not re-run it.
    fn mark_subgraph_executed(&self, roots: &[String], loop_id: &str, scope: &mut Scope) {
        let mut stack: Vec<String> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if id == loop_id || !scope.executed.insert(id.clone()) {
                continue;
            }
            for edge in self.def.outgoing(&id) {
                stack.push(edge.target.clone());
            }
        }
    }

    /// Iteration-only loop: execute the downstream
    /// subgraph once per element, sequentially.
    async fn run_loop(&mut self, node: &NodeDef, scope: &mut Scope) -> Result<LoopEnd, EngineError> {
        self.enter_loop()?;
        let result = self.run_loop_inner(node, scope).await;
        self.depth -= 1;
        result
    }

    async fn run_loop_inner(
        &mut self,
        node: &NodeDef,
        scope: &mut Scope,
    ) -> Result<LoopEnd, EngineError> {
        let settings: LoopSettings =
            serde_json::from_value(node.data.config.clone()).unwrap_or_default();
        let input = self.resolve_input(&node.id, scope);
        self.check_data_size(&input)?;

        let row = self
            .engine
            .store
            .insert_node_execution(NewNodeExecution {
                execution_id: self.execution_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                input: Some(input.clone()),
                parent_loop_node_id: scope.parent_loop.clone(),
            })
            .await
            .map_err(store_err)?;

        let items = match self.resolve_loop_items(node, &input).await {
            Ok(items) => items,
            Err(e) => {
                self.engine
                    .store
                    .fail_node_execution(row.id, &e.to_string())
                    .await
                    .map_err(store_err)?;
                return Err(e);
            }
        };

        let body_roots = self.loop_body_roots(&node.id);

        debug!(node_id = %node.id, iterations = items.len(), "running loop");
        let mut iteration_outputs = Vec::with_capacity(items.len());
        for element in &items {
            self.check_limits()?;
            let iteration_input = Self::iteration_input(
                &settings.item_variable,
                &settings.index_variable,
                element,
                None,
            );
            match self
                .sub_traverse_boxed(body_roots.clone(), iteration_input, node.id.clone())
                .await
            {
                Ok(SubOutcome::Completed(output)) => iteration_outputs.push(output),
                Ok(SubOutcome::Suspended) => return Ok(LoopEnd::Suspended),
                Err(e @ EngineError::NodeFailed { .. })
                    if settings.error_handling == ErrorHandling::Skip =>
                {
                    warn!(node_id = %node.id, error = %e, "loop iteration failed; skipping");
                }
                Err(e) => {
                    self.engine
                        .store
                        .fail_node_execution(row.id, &e.to_string())
                        .await
                        .map_err(store_err)?;
                    return Err(e);
                }
            }
            self.iteration_delay(&node.id, settings.iteration_delay_ms).await;
        }

        self.mark_subgraph_executed(&body_roots, &node.id, scope);

        let output = json!({
            "iteration_count": items.len(),
            "results": iteration_outputs,
        });
        // The aggregate is a node output like any other and honors the
        // per-node size cap.
        if let Err(e) = self.check_data_size(&output) {
            self.engine
                .store
                .fail_node_execution(row.id, "output exceeds the per-node size limit")
                .await
                .map_err(store_err)?;
            return Err(e);
        }
        self.engine
            .store
            .complete_node_execution(row.id, output.clone())
            .await
            .map_err(store_err)?;
        self.node_outputs.insert(node.id.clone(), output);
        scope.executed.insert(node.id.clone());
        Ok(LoopEnd::Done)
    }

    /// Feedback loop with accumulation.
    async fn run_loop_accumulator(
        &mut self,
        node: &NodeDef,
        scope: &mut Scope,
    ) -> Result<LoopEnd, EngineError> {
        self.enter_loop()?;
        let result = self.run_loop_accumulator_inner(node, scope).await;
        self.depth -= 1;
        result
    }

    async fn run_loop_accumulator_inner(
        &mut self,
        node: &NodeDef,
        scope: &mut Scope,
    ) -> Result<LoopEnd, EngineError> {
        let settings: AccumulatorSettings = serde_json::from_value(node.data.config.clone())
            .map_err(|e| EngineError::NodeFailed {
                node_id: node.id.clone(),
                message: format!("invalid loop-accumulator config: {e}"),
            })?;
        let input = self.resolve_input(&node.id, scope);
        self.check_data_size(&input)?;

        let items = self.resolve_loop_items(node, &input).await?;

        let body_roots = self.accumulator_body_roots(&node.id);
        if body_roots.is_empty() {
            return Err(EngineError::NodeFailed {
                node_id: node.id.clone(),
                message: "loop-accumulator has no loop body edges".to_string(),
            });
        }

        let mut accumulated = match settings.accumulation_mode {
            AccumulationMode::Array => json!([]),
            AccumulationMode::Last => Value::Null,
        };

        debug!(node_id = %node.id, iterations = items.len(), "running loop-accumulator");
        for element in &items {
            self.check_limits()?;
            let iteration_input = Self::iteration_input(
                &settings.item_variable,
                &settings.index_variable,
                element,
                Some((settings.accumulator_variable.as_str(), accumulated.clone())),
            );

            let outcome = self
                .sub_traverse_boxed(body_roots.clone(), iteration_input, node.id.clone())
                .await;
            let iteration_output = match outcome {
                Ok(SubOutcome::Completed(output)) => output,
                Ok(SubOutcome::Suspended) => return Ok(LoopEnd::Suspended),
                Err(e @ EngineError::NodeFailed { .. })
                    if settings.error_handling == ErrorHandling::Skip =>
                {
                    warn!(node_id = %node.id, error = %e, "iteration failed; accumulator unchanged");
                    self.iteration_delay(&node.id, settings.iteration_delay_ms).await;
                    continue;
                }
                Err(e) => {
                    self.record_accumulator_failure(node, scope, &input, &e).await?;
                    return Err(e);
                }
            };

            let value = if settings.unwrap_data {
                iteration_output
                    .get("data")
                    .cloned()
                    .unwrap_or(iteration_output)
            } else {
                iteration_output
            };
            match settings.accumulation_mode {
                AccumulationMode::Array => {
                    if let Some(arr) = accumulated.as_array_mut() {
                        arr.push(value);
                    }
                }
                AccumulationMode::Last => accumulated = value,
            }
            if ExecutionLimits::serialized_size(&accumulated) > self.limits().max_accumulator_bytes
            {
                let e = EngineError::LimitExceeded(LimitKind::AccumulatorSize);
                self.record_accumulator_failure(node, scope, &input, &e).await?;
                return Err(e);
            }

            self.iteration_delay(&node.id, settings.iteration_delay_ms).await;
        }

        self.mark_subgraph_executed(&body_roots, &node.id, scope);

        let mut output_map = serde_json::Map::new();
        output_map.insert("iteration_count".to_string(), json!(items.len()));
        output_map.insert(settings.accumulator_variable.clone(), accumulated);
        let output = Value::Object(output_map);

        // The accumulator cap bounds the value; the assembled node output
        // still honors the per-node size cap.
        if let Err(e) = self.check_data_size(&output) {
            self.record_accumulator_failure(node, scope, &input, &e).await?;
            return Err(e);
        }

        // The accumulator's node execution is written once, at completion.
        let row = self
            .engine
            .store
            .insert_node_execution(NewNodeExecution {
                execution_id: self.execution_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                input: Some(input),
                parent_loop_node_id: scope.parent_loop.clone(),
            })
            .await
            .map_err(store_err)?;
        self.engine
            .store
            .complete_node_execution(row.id, output.clone())
            .await
            .map_err(store_err)?;

        self.node_outputs.insert(node.id.clone(), output);
        scope.executed.insert(node.id.clone());
        Ok(LoopEnd::Done)
    }

    async fn record_accumulator_failure(
        &mut self,
        node: &NodeDef,
        scope: &Scope,
        input: &Value,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        let row = self
            .engine
            .store
            .insert_node_execution(NewNodeExecution {
                execution_id: self.execution_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                input: Some(input.clone()),
                parent_loop_node_id: scope.parent_loop.clone(),
            })
            .await
            .map_err(store_err)?;
        self.engine
            .store
            .fail_node_execution(row.id, &error.to_string())
            .await
            .map_err(store_err)
    }

    fn sub_traverse_boxed<'s>(
        &'s mut self,
        roots: Vec<String>,
        iteration_input: Value,
        parent_loop: String,
    ) -> Pin<Box<dyn Future<Output = Result<SubOutcome, EngineError>> + Send + 's>> {
        Box::pin(self.sub_traverse(roots, iteration_input, parent_loop))
    }

    /// One loop-body pass: a fresh executed set (iterations re-run every
    /// body node) sharing the global node-output map, with feedback edges
    /// into the parent loop refused.
    async fn sub_traverse(
        &mut self,
        roots: Vec<String>,
        iteration_input: Value,
        parent_loop: String,
    ) -> Result<SubOutcome, EngineError> {
        let mut scope = Scope {
            executed: HashSet::new(),
            parent_loop: Some(parent_loop.clone()),
            default_input: iteration_input.clone(),
        };
        let mut queue: VecDeque<String> = roots.into_iter().collect();
        let mut last_output = iteration_input;

        while let Some(current_id) = queue.pop_front() {
            if current_id == parent_loop || scope.executed.contains(&current_id) {
                continue;
            }
            self.check_limits()?;

            let node = self
                .def
                .node(&current_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Definition(DefinitionError::DanglingEdge(current_id.clone()))
                })?;
            self.nodes_executed += 1;

            match self.dispatch(&node, &mut queue, &mut scope).await? {
                StepOutcome::Suspended => return Ok(SubOutcome::Suspended),
                StepOutcome::Continue => {
                    if let Some(output) = self.node_outputs.get(&node.id) {
                        last_output = output.clone();
                    }
                }
            }
        }

        // Prefer the feedback edge's source as the iteration result.
        let feedback = self
            .def
            .incoming(&parent_loop)
            .find(|e| scope.executed.contains(&e.source))
            .and_then(|e| self.node_outputs.get(&e.source).cloned());
        Ok(SubOutcome::Completed(feedback.unwrap_or(last_output)))
    }
}
