//! Executor registry: node-type string to executor plus classification.
//!
//! Read-only after process wiring; the lock exists so embedders can register
//! their side-effect adapters after construction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flowstone_core::definition::{
    END_NODE_TYPE, LOOP_ACCUMULATOR_NODE_TYPE, LOOP_NODE_TYPE, START_NODE_TYPE,
};

use crate::executor::{Executor, NodeClass};
use crate::nodes::{BranchExecutor, LoopSourceExecutor, PassthroughExecutor, SleepExecutor, TransformExecutor};

struct Entry {
    class: NodeClass,
    executor: Arc<dyn Executor>,
}

/// Registry of node-type executors.
pub struct ExecutorRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ExecutorRegistry {
    /// Empty registry (tests wire their own types).
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the built-in node types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(START_NODE_TYPE, NodeClass::Skippable, Arc::new(PassthroughExecutor));
        registry.register(END_NODE_TYPE, NodeClass::Skippable, Arc::new(PassthroughExecutor));
        registry.register("transform", NodeClass::Synchronous, Arc::new(TransformExecutor));
        registry.register("branch", NodeClass::Synchronous, Arc::new(BranchExecutor));
        registry.register("sleep", NodeClass::Synchronous, Arc::new(SleepExecutor));
        registry.register(LOOP_NODE_TYPE, NodeClass::Synchronous, Arc::new(LoopSourceExecutor));
        registry.register(
            LOOP_ACCUMULATOR_NODE_TYPE,
            NodeClass::Synchronous,
            Arc::new(LoopSourceExecutor),
        );
        registry
    }

    /// Register (or replace) a node type.
    pub fn register(&self, node_type: &str, class: NodeClass, executor: Arc<dyn Executor>) {
        self.entries
            .write()
            .insert(node_type.to_string(), Entry { class, executor });
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.read().contains_key(node_type)
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Executor>> {
        self.entries
            .read()
            .get(node_type)
            .map(|e| Arc::clone(&e.executor))
    }

    pub fn class_of(&self, node_type: &str) -> Option<NodeClass> {
        self.entries.read().get(node_type).map(|e| e.class)
    }

    /// Registered type names, for definition validation.
    pub fn known_types(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
