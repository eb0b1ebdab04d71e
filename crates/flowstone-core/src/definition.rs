//! Workflow definition format and validation.
//!
//! Definitions travel as JSON (`definition_json` on a workflow version):
//!
//! ```json
//! {
//!   "nodes": [ { "id": "n1", "type": "transform",
//!                "data": { "config": { "path": "$.x" } } } ],
//!   "edges": [ { "source": "start", "target": "n1",
//!                "sourceHandle": "output", "condition": "input.n > 10" } ]
//! }
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Node type name for the unique entry node.
pub const START_NODE_TYPE: &str = "start";
/// Node type name for terminal nodes.
pub const END_NODE_TYPE: &str = "end";
/// Node type name for iteration-only loops.
pub const LOOP_NODE_TYPE: &str = "loop";
/// Node type name for feedback loops with accumulation.
pub const LOOP_ACCUMULATOR_NODE_TYPE: &str = "loop-accumulator";

/// Source handle carrying a loop-accumulator's final output onward.
pub const OUTPUT_HANDLE: &str = "output";
/// Source handle feeding a loop-accumulator's body.
pub const LOOP_OUTPUT_HANDLE: &str = "loop-output";

/// start/end markers carry no work of their own; failure reconciliation
/// ignores them when deciding whether anything meaningful succeeded.
pub fn is_marker_type(node_type: &str) -> bool {
    node_type == START_NODE_TYPE || node_type == END_NODE_TYPE
}

/// Validation failures, surfaced synchronously on create/update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition is not valid JSON: {0}")]
    Malformed(String),

    #[error("definition must contain exactly one start node, found {0}")]
    StartNodeCount(usize),

    #[error("definition must contain at least one end node")]
    MissingEndNode,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("unknown node type '{node_type}' on node {node_id}")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("edge references missing node: {0}")]
    DanglingEdge(String),
}

/// One node of the directed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: NodeData,
}

/// Node payload; `config` is the type-specific configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One directed edge, optionally conditional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub source: String,
    pub target: String,
    #[serde(rename = "sourceHandle", default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A parsed workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl WorkflowDefinition {
    /// Parse a `definition_json` string.
    pub fn parse(definition_json: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(definition_json)
            .map_err(|e| DefinitionError::Malformed(e.to_string()))
    }

    /// Parse from an already-deserialized JSON document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DefinitionError> {
        serde_json::from_value(value).map_err(|e| DefinitionError::Malformed(e.to_string()))
    }

    /// Validate graph shape and node types.
    ///
    /// `type_exists` answers whether the executor registry knows a type.
    pub fn validate<F>(&self, type_exists: F) -> Result<(), DefinitionError>
    where
        F: Fn(&str) -> bool,
    {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateNodeId(node.id.clone()));
            }
            if !type_exists(&node.node_type) {
                return Err(DefinitionError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| n.node_type == START_NODE_TYPE)
            .count();
        if starts != 1 {
            return Err(DefinitionError::StartNodeCount(starts));
        }
        if !self.nodes.iter().any(|n| n.node_type == END_NODE_TYPE) {
            return Err(DefinitionError::MissingEndNode);
        }

        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                return Err(DefinitionError::DanglingEdge(edge.source.clone()));
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(DefinitionError::DanglingEdge(edge.target.clone()));
            }
        }

        Ok(())
    }

    /// The unique start node, if the definition is well-formed.
    pub fn start_node(&self) -> Option<&NodeDef> {
        let mut iter = self.nodes.iter().filter(|n| n.node_type == START_NODE_TYPE);
        let first = iter.next()?;
        if iter.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Node lookup keyed by id.
    pub fn node_map(&self) -> HashMap<&str, &NodeDef> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in definition order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Incoming edges of a node, in definition order.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.target == node_id)
    }
}
