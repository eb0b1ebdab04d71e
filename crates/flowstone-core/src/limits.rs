//! Abuse-prevention limits checked at every node-start boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard limits for a single workflow execution.
///
/// The wall-clock budget is measured from the original `started_at` of the
/// execution, so resumed attempts share it with earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum wall-clock duration of the execution across all attempts.
    #[serde(with = "duration_millis")]
    pub max_duration: Duration,

    /// Maximum number of node executions, loop iterations included.
    pub max_node_executions: u32,

    /// Maximum nested loop depth.
    pub max_loop_depth: u32,

    /// Maximum iterations of a single loop.
    pub max_loop_iterations: u32,

    /// Maximum serialized size of a node input or output, in bytes.
    pub max_data_bytes: usize,

    /// Maximum serialized size of a loop accumulator, in bytes.
    pub max_accumulator_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30 * 60),
            max_node_executions: 10_000,
            max_loop_depth: 5,
            max_loop_iterations: 10_000,
            max_data_bytes: 10 * 1024 * 1024,
            max_accumulator_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ExecutionLimits {
    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }

    pub fn with_max_node_executions(mut self, max: u32) -> Self {
        self.max_node_executions = max;
        self
    }

    pub fn with_max_loop_depth(mut self, max: u32) -> Self {
        self.max_loop_depth = max;
        self
    }

    pub fn with_max_loop_iterations(mut self, max: u32) -> Self {
        self.max_loop_iterations = max;
        self
    }

    pub fn with_max_data_bytes(mut self, max: usize) -> Self {
        self.max_data_bytes = max;
        self
    }

    pub fn with_max_accumulator_bytes(mut self, max: usize) -> Self {
        self.max_accumulator_bytes = max;
        self
    }

    /// Serialized size of a JSON value, as counted against the data limits.
    pub fn serialized_size(value: &serde_json::Value) -> usize {
        // Size is defined over the compact serialization, matching what is
        // stored in the node_executions table.
        serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
