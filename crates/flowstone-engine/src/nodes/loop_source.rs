//! Array-source resolution for loop and loop-accumulator nodes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_json_path::JsonPath;

use crate::executor::{ExecutionContext, ExecutionResult, Executor, ExecutorError};

#[derive(Debug, Deserialize)]
struct LoopSourceConfig {
    /// JSONPath selecting the array to iterate; when omitted the node input
    /// itself must be an array.
    #[serde(default)]
    items: Option<String>,
    /// Truncates the iteration to the first N elements.
    #[serde(default)]
    max_iterations: Option<usize>,
}

/// Produces `{"results": [{"index": i, "item": <element>}, ...]}`.
///
/// The engine drives the per-element sub-traversal; this executor only
/// resolves what to iterate over.
pub struct LoopSourceExecutor;

#[async_trait]
impl Executor for LoopSourceExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config: LoopSourceConfig = serde_json::from_value(ctx.node_config.clone())
            .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;

        let items: Vec<Value> = match &config.items {
            Some(path) => {
                let path = JsonPath::parse(path)
                    .map_err(|e| ExecutorError::InvalidConfig(format!("bad JSONPath: {e}")))?;
                let matches: Vec<&Value> = path.query(&ctx.input).all();
                match matches.as_slice() {
                    [single] if single.is_array() => single
                        .as_array()
                        .map(|a| a.to_vec())
                        .unwrap_or_default(),
                    _ => matches.into_iter().cloned().collect(),
                }
            }
            None => ctx
                .input
                .as_array()
                .cloned()
                .ok_or_else(|| {
                    ExecutorError::Failed(format!(
                        "loop source is not an array (node {})",
                        ctx.node_id
                    ))
                })?,
        };

        let take = config.max_iterations.unwrap_or(usize::MAX);
        let results: Vec<Value> = items
            .into_iter()
            .take(take)
            .enumerate()
            .map(|(index, item)| json!({ "index": index, "item": item }))
            .collect();

        Ok(ExecutionResult::ok(json!({ "results": results })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(config: Value, input: Value) -> ExecutionContext {
        ExecutionContext {
            node_id: "loop".into(),
            node_config: config,
            input,
            workflow_data: json!({}),
            execution_id: Uuid::now_v7(),
            account_id: Uuid::now_v7(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn resolves_array_via_jsonpath() {
        let result = LoopSourceExecutor
            .execute(ctx(
                json!({"items": "$.rows"}),
                json!({"rows": ["a", "b"]}),
            ))
            .await
            .unwrap();
        assert_eq!(
            result.output,
            json!({"results": [
                {"index": 0, "item": "a"},
                {"index": 1, "item": "b"},
            ]})
        );
    }

    #[tokio::test]
    async fn input_array_is_the_default_source() {
        let result = LoopSourceExecutor
            .execute(ctx(json!({}), json!([1, 2, 3])))
            .await
            .unwrap();
        let results = result.output["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn max_iterations_truncates() {
        let result = LoopSourceExecutor
            .execute(ctx(json!({"max_iterations": 1}), json!([1, 2, 3])))
            .await
            .unwrap();
        let results = result.output["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], json!({"index": 0, "item": 1}));
    }

    #[tokio::test]
    async fn scalar_matches_iterate_individually() {
        let result = LoopSourceExecutor
            .execute(ctx(
                json!({"items": "$.rows[*].id"}),
                json!({"rows": [{"id": 1}, {"id": 2}]}),
            ))
            .await
            .unwrap();
        let results = result.output["results"].as_array().unwrap();
        assert_eq!(results[1], json!({"index": 1, "item": 2}));
    }

    #[tokio::test]
    async fn non_array_input_without_path_fails() {
        let err = LoopSourceExecutor
            .execute(ctx(json!({}), json!({"not": "array"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(_)));
    }
}
