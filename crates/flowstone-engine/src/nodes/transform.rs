//! JSONPath extraction node.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_json_path::JsonPath;

use crate::executor::{ExecutionContext, ExecutionResult, Executor, ExecutorError};

#[derive(Debug, Deserialize)]
struct TransformConfig {
    /// JSONPath over the node input, e.g. `$.user.email`.
    path: String,
    /// Value to emit when the path matches nothing.
    #[serde(default)]
    default: Option<Value>,
}

/// Extracts a value from the input via JSONPath and emits `{"data": <value>}`.
///
/// A single match emits the value itself, multiple matches emit an array,
/// no match emits the configured default (or null).
pub struct TransformExecutor;

#[async_trait]
impl Executor for TransformExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config: TransformConfig = serde_json::from_value(ctx.node_config.clone())
            .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;
        let path = JsonPath::parse(&config.path)
            .map_err(|e| ExecutorError::InvalidConfig(format!("bad JSONPath: {e}")))?;

        let matches: Vec<&Value> = path.query(&ctx.input).all();
        let data = match matches.len() {
            0 => config.default.unwrap_or(Value::Null),
            1 => matches[0].clone(),
            _ => Value::Array(matches.into_iter().cloned().collect()),
        };

        Ok(ExecutionResult::ok(json!({ "data": data })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(config: Value, input: Value) -> ExecutionContext {
        ExecutionContext {
            node_id: "t".into(),
            node_config: config,
            input,
            workflow_data: json!({}),
            execution_id: Uuid::now_v7(),
            account_id: Uuid::now_v7(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn extracts_single_value() {
        let result = TransformExecutor
            .execute(ctx(json!({"path": "$.x"}), json!({"x": 7, "y": 9})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, json!({"data": 7}));
    }

    #[tokio::test]
    async fn multiple_matches_become_an_array() {
        let result = TransformExecutor
            .execute(ctx(
                json!({"path": "$.items[*].id"}),
                json!({"items": [{"id": 1}, {"id": 2}]}),
            ))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"data": [1, 2]}));
    }

    #[tokio::test]
    async fn missing_path_yields_default() {
        let result = TransformExecutor
            .execute(ctx(json!({"path": "$.nope"}), json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"data": null}));

        let result = TransformExecutor
            .execute(ctx(
                json!({"path": "$.nope", "default": "fallback"}),
                json!({"x": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"data": "fallback"}));
    }

    #[tokio::test]
    async fn invalid_path_is_a_config_error() {
        let err = TransformExecutor
            .execute(ctx(json!({"path": "$["}), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidConfig(_)));
    }
}
