//! Timed suspension node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::executor::{ExecutionContext, ExecutionResult, Executor, ExecutorError};

#[derive(Debug, Deserialize)]
struct SleepConfig {
    /// Relative sleep duration.
    #[serde(default)]
    duration_ms: Option<u64>,
    /// Absolute wake time; takes precedence over `duration_ms`.
    #[serde(default)]
    wake_up_at: Option<DateTime<Utc>>,
}

/// Signals suspension via the sleep side-channel.
///
/// The executor only computes the wake time; the engine owns the sleeping
/// transition and treats a wake time in the past as an immediate success.
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config: SleepConfig = serde_json::from_value(ctx.node_config.clone())
            .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;

        let wake_up_at = match (config.wake_up_at, config.duration_ms) {
            (Some(at), _) => at,
            (None, Some(ms)) => Utc::now() + chrono::Duration::milliseconds(ms as i64),
            (None, None) => {
                return Err(ExecutorError::InvalidConfig(
                    "sleep requires duration_ms or wake_up_at".into(),
                ));
            }
        };

        Ok(ExecutionResult::sleep(
            json!({ "wake_up_at": wake_up_at }),
            wake_up_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use uuid::Uuid;

    fn ctx(config: Value) -> ExecutionContext {
        ExecutionContext {
            node_id: "s".into(),
            node_config: config,
            input: Value::Null,
            workflow_data: json!({}),
            execution_id: Uuid::now_v7(),
            account_id: Uuid::now_v7(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn duration_computes_future_wake_time() {
        let before = Utc::now();
        let result = SleepExecutor
            .execute(ctx(json!({"duration_ms": 60_000})))
            .await
            .unwrap();
        assert!(result.needs_sleep);
        let wake = result.wake_up_at.unwrap();
        assert!(wake >= before + chrono::Duration::seconds(59));
    }

    #[tokio::test]
    async fn absolute_wake_time_wins() {
        let at = Utc::now() + chrono::Duration::hours(2);
        let result = SleepExecutor
            .execute(ctx(json!({"duration_ms": 1, "wake_up_at": at})))
            .await
            .unwrap();
        assert_eq!(result.wake_up_at, Some(at));
    }

    #[tokio::test]
    async fn missing_config_is_rejected() {
        let err = SleepExecutor.execute(ctx(json!({}))).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidConfig(_)));
    }
}
