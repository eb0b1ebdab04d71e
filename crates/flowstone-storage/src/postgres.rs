//! PostgreSQL implementation of `WorkflowStore`.
//!
//! Uses a connection pool, raw SQL with positional binds, and
//! `FOR UPDATE SKIP LOCKED` for queue claiming. Multi-row transactions touch
//! tables in a fixed order (executions, node_executions, outbox_messages,
//! sleep_schedules) to avoid lock cycles between workers.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use flowstone_core::{ExecutionStatus, TriggerType};

use crate::models::*;
use crate::store::*;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_status<T>(s: String) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    T::from_str(&s).map_err(StoreError::Serialization)
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowRow, StoreError> {
    Ok(WorkflowRow {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        current_version: row.get("current_version"),
        is_active: row.get("is_active"),
        cron_expr: row.get("cron_expr"),
        timezone: row.get("timezone"),
        webhook_path: row.get("webhook_path"),
        webhook_secret_hash: row.get("webhook_secret_hash"),
        webhook_require_auth: row.get("webhook_require_auth"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn version_from_row(row: &PgRow) -> Result<WorkflowVersionRow, StoreError> {
    Ok(WorkflowVersionRow {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        definition: row.get("definition"),
        change_log: row.get("change_log"),
        created_at: row.get("created_at"),
    })
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecutionRow, StoreError> {
    Ok(WorkflowExecutionRow {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        status: parse_status(row.get::<String, _>("status"))?,
        trigger_type: parse_status(row.get::<String, _>("trigger_type"))?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn node_execution_from_row(row: &PgRow) -> Result<NodeExecutionRow, StoreError> {
    Ok(NodeExecutionRow {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        status: parse_status(row.get::<String, _>("status"))?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        parent_loop_node_id: row.get("parent_loop_node_id"),
        idempotency_key: row.get("idempotency_key"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessageRow, StoreError> {
    Ok(OutboxMessageRow {
        id: row.get("id"),
        node_execution_id: row.get("node_execution_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        status: parse_status(row.get::<String, _>("status"))?,
        idempotency_key: row.get("idempotency_key"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        next_retry_at: row.get("next_retry_at"),
        last_attempt_at: row.get("last_attempt_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    })
}

fn schedule_from_row(row: &PgRow) -> Result<SleepScheduleRow, StoreError> {
    Ok(SleepScheduleRow {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        workflow_id: row.get("workflow_id"),
        node_id: row.get("node_id"),
        wake_up_at: row.get("wake_up_at"),
        created_at: row.get("created_at"),
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRow, StoreError> {
    Ok(JobRow {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        execution_id: row.get("execution_id"),
        input_json: row.get("input_json"),
        trigger_type: parse_status(row.get::<String, _>("trigger_type"))?,
        status: parse_status(row.get::<String, _>("status"))?,
        attempts: row.get("attempts"),
        visible_at: row.get("visible_at"),
        claimed_by: row.get("claimed_by"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

const JOB_COLUMNS: &str = "id, workflow_id, execution_id, input_json, trigger_type, status, \
                           attempts, visible_at, claimed_by, last_error, created_at";
const MESSAGE_COLUMNS: &str = "id, node_execution_id, event_type, payload, status, \
                               idempotency_key, attempts, max_attempts, next_retry_at, \
                               last_attempt_at, last_error, created_at, processed_at";
const NODE_COLUMNS: &str = "id, execution_id, node_id, node_type, status, input, output, \
                            error, parent_loop_node_id, idempotency_key, started_at, \
                            completed_at";
const EXECUTION_COLUMNS: &str = "id, workflow_id, version, status, trigger_type, input, \
                                 output, error, started_at, completed_at";

/// Insert a job for an execution inside an open transaction.
async fn insert_job_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workflow_id: Uuid,
    execution_id: Uuid,
    input: Option<&serde_json::Value>,
    trigger: TriggerType,
) -> Result<JobRow, StoreError> {
    let input_json = input.map(|v| v.to_string()).unwrap_or_else(|| "null".into());
    let row = sqlx::query(&format!(
        "INSERT INTO jobs (id, workflow_id, execution_id, input_json, trigger_type) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {JOB_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(workflow_id)
    .bind(execution_id)
    .bind(input_json)
    .bind(trigger.to_string())
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;
    job_from_row(&row)
}

/// Count of open (pending/processing) outbox messages for an execution,
/// inside an open transaction.
async fn open_message_count_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: Uuid,
) -> Result<i64, StoreError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS open FROM outbox_messages m \
         JOIN workflow_node_executions n ON n.id = m.node_execution_id \
         WHERE n.execution_id = $1 AND m.status IN ('pending', 'processing')",
    )
    .bind(execution_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(row.get("open"))
}

/// Execution-failure reconciliation, inside an open
/// transaction. Returns the status it decided, if any row changed.
async fn reconcile_failed_execution_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: Uuid,
) -> Result<Option<ExecutionStatus>, StoreError> {
    if open_message_count_tx(tx, execution_id).await? > 0 {
        return Ok(None);
    }

    let row = sqlx::query("SELECT status FROM workflow_executions WHERE id = $1 FOR UPDATE")
        .bind(execution_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;
    let status: ExecutionStatus = parse_status(row.get::<String, _>("status"))?;
    if status.is_terminal() {
        return Ok(None);
    }

    // Marker nodes (start/end) do not count as meaningful successes.
    let counts = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE status = 'error') AS failed, \
                COUNT(*) FILTER (WHERE status = 'success' \
                                   AND node_type NOT IN ('start', 'end')) AS success \
         FROM workflow_node_executions WHERE execution_id = $1",
    )
    .bind(execution_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;
    let total: i64 = counts.get("total");
    let failed: i64 = counts.get("failed");
    let success: i64 = counts.get("success");

    let new_status = if failed > 0 && success > 0 {
        ExecutionStatus::PartiallyFailed
    } else if failed > 0 {
        ExecutionStatus::Error
    } else {
        return Ok(None);
    };

    sqlx::query(
        "UPDATE workflow_executions \
         SET status = $2, error = $3, completed_at = NOW() WHERE id = $1",
    )
    .bind(execution_id)
    .bind(new_status.to_string())
    .bind(format!("{failed} out of {total} nodes failed"))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(Some(new_status))
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    #[instrument(skip(self, new))]
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query(
            "INSERT INTO workflows \
             (id, account_id, name, cron_expr, timezone, webhook_path, webhook_secret_hash, \
              webhook_require_auth) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(new.account_id)
        .bind(&new.name)
        .bind(&new.cron_expr)
        .bind(&new.timezone)
        .bind(&new.webhook_path)
        .bind(&new.webhook_secret_hash)
        .bind(new.webhook_require_auth)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        workflow_from_row(&row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        // Foreign keys cascade everything except outbox messages, whose
        // orphans recovery reconciles.
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflows SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    async fn update_cron(
        &self,
        id: Uuid,
        cron_expr: Option<String>,
        timezone: String,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflows SET cron_expr = $2, timezone = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&cron_expr)
        .bind(&timezone)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE cron_expr IS NOT NULL AND cron_expr <> ''",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, definition, change_log))]
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
        change_log: Option<String>,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE workflows SET current_version = current_version + 1, updated_at = NOW() \
             WHERE id = $1 RETURNING current_version",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let version: i32 = row.get("current_version");

        let row = sqlx::query(
            "INSERT INTO workflow_versions (id, workflow_id, version, definition, change_log) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(version)
        .bind(&definition)
        .bind(&change_log)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let version_row = version_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%workflow_id, version, "created workflow version");
        Ok(version_row)
    }

    async fn latest_version(&self, workflow_id: Uuid) -> Result<WorkflowVersionRow, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = $1 \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::VersionNotFound {
            workflow_id,
            version: 0,
        })?;
        version_from_row(&row)
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = $1 AND version = $2",
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::VersionNotFound {
            workflow_id,
            version,
        })?;
        version_from_row(&row)
    }

    #[instrument(skip(self, input))]
    async fn create_execution_with_job(
        &self,
        workflow_id: Uuid,
        input: Option<serde_json::Value>,
        trigger: TriggerType,
    ) -> Result<(WorkflowExecutionRow, JobRow), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT current_version FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let version: i32 = row.get("current_version");

        let row = sqlx::query(&format!(
            "INSERT INTO workflow_executions (id, workflow_id, version, status, trigger_type, input) \
             VALUES ($1, $2, $3, 'queued', $4, $5) RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(version)
        .bind(trigger.to_string())
        .bind(&input)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let execution = execution_from_row(&row)?;

        let job = insert_job_tx(&mut tx, workflow_id, execution.id, input.as_ref(), trigger).await?;

        tx.commit().await.map_err(db_err)?;
        debug!(execution_id = %execution.id, %workflow_id, %trigger, "created execution");
        Ok((execution, job))
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;
        execution_from_row(&row)
    }

    async fn mark_execution_running(&self, id: Uuid) -> Result<(), StoreError> {
        // Error is re-openable via resume; the other terminal states are
        // final (a racing cancel must not be resurrected).
        let result = sqlx::query(
            "UPDATE workflow_executions SET status = 'running', completed_at = NULL \
             WHERE id = $1 AND status NOT IN ('success', 'partially_failed', 'cancelled')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM workflow_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .is_some();
            return Err(if exists {
                StoreError::InvalidState(format!("cannot run execution {id}: already final"))
            } else {
                StoreError::ExecutionNotFound(id)
            });
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        // No-op when already terminal, so racing completion checks commute.
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET status = $2, \
                 output = COALESCE($3, output), \
                 error = COALESCE($4, error), \
                 completed_at = CASE WHEN $5 THEN NOW() ELSE NULL END \
             WHERE id = $1 \
               AND status NOT IN ('success', 'error', 'partially_failed', 'cancelled')",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(&output)
        .bind(&error)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn interrupt_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'interrupted', error = $2, completed_at = NULL \
             WHERE id = $1 \
               AND status NOT IN ('success', 'error', 'partially_failed', 'cancelled')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_execution_output(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workflow_executions SET output = $2 WHERE id = $1")
            .bind(id)
            .bind(&output)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(())
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET status = 'cancelled', completed_at = NOW() \
             WHERE id = $1 AND status IN ('running', 'queued')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM workflow_node_executions \
             WHERE execution_id = $1 ORDER BY started_at, id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(node_execution_from_row).collect()
    }

    async fn successful_checkpoints(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM workflow_node_executions \
             WHERE execution_id = $1 AND status = 'success' AND parent_loop_node_id IS NULL \
             ORDER BY started_at, id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(node_execution_from_row).collect()
    }

    async fn insert_node_execution(
        &self,
        new: NewNodeExecution,
    ) -> Result<NodeExecutionRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO workflow_node_executions \
             (id, execution_id, node_id, node_type, status, input, parent_loop_node_id) \
             VALUES ($1, $2, $3, $4, 'running', $5, $6) RETURNING {NODE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(new.execution_id)
        .bind(&new.node_id)
        .bind(&new.node_type)
        .bind(&new.input)
        .bind(&new.parent_loop_node_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        node_execution_from_row(&row)
    }

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'success', output = $2, completed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&output)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NodeExecutionNotFound(id));
        }
        Ok(())
    }

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'error', error = $2, completed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NodeExecutionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, output))]
    async fn suspend_execution(
        &self,
        execution_id: Uuid,
        node_execution_id: Uuid,
        output: serde_json::Value,
        wake_up_at: DateTime<Utc>,
    ) -> Result<SleepScheduleRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE workflow_executions SET status = 'sleeping' \
             WHERE id = $1 AND status = 'running' RETURNING workflow_id",
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::InvalidState(format!(
                "cannot suspend execution {execution_id}: not running"
            ))
        })?;
        let workflow_id: Uuid = row.get("workflow_id");

        let row = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'success', output = $2, completed_at = NOW() \
             WHERE id = $1 RETURNING node_id",
        )
        .bind(node_execution_id)
        .bind(&output)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
        let node_id: String = row.get("node_id");

        let row = sqlx::query(
            "INSERT INTO sleep_schedules (id, execution_id, workflow_id, node_id, wake_up_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(workflow_id)
        .bind(&node_id)
        .bind(wake_up_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let schedule = schedule_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%execution_id, %node_id, %wake_up_at, "execution suspended");
        Ok(schedule)
    }

    async fn due_sleep_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SleepScheduleRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sleep_schedules WHERE wake_up_at <= $1 \
             ORDER BY wake_up_at LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn wake_execution(&self, schedule_id: Uuid) -> Result<Option<JobRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let Some(row) = sqlx::query(
            "DELETE FROM sleep_schedules WHERE id = $1 \
             RETURNING execution_id, workflow_id",
        )
        .bind(schedule_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        else {
            // Another process already fired this wake-up.
            return Ok(None);
        };
        let execution_id: Uuid = row.get("execution_id");
        let workflow_id: Uuid = row.get("workflow_id");

        let updated = sqlx::query(
            "UPDATE workflow_executions SET status = 'running' \
             WHERE id = $1 AND status = 'sleeping' RETURNING input",
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = updated else {
            // Execution moved on (cancelled, resumed elsewhere); drop the
            // schedule without re-queueing.
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let input: Option<serde_json::Value> = row.get("input");

        let job = insert_job_tx(
            &mut tx,
            workflow_id,
            execution_id,
            input.as_ref(),
            TriggerType::ResumeFromSleep,
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        debug!(%execution_id, "execution woken from sleep");
        Ok(Some(job))
    }

    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        trigger: TriggerType,
    ) -> Result<JobRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT workflow_id, input FROM workflow_executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        let workflow_id: Uuid = row.get("workflow_id");
        let input: Option<serde_json::Value> = row.get("input");

        let job = insert_job_tx(&mut tx, workflow_id, execution_id, input.as_ref(), trigger).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn dequeue_jobs(
        &self,
        worker_id: &str,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<JobRow>, StoreError> {
        let invisible_until = Utc::now()
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let rows = sqlx::query(&format!(
            "WITH claimable AS ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND visible_at <= NOW() \
                 ORDER BY created_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs j \
             SET status = 'claimed', claimed_by = $2, attempts = j.attempts + 1, \
                 visible_at = $3 \
             FROM claimable c WHERE j.id = c.id \
             RETURNING {}",
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit as i64)
        .bind(worker_id)
        .bind(invisible_until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        if !rows.is_empty() {
            debug!(worker_id, count = rows.len(), "claimed jobs");
        }
        rows.iter().map(job_from_row).collect()
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = 'completed' WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = $2 WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn release_expired_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', claimed_by = NULL, visible_at = $1 \
             WHERE status = 'claimed' AND visible_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, req), fields(execution_id = %req.execution_id, node_id = %req.node_id))]
    async fn create_node_with_outbox(
        &self,
        req: OutboxEnqueue,
    ) -> Result<(NodeExecutionRow, OutboxMessageRow), StoreError> {
        let idempotency_key =
            format!("{}-{}-{}", req.execution_id, req.node_id, Uuid::now_v7());
        let max_retries = req
            .config
            .get("maxRetries")
            .and_then(|v| v.as_i64())
            .unwrap_or(3)
            .clamp(0, 10) as i32;

        let payload = serde_json::json!({
            "node_id": req.node_id,
            "node_config": req.config,
            "input": req.input,
            "workflow_data": req.workflow_data,
            "execution_id": req.execution_id,
            "account_id": req.account_id,
        });

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            "INSERT INTO workflow_node_executions \
             (id, execution_id, node_id, node_type, status, input, parent_loop_node_id, \
              idempotency_key) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7) RETURNING {NODE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(req.execution_id)
        .bind(&req.node_id)
        .bind(&req.node_type)
        .bind(&req.input)
        .bind(&req.parent_loop_node_id)
        .bind(&idempotency_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let node = node_execution_from_row(&row)?;

        let row = sqlx::query(&format!(
            "INSERT INTO outbox_messages \
             (id, node_execution_id, event_type, payload, status, idempotency_key, \
              attempts, max_attempts, next_retry_at) \
             VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6, NOW()) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(node.id)
        .bind(&req.event_type)
        .bind(&payload)
        .bind(&idempotency_key)
        .bind(max_retries + 1)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let message = message_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        debug!(message_id = %message.id, "enqueued outbox message");
        Ok((node, message))
    }

    async fn fetch_ready_messages(&self, limit: usize) -> Result<Vec<ReadyMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages \
             WHERE status = 'pending' AND next_retry_at <= NOW() \
             ORDER BY created_at LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let message = message_from_row(&row)?;
            let node_row = sqlx::query(&format!(
                "SELECT {NODE_COLUMNS} FROM workflow_node_executions WHERE id = $1"
            ))
            .bind(message.node_execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            // Orphans are skipped here; recovery dead-letters them.
            let Some(node_row) = node_row else {
                continue;
            };
            out.push(ReadyMessage {
                message,
                node_execution: node_execution_from_row(&node_row)?,
            });
        }
        Ok(out)
    }

    async fn mark_message_processing(&self, message_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'processing', attempts = attempts + 1, last_attempt_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, output))]
    async fn complete_message(
        &self,
        message_id: Uuid,
        output: serde_json::Value,
    ) -> Result<Option<ExecutionStatus>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let Some(row) = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'completed', processed_at = NOW(), next_retry_at = NULL \
             WHERE id = $1 AND status = 'processing' RETURNING node_execution_id",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        else {
            // Cancelled (or otherwise moved) while the worker ran it.
            return Ok(None);
        };
        let node_execution_id: Uuid = row.get("node_execution_id");

        let row = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'success', output = $2, completed_at = NOW() \
             WHERE id = $1 RETURNING execution_id",
        )
        .bind(node_execution_id)
        .bind(&output)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
        let execution_id: Uuid = row.get("execution_id");

        // Execution-completion check: the last open message finishing a
        // still-running execution completes it.
        let mut decided = None;
        if open_message_count_tx(&mut tx, execution_id).await? == 0 {
            let result = sqlx::query(
                "UPDATE workflow_executions \
                 SET status = 'success', completed_at = NOW() \
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if result.rows_affected() > 0 {
                decided = Some(ExecutionStatus::Success);
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(decided)
    }

    #[instrument(skip(self, error))]
    async fn fail_message(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<OutboxFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "SELECT attempts, max_attempts, node_execution_id FROM outbox_messages \
             WHERE id = $1 AND status = 'processing' FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::InvalidState(format!("cannot fail message {message_id}: not processing"))
        })?;
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let node_execution_id: Uuid = row.get("node_execution_id");

        if attempts < max_attempts {
            let next_retry_at = Utc::now() + retry_backoff(attempts);
            sqlx::query(
                "UPDATE outbox_messages \
                 SET status = 'pending', next_retry_at = $2, last_error = $3 WHERE id = $1",
            )
            .bind(message_id)
            .bind(next_retry_at)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            debug!(%message_id, attempts, %next_retry_at, "message scheduled for retry");
            return Ok(OutboxFailureOutcome::WillRetry {
                attempt: attempts,
                next_retry_at,
            });
        }

        sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'dead_letter', next_retry_at = NULL, last_error = $2 WHERE id = $1",
        )
        .bind(message_id)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'error', error = $2, completed_at = NOW() \
             WHERE id = $1 RETURNING execution_id",
        )
        .bind(node_execution_id)
        .bind(format!("Failed after {attempts} attempts: {error}"))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NodeExecutionNotFound(node_execution_id))?;
        let execution_id: Uuid = row.get("execution_id");

        let execution_status = reconcile_failed_execution_tx(&mut tx, execution_id).await?;

        tx.commit().await.map_err(db_err)?;
        error!(%message_id, attempts, "message dead-lettered");
        Ok(OutboxFailureOutcome::DeadLettered { execution_status })
    }

    #[instrument(skip(self))]
    async fn cancel_pending_messages(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "UPDATE outbox_messages m \
             SET status = 'cancelled', next_retry_at = NULL \
             FROM workflow_node_executions n \
             WHERE n.id = m.node_execution_id AND n.execution_id = $1 \
               AND m.status IN ('pending', 'processing') \
             RETURNING m.node_execution_id",
        )
        .bind(execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let node_execution_id: Uuid = row.get("node_execution_id");
            sqlx::query(
                "UPDATE workflow_node_executions \
                 SET status = 'cancelled', completed_at = NOW() WHERE id = $1",
            )
            .bind(node_execution_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn retry_dead_letter(&self, message_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'pending', attempts = 0, next_retry_at = NOW(), \
                 last_error = NULL, last_attempt_at = NULL \
             WHERE id = $1 AND status = 'dead_letter'",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState(format!(
                "cannot retry message {message_id}: not dead-lettered"
            )));
        }
        Ok(())
    }

    async fn count_open_messages(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS open FROM outbox_messages m \
             JOIN workflow_node_executions n ON n.id = m.node_execution_id \
             WHERE n.execution_id = $1 AND m.status IN ('pending', 'processing')",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get::<i64, _>("open") as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessageRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages \
             WHERE status = 'dead_letter' ORDER BY created_at LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecutionRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE status = $1 ORDER BY started_at"
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn execution_recovery_stats(
        &self,
        execution_id: Uuid,
    ) -> Result<RecoveryStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = 'error') AS failed, \
                    COUNT(*) FILTER (WHERE status = 'success' \
                                       AND node_type NOT IN ('start', 'end')) AS success, \
                    COUNT(*) FILTER (WHERE status = 'running') AS stuck, \
                    COUNT(*) FILTER (WHERE status = 'success' AND node_type = 'end') \
                        AS end_success \
             FROM workflow_node_executions WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let open = self.count_open_messages(execution_id).await?;
        Ok(RecoveryStats {
            total_nodes: row.get::<i64, _>("total") as u64,
            failed_nodes: row.get::<i64, _>("failed") as u64,
            success_nodes: row.get::<i64, _>("success") as u64,
            stuck_running_nodes: row.get::<i64, _>("stuck") as u64,
            open_messages: open,
            end_node_succeeded: row.get::<i64, _>("end_success") > 0,
        })
    }

    async fn mark_stuck_nodes_failed(
        &self,
        execution_id: Uuid,
        error: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_node_executions \
             SET status = 'error', error = $2, completed_at = NOW() \
             WHERE execution_id = $1 AND status = 'running'",
        )
        .bind(execution_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn orphaned_outbox_messages(&self) -> Result<Vec<OutboxMessageRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages m \
             LEFT JOIN workflow_node_executions n ON n.id = m.node_execution_id \
             WHERE n.id IS NULL AND m.status NOT IN ('completed', 'dead_letter')",
            MESSAGE_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn dead_letter_orphan(&self, message_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'dead_letter', next_retry_at = NULL, last_error = $2 WHERE id = $1",
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(message_id));
        }
        Ok(())
    }
}
