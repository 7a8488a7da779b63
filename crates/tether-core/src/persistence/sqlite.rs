// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are stored as unix epoch milliseconds so that ordering and range
//! comparisons happen on integers.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;

use super::{
    ChunkRecord, ListSchedulesFilter, ListWorkflowsFilter, Persistence, ScheduleRecord,
    StateHistoryRecord, StreamRecord, StreamStatus, WorkflowRecord, WorkflowStatus,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/chat/room-1.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        // One writer per instance; a small pool is plenty.
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(pool).await
    }

    /// Create a private in-memory database. Data is lost when dropped.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // Each connection to `sqlite::memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, CoreError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Access the underlying pool (tests use it to plant raw rows).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_json(text: Option<String>) -> Result<Option<Value>, CoreError> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(CoreError::from)
}

fn encode_json(value: Option<&Value>) -> Result<Option<String>, CoreError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(CoreError::from)
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct StateHistoryRow {
    id: i64,
    state: String,
    origin: Option<String>,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    callback: String,
    payload: String,
    kind: String,
    time: i64,
    delay_seconds: Option<i64>,
    cron: Option<String>,
    interval_seconds: Option<i64>,
    running: i64,
    execution_started_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<ScheduleRow> for ScheduleRecord {
    type Error = CoreError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: serde_json::from_str(&row.payload)?,
            kind: row.kind.parse()?,
            id: row.id,
            callback: row.callback,
            time: from_millis(row.time),
            delay_seconds: row.delay_seconds,
            cron: row.cron,
            interval_seconds: row.interval_seconds,
            running: row.running != 0,
            execution_started_at: row.execution_started_at.map(from_millis),
            created_at: from_millis(row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    workflow_id: String,
    binding: String,
    status: String,
    metadata: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<WorkflowRow> for WorkflowRecord {
    type Error = CoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            metadata: parse_json(row.metadata)?,
            result: parse_json(row.result)?,
            error: parse_json(row.error)?,
            id: row.id,
            workflow_id: row.workflow_id,
            binding: row.binding,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    id: String,
    request_id: String,
    status: String,
    created_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<StreamRow> for StreamRecord {
    type Error = CoreError;

    fn try_from(row: StreamRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            request_id: row.request_id,
            created_at: from_millis(row.created_at),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: String,
    stream_id: String,
    body: String,
    chunk_index: i64,
    created_at: i64,
}

impl From<ChunkRow> for ChunkRecord {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            stream_id: row.stream_id,
            body: row.body,
            chunk_index: row.chunk_index,
            created_at: from_millis(row.created_at),
        }
    }
}

const SCHEDULE_COLUMNS: &str = "id, callback, payload, kind, time, delay_seconds, cron, \
     interval_seconds, running, execution_started_at, created_at";

const WORKFLOW_COLUMNS: &str = "id, workflow_id, binding, status, metadata, result, error, \
     created_at, updated_at, completed_at";

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ---- state ----------------------------------------------------------

    async fn load_state(&self) -> Result<Option<String>, CoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM agent_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(state,)| state))
    }

    async fn save_state(&self, state: &str, origin: Option<&str>) -> Result<(), CoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agent_state (id, state, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET state = ?1, updated_at = ?2
            "#,
        )
        .bind(state)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO agent_state_history (state, origin, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(state)
        .bind(origin)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn trim_state_history(&self, keep: i64) -> Result<u64, CoreError> {
        // Ids only grow, so everything at or below max(id) - keep is older
        // than the newest `keep` rows.
        let result = sqlx::query(
            r#"
            DELETE FROM agent_state_history
            WHERE id <= (SELECT MAX(id) FROM agent_state_history) - ?
            "#,
        )
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn state_history(&self, limit: i64) -> Result<Vec<StateHistoryRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StateHistoryRow>(
            r#"
            SELECT id, state, origin, created_at
            FROM agent_state_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StateHistoryRecord {
                id: row.id,
                state: row.state,
                origin: row.origin,
                created_at: from_millis(row.created_at),
            })
            .collect())
    }

    // ---- connection attachments ----------------------------------------

    async fn load_attachment(&self, connection_id: &str) -> Result<Option<Value>, CoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT attachment FROM connection_attachments WHERE connection_id = ?",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        parse_json(row.map(|(text,)| text))
    }

    async fn save_attachment(
        &self,
        connection_id: &str,
        attachment: &Value,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO connection_attachments (connection_id, attachment, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(connection_id) DO UPDATE SET attachment = ?2, updated_at = ?3
            "#,
        )
        .bind(connection_id)
        .bind(serde_json::to_string(attachment)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_attachment(&self, connection_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM connection_attachments WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- schedules ------------------------------------------------------

    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, callback, payload, kind, time, delay_seconds, cron,
                                   interval_seconds, running, execution_started_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.callback)
        .bind(serde_json::to_string(&schedule.payload)?)
        .bind(schedule.kind.as_str())
        .bind(to_millis(schedule.time))
        .bind(schedule.delay_seconds)
        .bind(&schedule.cron)
        .bind(schedule.interval_seconds)
        .bind(schedule.running as i64)
        .bind(schedule.execution_started_at.map(to_millis))
        .bind(to_millis(schedule.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, CoreError> {
        let query = format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLUMNS);
        let row = sqlx::query_as::<_, ScheduleRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ScheduleRecord::try_from).transpose()
    }

    async fn list_schedules(
        &self,
        filter: &ListSchedulesFilter,
    ) -> Result<Vec<ScheduleRecord>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM schedules
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR time >= ?2)
              AND (?3 IS NULL OR time <= ?3)
            ORDER BY time ASC, id ASC
            "#,
            SCHEDULE_COLUMNS
        );

        let rows = sqlx::query_as::<_, ScheduleRow>(&query)
            .bind(filter.kind.map(|k| k.as_str()))
            .bind(filter.due_after.map(to_millis))
            .bind(filter.due_before.map(to_millis))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ScheduleRecord::try_from).collect()
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, CoreError> {
        let query = format!(
            "SELECT {} FROM schedules WHERE time <= ? ORDER BY time ASC, id ASC",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ScheduleRow>(&query)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ScheduleRecord::try_from).collect()
    }

    async fn claim_schedule(
        &self,
        id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET running = 1, execution_started_at = ?1
            WHERE id = ?2
              AND time <= ?1
              AND (running = 0
                   OR execution_started_at IS NULL
                   OR execution_started_at <= ?3)
            "#,
        )
        .bind(to_millis(now))
        .bind(id)
        .bind(to_millis(stale_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_schedule(
        &self,
        id: &str,
        next_time: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET running = 0,
                execution_started_at = NULL,
                time = COALESCE(?1, time)
            WHERE id = ?2
            "#,
        )
        .bind(next_time.map(to_millis))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, CoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT wake_at FROM alarm WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(ms,)| from_millis(ms)))
    }

    async fn set_alarm(&self, wake_at: Option<DateTime<Utc>>) -> Result<(), CoreError> {
        match wake_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    INSERT INTO alarm (id, wake_at) VALUES (1, ?1)
                    ON CONFLICT(id) DO UPDATE SET wake_at = ?1
                    "#,
                )
                .bind(to_millis(at))
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM alarm WHERE id = 1")
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    // ---- workflows ------------------------------------------------------

    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (id, workflow_id, binding, status, metadata, result, error,
                                   created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.binding)
        .bind(workflow.status.as_str())
        .bind(encode_json(workflow.metadata.as_ref())?)
        .bind(encode_json(workflow.result.as_ref())?)
        .bind(encode_json(workflow.error.as_ref())?)
        .bind(to_millis(workflow.created_at))
        .bind(to_millis(workflow.updated_at))
        .bind(workflow.completed_at.map(to_millis))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::DuplicateWorkflowId {
                    workflow_id: workflow.workflow_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError> {
        let query = format!(
            "SELECT {} FROM workflows WHERE workflow_id = ?",
            WORKFLOW_COLUMNS
        );
        let row = sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(WorkflowRecord::try_from).transpose()
    }

    async fn list_workflows(
        &self,
        filter: &ListWorkflowsFilter,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM workflows
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR binding = ?2)
              AND (?3 IS NULL OR created_at < ?3)
            ORDER BY created_at DESC, id DESC
            LIMIT ?4
            "#,
            WORKFLOW_COLUMNS
        );

        let rows = sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(&filter.binding)
            .bind(filter.created_before.map(to_millis))
            // SQLite treats a negative LIMIT as unbounded
            .bind(filter.limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WorkflowRecord::try_from).collect()
    }

    async fn transition_workflow(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?, updated_at = ?
            WHERE workflow_id = ?
              AND status NOT IN ('complete', 'errored')
            "#,
        )
        .bind(status.as_str())
        .bind(to_millis(Utc::now()))
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_workflow(
        &self,
        workflow_id: &str,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<bool, CoreError> {
        let status = if error.is_some() {
            WorkflowStatus::Errored
        } else {
            WorkflowStatus::Complete
        };
        let now = to_millis(Utc::now());

        let outcome = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?1, result = ?2, error = ?3, updated_at = ?4, completed_at = ?4
            WHERE workflow_id = ?5 AND status NOT IN ('complete', 'errored')
            "#,
        )
        .bind(status.as_str())
        .bind(encode_json(result)?)
        .bind(encode_json(error)?)
        .bind(now)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM workflows WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM workflow_steps WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_workflows(&self, filter: &ListWorkflowsFilter) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM workflow_steps
            WHERE workflow_id IN (
                SELECT workflow_id FROM workflows
                WHERE (?1 IS NULL OR status = ?1)
                  AND (?2 IS NULL OR binding = ?2)
                  AND (?3 IS NULL OR created_at < ?3)
            )
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.binding)
        .bind(filter.created_before.map(to_millis))
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM workflows
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR binding = ?2)
              AND (?3 IS NULL OR created_at < ?3)
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.binding)
        .bind(filter.created_before.map(to_millis))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn migrate_workflow_binding(&self, old: &str, new: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET binding = ?, updated_at = ?
            WHERE binding = ?
            "#,
        )
        .bind(new)
        .bind(to_millis(Utc::now()))
        .bind(old)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn load_step(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, CoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT result FROM workflow_steps WHERE workflow_id = ? AND step_name = ?",
        )
        .bind(workflow_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        parse_json(row.map(|(text,)| text))
    }

    async fn save_step(
        &self,
        workflow_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), CoreError> {
        // First write wins; a retried step never replaces the cached result.
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (workflow_id, step_name, result, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workflow_id, step_name) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(step_name)
        .bind(serde_json::to_string(result)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- streams --------------------------------------------------------

    async fn insert_stream(&self, stream: &StreamRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO stream_metadata (id, request_id, status, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stream.id)
        .bind(&stream.request_id)
        .bind(stream.status.as_str())
        .bind(to_millis(stream.created_at))
        .bind(stream.completed_at.map(to_millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), CoreError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO stream_chunks (id, stream_id, body, chunk_index, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.stream_id)
            .bind(&chunk.body)
            .bind(chunk.chunk_index)
            .bind(to_millis(chunk.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn finish_stream(
        &self,
        stream_id: &str,
        status: StreamStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE stream_metadata
            SET status = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(to_millis(completed_at))
        .bind(stream_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, CoreError> {
        let row = sqlx::query_as::<_, StreamRow>(
            r#"
            SELECT id, request_id, status, created_at, completed_at
            FROM stream_metadata
            WHERE id = ?
            "#,
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StreamRecord::try_from).transpose()
    }

    async fn active_stream(&self) -> Result<Option<StreamRecord>, CoreError> {
        let row = sqlx::query_as::<_, StreamRow>(
            r#"
            SELECT id, request_id, status, created_at, completed_at
            FROM stream_metadata
            WHERE status = 'streaming'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(StreamRecord::try_from).transpose()
    }

    async fn stream_chunks(&self, stream_id: &str) -> Result<Vec<ChunkRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT id, stream_id, body, chunk_index, created_at
            FROM stream_chunks
            WHERE stream_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChunkRecord::from).collect())
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM stream_chunks WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM stream_metadata WHERE id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_finished_streams(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let cutoff = to_millis(cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM stream_chunks
            WHERE stream_id IN (
                SELECT id FROM stream_metadata
                WHERE status IN ('completed', 'error') AND completed_at < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM stream_metadata
            WHERE status IN ('completed', 'error') AND completed_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::ScheduleKind;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_persistence() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence")
    }

    fn schedule(kind: ScheduleKind, time: DateTime<Utc>) -> ScheduleRecord {
        ScheduleRecord {
            id: Uuid::new_v4().to_string(),
            callback: "tick".to_string(),
            payload: json!({"n": 1}),
            kind,
            time,
            delay_seconds: None,
            cron: None,
            interval_seconds: (kind == ScheduleKind::Interval).then_some(60),
            running: false,
            execution_started_at: None,
            created_at: Utc::now(),
        }
    }

    fn workflow(workflow_id: &str, binding: &str) -> WorkflowRecord {
        let now = Utc::now();
        WorkflowRecord {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            binding: binding.to_string(),
            status: WorkflowStatus::Queued,
            metadata: Some(json!({"user": "u1"})),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_state_missing_until_saved() {
        let persistence = test_persistence().await;

        assert!(persistence.load_state().await.unwrap().is_none());

        persistence.save_state(r#"{"count":1}"#, None).await.unwrap();
        persistence
            .save_state(r#"{"count":2}"#, Some("conn-a"))
            .await
            .unwrap();

        assert_eq!(
            persistence.load_state().await.unwrap().as_deref(),
            Some(r#"{"count":2}"#)
        );

        let history = persistence.state_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, r#"{"count":2}"#);
        assert_eq!(history[0].origin.as_deref(), Some("conn-a"));
        assert_eq!(history[1].origin, None);
    }

    #[tokio::test]
    async fn test_trim_state_history_keeps_newest() {
        let persistence = test_persistence().await;
        assert_eq!(persistence.trim_state_history(2).await.unwrap(), 0);

        for i in 0..5 {
            persistence.save_state(&i.to_string(), None).await.unwrap();
        }

        assert_eq!(persistence.trim_state_history(2).await.unwrap(), 3);
        assert_eq!(persistence.trim_state_history(2).await.unwrap(), 0);
        let history = persistence.state_history(10).await.unwrap();
        let states: Vec<&str> = history.iter().map(|h| h.state.as_str()).collect();
        assert_eq!(states, vec!["4", "3"]);
        assert_eq!(persistence.load_state().await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_state_row_is_single() {
        let persistence = test_persistence().await;
        for i in 0..5 {
            persistence.save_state(&i.to_string(), None).await.unwrap();
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agent_state")
            .fetch_one(persistence.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_attachment_roundtrip_and_delete() {
        let persistence = test_persistence().await;

        assert!(persistence.load_attachment("c1").await.unwrap().is_none());

        persistence
            .save_attachment("c1", &json!({"nick": "ada"}))
            .await
            .unwrap();
        persistence
            .save_attachment("c1", &json!({"nick": "grace"}))
            .await
            .unwrap();
        assert_eq!(
            persistence.load_attachment("c1").await.unwrap(),
            Some(json!({"nick": "grace"}))
        );

        persistence.delete_attachment("c1").await.unwrap();
        assert!(persistence.load_attachment("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_insert_get_delete() {
        let persistence = test_persistence().await;
        let job = schedule(ScheduleKind::Delayed, Utc::now() + Duration::seconds(10));

        persistence.insert_schedule(&job).await.unwrap();

        let loaded = persistence.get_schedule(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.callback, "tick");
        assert_eq!(loaded.payload, json!({"n": 1}));
        assert_eq!(loaded.kind, ScheduleKind::Delayed);
        assert_eq!(loaded.time.timestamp_millis(), job.time.timestamp_millis());

        assert!(persistence.delete_schedule(&job.id).await.unwrap());
        assert!(!persistence.delete_schedule(&job.id).await.unwrap());
        assert!(persistence.get_schedule(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_and_reset() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(30);

        let job = schedule(ScheduleKind::Interval, now - Duration::seconds(5));
        persistence.insert_schedule(&job).await.unwrap();

        assert!(persistence.claim_schedule(&job.id, now, stale_before).await.unwrap());
        let loaded = persistence.get_schedule(&job.id).await.unwrap().unwrap();
        assert!(loaded.running);
        assert_eq!(
            loaded.execution_started_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        // Held by a fresh run.
        assert!(!persistence.claim_schedule(&job.id, now, stale_before).await.unwrap());
        // Reclaimed once that run counts as stale.
        let later = now + Duration::seconds(31);
        assert!(
            persistence
                .claim_schedule(&job.id, later, later - Duration::seconds(30))
                .await
                .unwrap()
        );
        assert!(!persistence.claim_schedule("missing", now, stale_before).await.unwrap());

        let reset_to = now + Duration::seconds(65);
        persistence
            .reset_schedule(&job.id, Some(reset_to))
            .await
            .unwrap();
        let loaded = persistence.get_schedule(&job.id).await.unwrap().unwrap();
        assert!(!loaded.running);
        assert!(loaded.execution_started_at.is_none());
        assert_eq!(loaded.time.timestamp_millis(), reset_to.timestamp_millis());

        // Without a new time the due time is kept.
        persistence.reset_schedule(&job.id, None).await.unwrap();
        let loaded = persistence.get_schedule(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.time.timestamp_millis(), reset_to.timestamp_millis());
    }

    #[tokio::test]
    async fn test_due_schedules_and_filter() {
        let persistence = test_persistence().await;
        let now = Utc::now();

        let past = schedule(ScheduleKind::Scheduled, now - Duration::seconds(1));
        let future = schedule(ScheduleKind::Interval, now + Duration::hours(1));
        persistence.insert_schedule(&past).await.unwrap();
        persistence.insert_schedule(&future).await.unwrap();

        let due = persistence.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);

        let intervals = persistence
            .list_schedules(&ListSchedulesFilter {
                kind: Some(ScheduleKind::Interval),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].id, future.id);

        let window = persistence
            .list_schedules(&ListSchedulesFilter {
                due_before: Some(now + Duration::minutes(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, past.id);
    }

    #[tokio::test]
    async fn test_alarm_set_and_clear() {
        let persistence = test_persistence().await;
        assert!(persistence.get_alarm().await.unwrap().is_none());

        let at = Utc::now() + Duration::seconds(30);
        persistence.set_alarm(Some(at)).await.unwrap();
        assert_eq!(
            persistence
                .get_alarm()
                .await
                .unwrap()
                .map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );

        persistence.set_alarm(None).await.unwrap();
        assert!(persistence.get_alarm().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_workflow_id_is_reported() {
        let persistence = test_persistence().await;

        persistence
            .insert_workflow(&workflow("wf-1", "PROCESS"))
            .await
            .unwrap();
        let err = persistence
            .insert_workflow(&workflow("wf-1", "PROCESS"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::DuplicateWorkflowId { ref workflow_id } if workflow_id == "wf-1"
        ));
    }

    #[tokio::test]
    async fn test_workflow_transition_never_leaves_terminal() {
        let persistence = test_persistence().await;
        persistence
            .insert_workflow(&workflow("wf-2", "PROCESS"))
            .await
            .unwrap();

        assert!(
            persistence
                .transition_workflow("wf-2", WorkflowStatus::Running)
                .await
                .unwrap()
        );
        assert!(
            persistence
                .finish_workflow("wf-2", Some(&json!({"ok": true})), None)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .transition_workflow("wf-2", WorkflowStatus::Running)
                .await
                .unwrap()
        );

        assert!(
            !persistence
                .finish_workflow("wf-2", None, Some(&json!("late failure")))
                .await
                .unwrap()
        );

        let row = persistence.get_workflow("wf-2").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Complete);
        assert_eq!(row.result, Some(json!({"ok": true})));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_workflow_error_and_bulk_delete() {
        let persistence = test_persistence().await;
        persistence
            .insert_workflow(&workflow("a", "PROCESS"))
            .await
            .unwrap();
        persistence
            .insert_workflow(&workflow("b", "PROCESS"))
            .await
            .unwrap();
        persistence
            .insert_workflow(&workflow("c", "OTHER"))
            .await
            .unwrap();

        persistence
            .finish_workflow("a", None, Some(&json!({"message": "boom"})))
            .await
            .unwrap();
        let row = persistence.get_workflow("a").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Errored);

        let deleted = persistence
            .delete_workflows(&ListWorkflowsFilter {
                status: Some(WorkflowStatus::Errored),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let migrated = persistence
            .migrate_workflow_binding("PROCESS", "PROCESS_V2")
            .await
            .unwrap();
        assert_eq!(migrated, 1);

        let v2 = persistence
            .list_workflows(&ListWorkflowsFilter {
                binding: Some("PROCESS_V2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].workflow_id, "b");

        assert!(persistence.delete_workflow("c").await.unwrap());
        assert!(!persistence.delete_workflow("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_step_first_write_wins() {
        let persistence = test_persistence().await;

        assert!(persistence.load_step("wf", "notify").await.unwrap().is_none());
        persistence
            .save_step("wf", "notify", &json!(1))
            .await
            .unwrap();
        persistence
            .save_step("wf", "notify", &json!(2))
            .await
            .unwrap();

        assert_eq!(
            persistence.load_step("wf", "notify").await.unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_stream_chunks_ordered_and_cleanup() {
        let persistence = test_persistence().await;
        let created = Utc::now() - Duration::days(2);
        let stream = StreamRecord {
            id: "s1".to_string(),
            request_id: "r1".to_string(),
            status: StreamStatus::Streaming,
            created_at: created,
            completed_at: None,
        };
        persistence.insert_stream(&stream).await.unwrap();

        let chunks: Vec<ChunkRecord> = (0..3)
            .rev()
            .map(|i| ChunkRecord {
                id: Uuid::new_v4().to_string(),
                stream_id: "s1".to_string(),
                body: format!("part-{}", i),
                chunk_index: i,
                created_at: created,
            })
            .collect();
        persistence.insert_chunks(&chunks).await.unwrap();

        let loaded = persistence.stream_chunks("s1").await.unwrap();
        let indices: Vec<i64> = loaded.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        assert_eq!(
            persistence.active_stream().await.unwrap().map(|s| s.id),
            Some("s1".to_string())
        );

        // Active streams are never swept.
        assert_eq!(
            persistence
                .delete_finished_streams(Utc::now())
                .await
                .unwrap(),
            0
        );

        persistence
            .finish_stream("s1", StreamStatus::Completed, created)
            .await
            .unwrap();
        assert!(persistence.active_stream().await.unwrap().is_none());

        let swept = persistence
            .delete_finished_streams(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(persistence.stream_chunks("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        persistence.save_state("42", None).await.unwrap();
        assert!(path.exists());

        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert_eq!(reopened.load_state().await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let persistence = test_persistence().await;
        assert!(persistence.health_check_db().await.unwrap());
    }
}
