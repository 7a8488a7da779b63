// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for tether-core.
//!
//! Every agent instance exclusively owns one store. The store is only ever
//! driven from the instance's own task, so implementations do not need to
//! guard against concurrent writers from other instances.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

// ============================================================================
// State
// ============================================================================

/// One entry of the state mutation log.
#[derive(Debug, Clone, Serialize)]
pub struct StateHistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// Serialized state as written.
    pub state: String,
    /// Connection id that caused the mutation, `None` for server-side writes.
    pub origin: Option<String>,
    /// When the mutation was persisted.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Schedules
// ============================================================================

/// How a scheduled job computes its due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// One-shot at an absolute time.
    Scheduled,
    /// One-shot after a delay.
    Delayed,
    /// Recurring on a cron expression.
    Cron,
    /// Recurring every fixed number of seconds.
    Interval,
}

impl ScheduleKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Delayed => "delayed",
            Self::Cron => "cron",
            Self::Interval => "interval",
        }
    }

    /// Recurring jobs survive their own execution.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Cron | Self::Interval)
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "delayed" => Ok(Self::Delayed),
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            other => Err(CoreError::DatabaseError {
                operation: "decode_schedule".to_string(),
                details: format!("unknown schedule kind '{}'", other),
            }),
        }
    }
}

/// Scheduled job row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRecord {
    /// Opaque unique id.
    pub id: String,
    /// Name of the agent method invoked when the job fires.
    pub callback: String,
    /// Argument passed to the callback.
    pub payload: Value,
    /// Scheduling kind.
    pub kind: ScheduleKind,
    /// Next due time.
    pub time: DateTime<Utc>,
    /// Delay for `Delayed` jobs.
    pub delay_seconds: Option<i64>,
    /// Expression for `Cron` jobs.
    pub cron: Option<String>,
    /// Period for `Interval` jobs.
    pub interval_seconds: Option<i64>,
    /// Whether the callback is currently executing.
    pub running: bool,
    /// When the current execution started.
    pub execution_started_at: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing schedules.
#[derive(Debug, Clone, Default)]
pub struct ListSchedulesFilter {
    /// Only jobs of this kind.
    pub kind: Option<ScheduleKind>,
    /// Only jobs due at or after this time.
    pub due_after: Option<DateTime<Utc>>,
    /// Only jobs due at or before this time.
    pub due_before: Option<DateTime<Utc>>,
}

// ============================================================================
// Workflows
// ============================================================================

/// Tracking status of a delegated workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Paused,
    Complete,
    Errored,
}

impl WorkflowStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Errored => "errored",
        }
    }

    /// Terminal statuses are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "errored" => Ok(Self::Errored),
            other => Err(CoreError::DatabaseError {
                operation: "decode_workflow".to_string(),
                details: format!("unknown workflow status '{}'", other),
            }),
        }
    }
}

/// Workflow tracking row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRecord {
    /// Internal id.
    pub id: String,
    /// Caller-supplied workflow id (unique per instance).
    pub workflow_id: String,
    /// Name of the engine binding the workflow runs under.
    pub binding: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Opaque caller metadata.
    pub metadata: Option<Value>,
    /// Result reported on completion.
    pub result: Option<Value>,
    /// Structured error reported on failure.
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter options for listing or bulk-deleting workflow rows.
#[derive(Debug, Clone, Default)]
pub struct ListWorkflowsFilter {
    /// Only rows with this status.
    pub status: Option<WorkflowStatus>,
    /// Only rows with this binding.
    pub binding: Option<String>,
    /// Only rows created before this time.
    pub created_before: Option<DateTime<Utc>>,
    /// Maximum number of rows (listing only).
    pub limit: Option<i64>,
}

// ============================================================================
// Streams
// ============================================================================

/// Status of a resumable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Streaming,
    Completed,
    Error,
}

impl StreamStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for StreamStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(CoreError::DatabaseError {
                operation: "decode_stream".to_string(),
                details: format!("unknown stream status '{}'", other),
            }),
        }
    }
}

/// Stream metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub id: String,
    /// RPC request id the stream answers.
    pub request_id: String,
    pub status: StreamStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One buffered chunk of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub stream_id: String,
    pub body: String,
    /// Position within the stream, starting at 0.
    pub chunk_index: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Trait
// ============================================================================

/// Persistence interface used by an agent instance.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- state ----------------------------------------------------------

    /// Raw serialized current state, `None` if never written.
    async fn load_state(&self) -> Result<Option<String>, CoreError>;

    /// Replace the current state row and append a history entry, atomically.
    async fn save_state(&self, state: &str, origin: Option<&str>) -> Result<(), CoreError>;

    /// Most recent history entries, newest first.
    async fn state_history(&self, limit: i64) -> Result<Vec<StateHistoryRecord>, CoreError>;

    /// Delete all but the newest `keep` history entries. Returns rows removed.
    async fn trim_state_history(&self, keep: i64) -> Result<u64, CoreError>;

    // ---- connection attachments ----------------------------------------

    async fn load_attachment(&self, connection_id: &str) -> Result<Option<Value>, CoreError>;

    async fn save_attachment(&self, connection_id: &str, attachment: &Value)
    -> Result<(), CoreError>;

    async fn delete_attachment(&self, connection_id: &str) -> Result<(), CoreError>;

    // ---- schedules ------------------------------------------------------

    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), CoreError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, CoreError>;

    async fn list_schedules(
        &self,
        filter: &ListSchedulesFilter,
    ) -> Result<Vec<ScheduleRecord>, CoreError>;

    /// Delete a job. Returns false if it did not exist.
    async fn delete_schedule(&self, id: &str) -> Result<bool, CoreError>;

    /// Jobs whose due time is at or before `now`, running or not.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, CoreError>;

    /// Claim a job for execution: set the running flag and stamp `now` as
    /// the execution start, but only if the job is due at `now` and either
    /// idle or flagged running since before `stale_before`. Returns false if
    /// the job is gone, not due, or held by a run that is not stale.
    async fn claim_schedule(
        &self,
        id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Clear the running flag, optionally moving the due time.
    async fn reset_schedule(
        &self,
        id: &str,
        next_time: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, CoreError>;

    /// Arm (or with `None`, disarm) the single wake time.
    async fn set_alarm(&self, wake_at: Option<DateTime<Utc>>) -> Result<(), CoreError>;

    // ---- workflows ------------------------------------------------------

    /// Insert a tracking row. Fails with `DuplicateWorkflowId` if the
    /// workflow id is already tracked.
    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<(), CoreError>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError>;

    async fn list_workflows(
        &self,
        filter: &ListWorkflowsFilter,
    ) -> Result<Vec<WorkflowRecord>, CoreError>;

    /// Move a non-terminal row to `status`. Returns false if the row is
    /// missing or already terminal.
    async fn transition_workflow(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<bool, CoreError>;

    /// Mark a row `complete` (or `errored` when `error` is set) and stamp
    /// `completed_at`. Returns false if the row is missing or already
    /// terminal; the first terminal outcome wins.
    async fn finish_workflow(
        &self,
        workflow_id: &str,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<bool, CoreError>;

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, CoreError>;

    /// Delete every row matching the filter; `limit` is ignored.
    async fn delete_workflows(&self, filter: &ListWorkflowsFilter) -> Result<u64, CoreError>;

    /// Rename a binding across all rows.
    async fn migrate_workflow_binding(&self, old: &str, new: &str) -> Result<u64, CoreError>;

    async fn load_step(&self, workflow_id: &str, step_name: &str)
    -> Result<Option<Value>, CoreError>;

    async fn save_step(
        &self,
        workflow_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), CoreError>;

    // ---- streams --------------------------------------------------------

    async fn insert_stream(&self, stream: &StreamRecord) -> Result<(), CoreError>;

    /// Write a batch of chunks in one transaction.
    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), CoreError>;

    async fn finish_stream(
        &self,
        stream_id: &str,
        status: StreamStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn get_stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, CoreError>;

    /// The most recent stream still in `streaming` status.
    async fn active_stream(&self) -> Result<Option<StreamRecord>, CoreError>;

    /// Chunks of a stream in index order.
    async fn stream_chunks(&self, stream_id: &str) -> Result<Vec<ChunkRecord>, CoreError>;

    /// Delete a stream and its chunks.
    async fn delete_stream(&self, stream_id: &str) -> Result<(), CoreError>;

    /// Delete finished streams (and their chunks) completed before `cutoff`.
    async fn delete_finished_streams(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Liveness check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
