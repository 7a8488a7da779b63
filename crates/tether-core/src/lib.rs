// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Core - Durable Agent Instances
//!
//! An agent is a named, long-lived unit of state and behaviour. Each instance
//! owns a private SQLite database and processes everything addressed to it
//! (connects, frames, alarms, workflow callbacks) in order on one task.
//!
//! # Architecture
//!
//! ```text
//!   WebSocket clients            server-side code          workflow engine
//!          │                            │                         │
//!          ▼                            ▼                         ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         AgentRuntime                                 │
//! │          (agent registry, instance lookup, idle eviction)            │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ InstanceHandle (command channel)
//!          ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Instance<A: Agent>                            │
//! │  connections ─ router ─ callables ─ state ─ scheduler ─ streams      │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//! ┌───────────────────────┐
//! │  SQLite (per instance) │
//! └───────────────────────┘
//! ```
//!
//! # Frames
//!
//! | Direction | type | Description |
//! |-----------|------|-------------|
//! | S→C | `identity` | Instance name and agent type, sent first on connect |
//! | S→C | `state` | Current state (on connect and after every change) |
//! | S→C | `state-error` | A `state` frame from this connection was rejected |
//! | S→C | `mcp-servers` | Auxiliary capability list |
//! | C→S | `state` | Replace the state |
//! | C→S | `rpc-request` | Invoke a callable method |
//! | C→S | `rpc-cancel` | Cancel an in-flight call |
//! | S→C | `rpc-response` | Result, stream chunk or error of a call |
//! | S→C | `stream-resuming` | An interrupted stream can be replayed |
//! | C→S | `stream-resume-ack` | Replay the offered stream |
//! | S→C | `stream-chunk` | Live or replayed stream body |
//!
//! Frames that do not parse, or lack required fields, are dropped.
//!
//! # Readonly Connections
//!
//! A connection can be marked readonly when it connects
//! ([`Agent::should_connection_be_readonly`]) or later. Readonly connections
//! receive broadcasts and may call methods, but any state change they
//! originate is rejected, including changes made from a method they called.
//! The flag is stored inside the connection's attribute bag so it survives
//! hibernation, and is hidden from [`Connection::state`].
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TETHER_DATA_DIR` | `.data` | Directory of per-instance databases |
//! | `TETHER_HTTP_PORT` | `8787` | HTTP/WebSocket port |
//! | `TETHER_IDLE_TIMEOUT_SECS` | `300` | Idle instance eviction |
//! | `TETHER_SCHEDULE_STALE_SECS` | `30` | Running job considered crashed after |
//! | `TETHER_STREAM_FLUSH_BATCH` | `10` | Chunks buffered before a write |
//! | `TETHER_STREAM_MAX_BUFFER` | `100` | Hard cap on buffered chunks |
//! | `TETHER_STREAM_STALE_SECS` | `300` | Streaming stream considered dead after |
//! | `TETHER_STREAM_CLEANUP_INTERVAL_SECS` | `600` | Finished stream cleanup throttle |
//! | `TETHER_STREAM_RETENTION_SECS` | `86400` | Finished stream retention |
//! | `TETHER_STATE_HISTORY_LIMIT` | `1000` | State history entries kept |
//! | `TETHER_PRESERVE_CONNECTION_STATE` | `true` | Keep attribute bags across reconnects |
//!
//! # Modules
//!
//! - [`agent`]: The [`Agent`] trait and lifecycle hooks
//! - [`callable`]: Method tables, call context and RPC dispatch
//! - [`connection`]: Connection wrapper, attribute bags and the registry
//! - [`instance`]: Instance actor and its handle
//! - [`persistence`]: SQLite storage
//! - [`runtime`]: Embeddable runtime hosting many instances
//! - [`scheduler`]: Durable schedules and the alarm
//! - [`streams`]: Resumable streams
//! - [`workflow`]: Workflow engine bridge
//! - `server`: HTTP/WebSocket host (feature `server`)

/// Agent trait, lifecycle hooks and mutation origins.
pub mod agent;

/// Method tables, call context and RPC dispatch.
pub mod callable;

/// Server and instance configuration loaded from environment variables.
pub mod config;

/// Connection wrapper, attribute bags and readonly enforcement.
pub mod connection;

/// Error types with stable error codes.
pub mod error;

/// Instance actor and handle.
pub mod instance;

/// Embedded SQL migrations.
pub mod migrations;

/// Per-instance persistence.
pub mod persistence;

/// Inbound frame routing.
pub mod router;

/// Agent runtime hosting many instances.
pub mod runtime;

/// Durable schedules and alarm handling.
pub mod scheduler;

/// HTTP/WebSocket host.
#[cfg(feature = "server")]
pub mod server;

/// State reads and the single mutation entry point.
pub mod state;

/// Resumable stream tracking.
pub mod streams;

/// Workflow engine bridge and durable step helpers.
pub mod workflow;

pub use agent::{Agent, Origin};
pub use callable::{CallContext, MethodInfo, MethodTable, ReturnValue, StreamHandle};
pub use config::{Config, InstanceConfig};
pub use connection::{Connection, ConnectRequest};
pub use error::CoreError;
pub use instance::{Instance, InstanceHandle};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use scheduler::When;
pub use workflow::{
    CallbackSink, CheckpointedSteps, RunWorkflowOptions, StepRunner, WorkflowCallback,
    WorkflowEngine, WorkflowReporter,
};
