// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The [`Agent`] trait implemented by user agent types.
//!
//! An agent type supplies its method table, its declared initial state and a
//! set of lifecycle hooks. Every hook has a default, so a minimal agent only
//! implements [`Agent::methods`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use crate::callable::MethodTable;
use crate::connection::{ConnectRequest, Connection};
use crate::instance::Instance;

/// Who initiated a state mutation.
#[derive(Debug, Clone)]
pub enum Origin {
    /// Server-side code: scheduled callbacks, workflow callbacks, hooks.
    Server,
    /// A client connection.
    Connection(Arc<Connection>),
}

impl Origin {
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::Server => None,
            Self::Connection(conn) => Some(conn),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection().map(|c| c.id())
    }
}

/// A stateful agent type.
#[async_trait]
pub trait Agent: Send + Sync + Sized + 'static {
    /// Named handlers of this agent type, flattened with inherited ones.
    fn methods() -> MethodTable<Self>;

    /// Declared default state, materialized on first read.
    fn initial_state(&self) -> Option<Value> {
        None
    }

    /// Whether to send the `identity` frame on connect.
    fn send_identity_on_connect(&self) -> bool {
        true
    }

    /// Auxiliary capability list sent in the `mcp-servers` frame.
    fn mcp_servers(&self) -> Vec<Value> {
        Vec::new()
    }

    /// Initial readonly flag for a new connection.
    fn should_connection_be_readonly(
        &self,
        _connection: &Connection,
        _request: &ConnectRequest,
    ) -> bool {
        false
    }

    /// Gate for every state mutation. Returning an error rejects the change.
    async fn validate_state_change(&self, _state: &Value, _origin: &Origin) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a state change is persisted, before it is broadcast.
    async fn on_state_update(
        &self,
        _instance: &Instance<Self>,
        _state: &Value,
        _origin: &Origin,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the instance is started or rehydrated.
    async fn on_start(&self, _instance: &Instance<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the connect handshake frames were sent. No frame from
    /// this connection is processed until it returns.
    async fn on_connect(
        &self,
        _instance: &Instance<Self>,
        _connection: &Arc<Connection>,
        _request: &ConnectRequest,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a connection is detached.
    async fn on_close(
        &self,
        _instance: &Instance<Self>,
        _connection: &Arc<Connection>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Workflow progress callback.
    async fn on_workflow_progress(
        &self,
        _instance: &Instance<Self>,
        _workflow_id: &str,
        _progress: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Workflow completion callback.
    async fn on_workflow_complete(
        &self,
        _instance: &Instance<Self>,
        _workflow_id: &str,
        _result: Option<&Value>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Workflow failure callback.
    async fn on_workflow_error(
        &self,
        _instance: &Instance<Self>,
        _workflow_id: &str,
        _error: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Custom workflow event. Never changes the tracking row.
    async fn on_workflow_event(
        &self,
        _instance: &Instance<Self>,
        _workflow_id: &str,
        _event: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Error channel for failures that are contained rather than surfaced
    /// (post-update hooks, scheduled callbacks, lifecycle hooks).
    fn on_error(&self, error: &anyhow::Error) {
        error!(error = %error, "Agent error");
    }
}
