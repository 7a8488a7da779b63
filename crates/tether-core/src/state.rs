// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance state.
//!
//! Every mutation, whether it comes from a client `state` frame, a callable
//! or server-side code, goes through [`Instance::set_state`]:
//!
//! 1. readonly connections are rejected,
//! 2. the agent's validation hook may reject the value,
//! 3. the value is persisted (with a history entry) and cached,
//! 4. the post-update hook runs; its errors go to the agent's error channel,
//! 5. the new state is broadcast to connections.
//!
//! Reads are served from the cache after the first load. A stored value that
//! no longer parses is replaced by the declared initial state.

use serde_json::Value;
use tether_protocol::ServerFrame;
use tracing::{debug, error, instrument, warn};

use crate::agent::{Agent, Origin};
use crate::error::CoreError;
use crate::instance::Instance;
use crate::persistence::StateHistoryRecord;

impl<A: Agent> Instance<A> {
    fn cached_state(&self) -> Option<Value> {
        self.state_cache.lock().ok().and_then(|cache| cache.clone())
    }

    fn cache_state(&self, state: Value) {
        if let Ok(mut cache) = self.state_cache.lock() {
            *cache = Some(state);
        }
    }

    /// Current state. Materializes the declared initial state on first read;
    /// `Value::Null` when the agent declares none.
    pub async fn state(&self) -> Value {
        if let Some(state) = self.cached_state() {
            return state;
        }

        match self.persistence.load_state().await {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(state) => {
                    self.cache_state(state.clone());
                    state
                }
                Err(e) => {
                    let err = CoreError::CorruptedState {
                        details: e.to_string(),
                    };
                    warn!(instance = %self.name(), error = %err, "Replacing unreadable state");
                    self.materialize_initial_state().await
                }
            },
            Ok(None) => self.materialize_initial_state().await,
            Err(e) => {
                // Not cached, so the next read tries the store again.
                error!(instance = %self.name(), error = %e, "Failed to load state");
                self.agent().initial_state().unwrap_or(Value::Null)
            }
        }
    }

    async fn materialize_initial_state(&self) -> Value {
        let Some(initial) = self.agent().initial_state() else {
            self.cache_state(Value::Null);
            return Value::Null;
        };

        if let Err(e) = self.commit_state(initial.clone(), &Origin::Server, false).await {
            error!(instance = %self.name(), error = %e, "Failed to persist initial state");
        }
        initial
    }

    /// Replace the state on behalf of `origin`.
    pub async fn set_state(&self, state: Value, origin: Origin) -> Result<(), CoreError> {
        self.apply_state(state, origin, false).await
    }

    /// Mutation entry point. With `exclude_origin` the originating connection
    /// is left out of the broadcast; it already holds the value it sent.
    #[instrument(skip_all, fields(instance = %self.name(), origin = origin.connection_id().unwrap_or("server")))]
    pub(crate) async fn apply_state(
        &self,
        state: Value,
        origin: Origin,
        exclude_origin: bool,
    ) -> Result<(), CoreError> {
        if let Some(connection) = origin.connection() {
            if connection.is_readonly() {
                return Err(CoreError::ReadonlyViolation {
                    connection_id: connection.id().to_string(),
                });
            }
        }

        if let Err(e) = self.agent().validate_state_change(&state, &origin).await {
            return Err(CoreError::ValidationRejected {
                message: e.to_string(),
            });
        }

        self.commit_state(state, &origin, exclude_origin).await
    }

    async fn commit_state(
        &self,
        state: Value,
        origin: &Origin,
        exclude_origin: bool,
    ) -> Result<(), CoreError> {
        let serialized = serde_json::to_string(&state)?;
        self.persistence
            .save_state(&serialized, origin.connection_id())
            .await?;
        self.cache_state(state.clone());
        self.trim_history().await;

        if let Err(e) = self.agent().on_state_update(self, &state, origin).await {
            self.agent().on_error(&e);
        }

        let exclude: Vec<&str> = match origin.connection_id() {
            Some(id) if exclude_origin => vec![id],
            _ => Vec::new(),
        };
        self.connections
            .broadcast(&ServerFrame::State { state }, &exclude);
        Ok(())
    }

    async fn trim_history(&self) {
        let keep = i64::try_from(self.config().state_history_limit).unwrap_or(i64::MAX);
        match self.persistence.trim_state_history(keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(instance = %self.name(), removed, "Trimmed state history"),
            Err(e) => warn!(instance = %self.name(), error = %e, "State history trim failed"),
        }
    }

    /// Most recent state changes, newest first.
    pub async fn state_history(&self, limit: i64) -> Result<Vec<StateHistoryRecord>, CoreError> {
        self.persistence.state_history(limit).await
    }
}
