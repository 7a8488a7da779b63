// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection registry and readonly enforcement.
//!
//! Every attached client is represented by a [`Connection`]. A connection
//! carries a small attribute bag (a JSON object or nothing) stored behind an
//! [`AttachmentAccessor`]. The readonly flag lives in that same bag under a
//! reserved key, but the public accessors never expose it and never let user
//! writes clobber it: reads strip the key, writes re-inject the stored flag
//! before delegating to the raw accessor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tether_protocol::ServerFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::persistence::Persistence;

/// Reserved attachment key holding the readonly flag.
pub const READONLY_KEY: &str = "__tether_readonly";

/// User-visible attribute bag.
pub type Attachment = Option<Map<String, Value>>;

/// Raw storage for a connection's attribute bag.
///
/// Implementations hold the bag exactly as stored, including reserved keys.
/// Reads are served from memory so a read-modify-write never spans an await.
#[async_trait]
pub trait AttachmentAccessor: Send + Sync {
    /// Current raw bag (`Value::Null` when empty).
    fn get(&self) -> Value;

    /// Replace the raw bag.
    async fn set(&self, value: Value) -> Result<(), CoreError>;

    /// Drop any durable copy of the bag.
    async fn discard(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Bag kept only in process memory.
#[derive(Default)]
pub struct MemoryAttachment {
    value: Mutex<Value>,
}

impl MemoryAttachment {
    pub fn new(value: Value) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }
}

#[async_trait]
impl AttachmentAccessor for MemoryAttachment {
    fn get(&self) -> Value {
        self.value.lock().map(|v| v.clone()).unwrap_or(Value::Null)
    }

    async fn set(&self, value: Value) -> Result<(), CoreError> {
        if let Ok(mut guard) = self.value.lock() {
            *guard = value;
        }
        Ok(())
    }
}

/// Bag mirrored into the instance store, so it survives hibernation and is
/// handed back to a client that reconnects with the same connection id.
pub struct StoredAttachment {
    connection_id: String,
    persistence: Arc<dyn Persistence>,
    cache: Mutex<Value>,
}

impl StoredAttachment {
    /// Load the stored bag for `connection_id` (empty if none).
    pub async fn load(
        connection_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, CoreError> {
        let connection_id = connection_id.into();
        let value = persistence
            .load_attachment(&connection_id)
            .await?
            .unwrap_or(Value::Null);

        Ok(Self {
            connection_id,
            persistence,
            cache: Mutex::new(value),
        })
    }
}

#[async_trait]
impl AttachmentAccessor for StoredAttachment {
    fn get(&self) -> Value {
        self.cache.lock().map(|v| v.clone()).unwrap_or(Value::Null)
    }

    async fn set(&self, value: Value) -> Result<(), CoreError> {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = value.clone();
        }
        self.persistence
            .save_attachment(&self.connection_id, &value)
            .await
    }

    async fn discard(&self) -> Result<(), CoreError> {
        self.persistence.delete_attachment(&self.connection_id).await
    }
}

/// Information about the request that opened a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Request path, e.g. `/agents/chat/room-1`.
    pub path: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Request headers (lower-cased names).
    pub headers: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// An attached transport before it is wrapped.
pub struct RawConnection {
    pub id: String,
    pub sender: mpsc::UnboundedSender<ServerFrame>,
    pub attachment: Arc<dyn AttachmentAccessor>,
}

impl RawConnection {
    /// Raw connection with an in-memory attribute bag.
    pub fn in_memory(id: impl Into<String>, sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            id: id.into(),
            sender,
            attachment: Arc::new(MemoryAttachment::default()),
        }
    }
}

/// A wrapped connection.
pub struct Connection {
    id: String,
    sender: mpsc::UnboundedSender<ServerFrame>,
    raw: Arc<dyn AttachmentAccessor>,
    /// Cancelled when a newer transport registers under the same id.
    superseded: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl Connection {
    fn wrap(raw: RawConnection) -> Self {
        Self {
            id: raw.id,
            sender: raw.sender,
            raw: raw.attachment,
            superseded: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send a frame. Returns false if the transport has gone away.
    pub fn send(&self, frame: ServerFrame) -> bool {
        let delivered = self.sender.send(frame).is_ok();
        if !delivered {
            debug!(connection_id = %self.id, "Dropping frame for closed connection");
        }
        delivered
    }

    /// The attribute bag as user code sees it; the readonly key is never present.
    pub fn state(&self) -> Attachment {
        match self.raw.get() {
            Value::Object(mut map) => {
                let had_flag = map.remove(READONLY_KEY).is_some();
                if had_flag && map.is_empty() {
                    None
                } else {
                    Some(map)
                }
            }
            _ => None,
        }
    }

    /// Replace the attribute bag, preserving the readonly flag.
    pub async fn set_state(&self, state: Attachment) -> Result<(), CoreError> {
        let flag = self.raw_flag();
        self.raw.set(inject_flag(state, flag)).await
    }

    /// Update the attribute bag from its current (user-visible) value.
    pub async fn update_state<F>(&self, update: F) -> Result<(), CoreError>
    where
        F: FnOnce(Attachment) -> Attachment,
    {
        let next = update(self.state());
        self.set_state(next).await
    }

    /// Set or clear the readonly flag through the raw accessor.
    pub async fn set_readonly(&self, readonly: bool) -> Result<(), CoreError> {
        let mut map = match self.raw.get() {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                // Unusual stored shape: replace it so the flag is recorded.
                warn!(connection_id = %self.id, stored = %other, "Replacing non-object attachment");
                Map::new()
            }
        };
        if readonly {
            map.insert(READONLY_KEY.to_string(), Value::Bool(true));
        } else {
            map.remove(READONLY_KEY);
        }
        let value = if map.is_empty() {
            Value::Null
        } else {
            Value::Object(map)
        };
        self.raw.set(value).await
    }

    /// Whether the connection is readonly; false if never set.
    pub fn is_readonly(&self) -> bool {
        self.raw_flag()
    }

    fn raw_flag(&self) -> bool {
        self.raw
            .get()
            .get(READONLY_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) async fn discard_attachment(&self) {
        if let Err(e) = self.raw.discard().await {
            warn!(connection_id = %self.id, error = %e, "Failed to discard connection attachment");
        }
    }

    /// Whether a newer transport has taken over this connection id.
    pub fn is_superseded(&self) -> bool {
        self.superseded.is_cancelled()
    }

    /// Resolves once a newer transport takes over this connection id. The
    /// transport owning this wrapper should close when it does.
    pub async fn superseded(&self) {
        self.superseded.cancelled().await
    }

    fn same_transport(&self, raw: &RawConnection) -> bool {
        self.sender.same_channel(&raw.sender)
    }
}

fn inject_flag(state: Attachment, readonly: bool) -> Value {
    match (state, readonly) {
        (Some(mut map), true) => {
            map.insert(READONLY_KEY.to_string(), Value::Bool(true));
            Value::Object(map)
        }
        (Some(mut map), false) => {
            // A user value must not be able to plant the flag either.
            map.remove(READONLY_KEY);
            Value::Object(map)
        }
        (None, true) => {
            let mut map = Map::new();
            map.insert(READONLY_KEY.to_string(), Value::Bool(true));
            Value::Object(map)
        }
        (None, false) => Value::Null,
    }
}

/// Attached connections of one instance, in registration order.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap and register a raw connection.
    ///
    /// Wrapping the same transport twice returns the existing wrapper. A new
    /// transport reusing a registered id supersedes the old one.
    pub fn wrap(&self, raw: RawConnection) -> Arc<Connection> {
        let Ok(mut connections) = self.connections.lock() else {
            return Arc::new(Connection::wrap(raw));
        };

        if let Some(pos) = connections.iter().position(|c| c.id == raw.id) {
            if connections[pos].same_transport(&raw) {
                return connections[pos].clone();
            }
            debug!(connection_id = %raw.id, "Replacing superseded connection");
            connections.remove(pos).superseded.cancel();
        }

        let connection = Arc::new(Connection::wrap(raw));
        connections.push(connection.clone());
        connection
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .ok()?
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().ok()?;
        let pos = connections.iter().position(|c| c.id == id)?;
        Some(connections.remove(pos))
    }

    /// Remove `connection` only if it is still the registered wrapper for its
    /// id. A superseded wrapper leaves its successor in place.
    pub fn remove_current(&self, connection: &Arc<Connection>) -> bool {
        let Ok(mut connections) = self.connections.lock() else {
            return false;
        };
        match connections.iter().position(|c| Arc::ptr_eq(c, connection)) {
            Some(pos) => {
                connections.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether `connection` is the registered wrapper for its id.
    pub fn is_current(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .lock()
            .map(|c| c.iter().any(|c| Arc::ptr_eq(c, connection)))
            .unwrap_or(false)
    }

    /// Snapshot of all connections in registration order.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a frame to every connection not in `exclude`.
    pub fn broadcast(&self, frame: &ServerFrame, exclude: &[&str]) {
        for connection in self.all() {
            if !exclude.contains(&connection.id()) {
                connection.send(frame.clone());
            }
        }
    }
}
