// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON frame types for the agent WebSocket protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. Client frames are
//! decoded leniently: anything that does not parse into a known, complete
//! frame is reported as `None` so the caller can drop it without replying.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Fixed error string sent when a readonly connection attempts a mutation.
pub const READONLY_ERROR: &str = "Connection is readonly";

/// Errors that can occur while encoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// Client -> Server
// ============================================================================

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Replace the agent state.
    State { state: Value },

    /// Invoke a callable method.
    RpcRequest {
        id: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Cooperatively cancel an in-flight request.
    RpcCancel { id: String },

    /// Accept a `stream-resuming` offer and request replay.
    StreamResumeAck { id: String },
}

impl ClientFrame {
    /// Decode a client frame from text.
    ///
    /// Returns `None` for malformed JSON, unknown frame types and frames that
    /// are missing required fields.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Encode this frame as JSON text.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Instance identity, sent first on connect.
    Identity { name: String, agent: String },

    /// Full state snapshot.
    State { state: Value },

    /// A state-sync frame was rejected.
    StateError { error: String },

    /// Auxiliary capability list (discovered tool servers).
    McpServers { servers: Vec<Value> },

    /// Response (or stream chunk) for an RPC request.
    RpcResponse(RpcResponse),

    /// A resumable stream exists; the client may acknowledge to replay it.
    StreamResuming { id: String },

    /// A chunk of a resumable stream.
    StreamChunk(StreamChunk),
}

impl ServerFrame {
    /// Encode this frame as JSON text.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a server frame (used by clients and tests).
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// RPC response payload.
///
/// A missing `result` means the method produced no value; `Some(Value::Null)`
/// is an explicit `null` result and is serialized as `"result": null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub success: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Terminal success response.
    pub fn done(id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            result,
            done: Some(true),
            error: None,
        }
    }

    /// Intermediate streaming chunk.
    pub fn chunk(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            done: Some(false),
            error: None,
        }
    }

    /// Terminal error response.
    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            done: None,
            error: Some(error.into()),
        }
    }

    /// Whether this response ends the request.
    pub fn is_terminal(&self) -> bool {
        !self.success || self.done == Some(true)
    }
}

/// Resumable stream chunk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Request id the stream belongs to.
    pub id: String,
    pub body: String,
    pub done: bool,
    /// Set when the chunk is replayed after a reconnect.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    /// A body chunk.
    pub fn body(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            done: false,
            replay: false,
            error: None,
        }
    }

    /// The terminal chunk, carrying the failure message if the stream failed.
    pub fn finished(id: impl Into<String>, error: Option<String>) -> Self {
        Self {
            id: id.into(),
            body: String::new(),
            done: true,
            replay: false,
            error,
        }
    }

    /// Mark the chunk as part of a replay.
    pub fn replayed(mut self) -> Self {
        self.replay = true;
        self
    }
}

/// Deserialize a present field as `Some`, keeping JSON `null` as `Some(Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
