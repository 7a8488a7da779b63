// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/WebSocket host.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /agents/{agent}/{name}` (upgrade) | 101, then frames both ways |
//! | `GET /agents/{agent}/{name}` (no upgrade) | 426 |
//! | `GET /health` | 200 |
//! | anything else, or an unknown agent type | 404 |
//!
//! A connection id can be supplied with `?id=`; otherwise a random one is
//! assigned. Reconnecting with the same id picks up its preserved
//! connection state.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tether_protocol::ServerFrame;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectRequest;
use crate::error::CoreError;
use crate::instance::InstanceHandle;
use crate::runtime::AgentRuntime;

/// Build the router for `runtime`.
pub fn router(runtime: AgentRuntime) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/{agent}/{name}", get(agent_socket))
        .fallback(not_found)
        .with_state(runtime)
}

/// Serve `runtime` on `addr` until `shutdown` resolves.
pub async fn serve<F>(runtime: AgentRuntime, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn agent_socket(
    State(runtime): State<AgentRuntime>,
    Path((agent, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !runtime.has_agent(&agent) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(agent = %agent, name = %name, reason = %rejection, "Rejecting non-upgrade request");
            return (StatusCode::UPGRADE_REQUIRED, "Expected a WebSocket upgrade").into_response();
        }
    };

    let handle = match runtime.instance(&agent, &name).await {
        Ok(handle) => handle,
        Err(e @ CoreError::InvalidInstanceName { .. }) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(e) => {
            error!(agent = %agent, name = %name, error = %e, "Failed to start instance");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let connection_id = query
        .get("id")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let request = ConnectRequest {
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, handle, connection_id, request))
}

async fn handle_socket(
    socket: WebSocket,
    handle: InstanceHandle,
    connection_id: String,
    request: ConnectRequest,
) {
    let (mut sink, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Frames queued during the handshake are flushed once the send task runs.
    let connection = match handle.connect(connection_id.clone(), tx, request).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Instance refused connection");
            let _ = sink.close().await;
            return;
        }
    };
    info!(instance = %handle.name(), agent = %handle.agent_type(), connection_id = %connection_id, "WebSocket connected");

    let send_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %send_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            message = receiver.next() => message,
            _ = connection.superseded() => {
                info!(connection_id = %connection_id, "WebSocket superseded by a newer one");
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(Message::Text(text)) => {
                if handle.message(&connection, text.to_string()).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %connection_id, "Ignoring binary message");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    send_task.abort();
    if handle.disconnect(&connection).is_err() {
        debug!(connection_id = %connection_id, "Instance stopped before disconnect");
    }
    info!(instance = %handle.name(), connection_id = %connection_id, "WebSocket closed");
}
