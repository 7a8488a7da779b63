// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tether-core integration tests.
//!
//! Provides a test agent, an in-memory instance and fake connections that
//! capture every outbound frame.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use tether_core::connection::ConnectRequest;
use tether_core::persistence::{Persistence, SqlitePersistence};
use tether_core::{Agent, CallContext, Connection, Instance, InstanceConfig, MethodTable};
use tether_protocol::{RpcResponse, ServerFrame};

/// Message board agent used across integration tests.
#[derive(Default)]
pub struct Board {
    pub errors: Mutex<Vec<String>>,
}

fn count(state: &Value, key: &str) -> i64 {
    state[key].as_i64().unwrap_or(0)
}

impl Agent for Board {
    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .callable("increment", |ctx: CallContext<Self>, _args| async move {
                let mut state = ctx.state().await;
                let next = count(&state, "count") + 1;
                state["count"] = json!(next);
                ctx.set_state(state).await?;
                Ok::<_, anyhow::Error>(json!(next))
            })
            .callable("get_state", |ctx: CallContext<Self>, _args| async move {
                Ok::<_, anyhow::Error>(ctx.state().await)
            })
            .callable("set_readonly", |ctx: CallContext<Self>, args| async move {
                let id = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("connection id required"))?
                    .to_string();
                let readonly = args.get(1).and_then(Value::as_bool).unwrap_or(true);
                let found = ctx.instance().set_readonly_by_id(&id, readonly).await?;
                Ok::<_, anyhow::Error>(json!(found))
            })
            .streaming("countdown", |_ctx: CallContext<Self>, args, stream| async move {
                let from = args.first().and_then(Value::as_i64).unwrap_or(3);
                for n in (1..=from).rev() {
                    stream.send(json!(n));
                }
                stream.end(json!("liftoff"));
                Ok::<(), anyhow::Error>(())
            })
            .streaming("explode", |_ctx: CallContext<Self>, _args, _stream| async move {
                Err::<(), _>(anyhow::anyhow!("boom before send"))
            })
            .method("tick", |ctx: CallContext<Self>, _args| async move {
                let mut state = ctx.state().await;
                let next = count(&state, "ticks") + 1;
                state["ticks"] = json!(next);
                ctx.set_state(state).await?;
                Ok::<_, anyhow::Error>(())
            })
    }

    fn initial_state(&self) -> Option<Value> {
        Some(json!({ "count": 0, "ticks": 0 }))
    }

    fn should_connection_be_readonly(&self, _connection: &Connection, request: &ConnectRequest) -> bool {
        request.query_param("mode") == Some("view")
    }

    fn on_error(&self, error: &anyhow::Error) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.to_string());
        }
    }
}

/// Instance plus the store behind it.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub instance: Arc<Instance<Board>>,
}

impl TestContext {
    pub async fn new() -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory store"),
        );
        Self::with_persistence(persistence).await
    }

    /// Rehydrate an instance from an existing store.
    pub async fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        let instance = Arc::new(Instance::new(
            "board-1",
            "board",
            Board::default(),
            persistence.clone(),
            InstanceConfig::default(),
        ));
        instance.start().await.expect("Failed to start instance");
        Self {
            persistence,
            instance,
        }
    }

    /// Attach a writable connection and discard its handshake frames.
    pub async fn connect(&self, id: &str) -> TestClient {
        self.connect_with(id, ConnectRequest::default()).await
    }

    /// Attach a connection flagged readonly by the connect hook.
    pub async fn connect_viewer(&self, id: &str) -> TestClient {
        let request = ConnectRequest {
            query: HashMap::from([("mode".to_string(), "view".to_string())]),
            ..Default::default()
        };
        self.connect_with(id, request).await
    }

    pub async fn connect_with(&self, id: &str, request: ConnectRequest) -> TestClient {
        let mut client = self.connect_raw(id, request).await;
        client.frames();
        client
    }

    /// Attach a connection keeping its handshake frames.
    pub async fn connect_raw(&self, id: &str, request: ConnectRequest) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let raw = self.instance.raw_connection(id, tx).await;
        let connection = self.instance.connect(raw, request).await;
        TestClient { connection, rx }
    }

    /// Deliver a text frame and drive any work it started to completion.
    pub async fn send(&self, client: &TestClient, text: &str) {
        if let Some(work) = self.instance.handle_message(&client.connection, text).await {
            work.await;
        }
    }

    pub async fn rpc(&self, client: &mut TestClient, id: &str, method: &str, args: Value) -> Vec<RpcResponse> {
        self.send(client, &rpc_frame(id, method, args)).await;
        client.responses()
    }

    pub fn errors(&self) -> Vec<String> {
        self.instance
            .agent()
            .errors
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

/// A fake transport capturing outbound frames.
pub struct TestClient {
    pub connection: Arc<Connection>,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

impl TestClient {
    pub fn id(&self) -> &str {
        self.connection.id()
    }

    /// Every frame received since the last drain.
    pub fn frames(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// RPC responses received since the last drain; other frames are dropped.
    pub fn responses(&mut self) -> Vec<RpcResponse> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::RpcResponse(resp) => Some(resp),
                _ => None,
            })
            .collect()
    }
}

pub fn rpc_frame(id: &str, method: &str, args: Value) -> String {
    json!({ "type": "rpc-request", "id": id, "method": method, "args": args }).to_string()
}

pub fn state_frame(state: Value) -> String {
    json!({ "type": "state", "state": state }).to_string()
}
