// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent instances and their command loop.
//!
//! An [`Instance`] is one named, durable copy of an agent type with its own
//! store. All work for an instance is driven by a single task spawned with
//! [`Instance::spawn`]: commands (connects, frames, disconnects, server-side
//! calls, workflow callbacks) arrive over a channel and are processed in
//! order, while long-running calls and alarm handling run as futures polled
//! by the same task. Nothing of one instance ever runs in parallel with
//! itself, which keeps state mutations totally ordered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tether_protocol::ServerFrame;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Agent;
use crate::callable::{CallContext, MethodInfo, MethodTable, ReturnValue};
use crate::config::InstanceConfig;
use crate::connection::{
    AttachmentAccessor, ConnectRequest, Connection, ConnectionRegistry, MemoryAttachment,
    RawConnection, StoredAttachment,
};
use crate::error::CoreError;
use crate::persistence::Persistence;
use crate::streams::StreamTracker;
use crate::workflow::{WorkflowCallback, WorkflowEngine};

type InFlight = FuturesUnordered<BoxFuture<'static, ()>>;

/// One named instance of an agent type.
pub struct Instance<A: Agent> {
    name: String,
    agent_type: String,
    agent: A,
    methods: MethodTable<A>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) config: InstanceConfig,
    pub(crate) connections: ConnectionRegistry,
    /// Parsed current state; `None` until first read.
    pub(crate) state_cache: Mutex<Option<Value>>,
    /// Next scheduler wake time.
    pub(crate) alarm: watch::Sender<Option<DateTime<Utc>>>,
    pub(crate) streams: StreamTracker,
    pub(crate) workflow_engine: Option<Arc<dyn WorkflowEngine>>,
    /// Cancellation tokens of in-flight calls, keyed by (connection, request).
    pub(crate) calls: Mutex<HashMap<(String, String), CancellationToken>>,
}

impl<A: Agent> Instance<A> {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        agent: A,
        persistence: Arc<dyn Persistence>,
        config: InstanceConfig,
    ) -> Self {
        let (alarm, _) = watch::channel(None);
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            agent,
            methods: A::methods(),
            streams: StreamTracker::new(persistence.clone(), &config),
            persistence,
            config,
            connections: ConnectionRegistry::new(),
            state_cache: Mutex::new(None),
            alarm,
            workflow_engine: None,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the engine that executes workflows started by this instance.
    pub fn with_workflow_engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.workflow_engine = Some(engine);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn methods(&self) -> &MethodTable<A> {
        &self.methods
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Methods invokable over the wire.
    pub fn callable_methods(&self) -> Vec<MethodInfo> {
        self.methods.callable_methods()
    }

    /// Send a frame to every attached connection not in `exclude`.
    pub fn broadcast(&self, frame: &ServerFrame, exclude: &[&str]) {
        self.connections.broadcast(frame, exclude);
    }

    /// Rehydrate after (re)creation: restore the active stream, re-arm the
    /// scheduler and run the start hook.
    #[instrument(skip(self), fields(instance = %self.name, agent = %self.agent_type))]
    pub async fn start(&self) -> Result<(), CoreError> {
        if let Err(e) = self.streams.restore().await {
            warn!(error = %e, "Failed to restore active stream");
        }
        self.rearm().await?;

        if let Err(e) = self.agent.on_start(self).await {
            self.agent.on_error(&e);
        }
        debug!("Instance started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Build a raw connection whose attribute bag is persisted or kept in
    /// memory, depending on configuration.
    pub async fn raw_connection(
        &self,
        id: impl Into<String>,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> RawConnection {
        let id = id.into();
        let attachment: Arc<dyn AttachmentAccessor> = if self.config.preserve_connection_state {
            match StoredAttachment::load(id.clone(), self.persistence.clone()).await {
                Ok(stored) => Arc::new(stored),
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Falling back to in-memory attachment");
                    Arc::new(MemoryAttachment::default())
                }
            }
        } else {
            Arc::new(MemoryAttachment::default())
        };

        RawConnection {
            id,
            sender,
            attachment,
        }
    }

    /// Attach a connection and run the handshake: identity, state and
    /// capability frames, a resume offer for the active stream, then the
    /// connect hook.
    #[instrument(skip_all, fields(instance = %self.name, connection_id = %raw.id))]
    pub async fn connect(&self, raw: RawConnection, request: ConnectRequest) -> Arc<Connection> {
        // Materializing the initial state broadcasts it; do that before the
        // new connection is registered so it only sees the handshake frame.
        let state = self.state().await;

        let connection = self.connections.wrap(raw);
        if self
            .agent
            .should_connection_be_readonly(&connection, &request)
        {
            if let Err(e) = connection.set_readonly(true).await {
                warn!(error = %e, "Failed to mark connection readonly");
            }
        }

        if self.agent.send_identity_on_connect() {
            connection.send(ServerFrame::Identity {
                name: self.name.clone(),
                agent: self.agent_type.clone(),
            });
        }
        connection.send(ServerFrame::State { state });
        connection.send(ServerFrame::McpServers {
            servers: self.agent.mcp_servers(),
        });
        self.offer_stream_resume(&connection).await;

        if let Err(e) = self.agent.on_connect(self, &connection, &request).await {
            self.agent.on_error(&e);
        }

        info!(
            readonly = connection.is_readonly(),
            connections = self.connections.len(),
            "Connection attached"
        );
        connection
    }

    /// Detach a connection and run the close hook. A connection that was
    /// superseded by a newer transport with the same id is ignored, so the
    /// old socket closing never detaches its successor.
    #[instrument(skip_all, fields(instance = %self.name, connection_id = %connection.id()))]
    pub async fn disconnect(&self, connection: &Arc<Connection>) {
        if !self.connections.remove_current(connection) {
            debug!("Disconnect for superseded or unknown connection");
            return;
        }
        self.streams.forget(connection.id());

        if !self.config.preserve_connection_state {
            connection.discard_attachment().await;
        }
        if let Err(e) = self.agent.on_close(self, connection).await {
            self.agent.on_error(&e);
        }
        info!(connections = self.connections.len(), "Connection detached");
    }

    /// Flip the readonly flag of an attached connection. Returns false if no
    /// such connection is attached.
    pub async fn set_readonly_by_id(
        &self,
        connection_id: &str,
        readonly: bool,
    ) -> Result<bool, CoreError> {
        let Some(connection) = self.connections.get(connection_id) else {
            return Ok(false);
        };
        connection.set_readonly(readonly).await?;
        debug!(instance = %self.name, connection_id, readonly, "Readonly flag updated");
        Ok(true)
    }

    /// Readonly flag of an attached connection, `None` if not attached.
    pub fn is_readonly_by_id(&self, connection_id: &str) -> Option<bool> {
        self.connections
            .get(connection_id)
            .map(|c| c.is_readonly())
    }

    // ------------------------------------------------------------------
    // Server-side calls
    // ------------------------------------------------------------------

    /// Invoke any plain method (callable or internal) from server-side code.
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<ReturnValue> {
        let ctx = CallContext::server(self.clone());
        let call = self.methods.invoke_internal(method, ctx, args)?;
        call.await
    }

    pub(crate) fn register_call(&self, connection_id: &str, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(
                (connection_id.to_string(), request_id.to_string()),
                token.clone(),
            );
        }
        token
    }

    pub(crate) fn finish_call(&self, connection_id: &str, request_id: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.remove(&(connection_id.to_string(), request_id.to_string()));
        }
    }

    /// Cancel an in-flight call. Returns false if it is not running.
    pub(crate) fn cancel_call(&self, connection_id: &str, request_id: &str) -> bool {
        let token = self.calls.lock().ok().and_then(|calls| {
            calls
                .get(&(connection_id.to_string(), request_id.to_string()))
                .cloned()
        });
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Command loop
    // ------------------------------------------------------------------

    /// Spawn the command loop. With an idle timeout the loop exits once the
    /// instance has had no connections, calls or armed alarm for that long.
    pub fn spawn(self: Arc<Self>, idle_timeout: Option<Duration>) -> InstanceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = InstanceHandle {
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            tx,
        };
        tokio::spawn(self.run(rx, idle_timeout));
        handle
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<InstanceCommand>,
        idle_timeout: Option<Duration>,
    ) {
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut alarm_rx = self.alarm.subscribe();
        let far_future = Duration::from_secs(86_400 * 365);

        info!(instance = %self.name, agent = %self.agent_type, "Instance loop started");

        loop {
            let wake_at = *alarm_rx.borrow_and_update();
            let alarm_deadline = wake_at.map(deadline);
            let idle = idle_timeout.filter(|_| {
                in_flight.is_empty() && wake_at.is_none() && self.connections.is_empty()
            });

            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(InstanceCommand::Shutdown) => break,
                    Some(command) => {
                        if let Some(work) = self.handle_command(command).await {
                            in_flight.push(work);
                        }
                    }
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                Ok(()) = alarm_rx.changed() => {}
                _ = tokio::time::sleep_until(
                    alarm_deadline.unwrap_or_else(|| tokio::time::Instant::now() + far_future)
                ), if alarm_deadline.is_some() => {
                    // Disarm locally so the loop does not fire again while the
                    // due jobs run; the run re-arms when it is done.
                    self.alarm.send_replace(None);
                    alarm_rx.borrow_and_update();
                    let this = self.clone();
                    in_flight.push(async move { this.alarm().await }.boxed());
                }
                _ = tokio::time::sleep(idle.unwrap_or(far_future)), if idle.is_some() => {
                    info!(instance = %self.name, "Instance idle, stopping");
                    break;
                }
            }
        }

        // Let in-flight calls finish so their responses and writes land.
        while in_flight.next().await.is_some() {}
        if let Err(e) = self.flush_stream().await {
            error!(instance = %self.name, error = %e, "Failed to flush stream buffer on stop");
        }
        info!(instance = %self.name, "Instance loop stopped");
    }

    async fn handle_command(
        self: &Arc<Self>,
        command: InstanceCommand,
    ) -> Option<BoxFuture<'static, ()>> {
        match command {
            InstanceCommand::Connect {
                id,
                sender,
                request,
                ready,
            } => {
                let raw = self.raw_connection(id, sender).await;
                let connection = self.connect(raw, request).await;
                let _ = ready.send(connection);
                None
            }
            InstanceCommand::Message { connection, text } => {
                self.handle_message(&connection, &text).await
            }
            InstanceCommand::Disconnect { connection } => {
                self.disconnect(&connection).await;
                None
            }
            InstanceCommand::SetReadonly {
                connection_id,
                readonly,
                reply,
            } => {
                let _ = reply.send(self.set_readonly_by_id(&connection_id, readonly).await);
                None
            }
            InstanceCommand::Call {
                method,
                args,
                reply,
            } => {
                let this = self.clone();
                Some(
                    async move {
                        let result = this.call(&method, args).await;
                        let _ = reply.send(result.map(ReturnValue::into_result));
                    }
                    .boxed(),
                )
            }
            InstanceCommand::Workflow { callback, reply } => {
                let this = self.clone();
                Some(
                    async move {
                        let _ = reply.send(this.handle_workflow_callback(callback).await);
                    }
                    .boxed(),
                )
            }
            InstanceCommand::Shutdown => None,
        }
    }
}

fn deadline(at: DateTime<Utc>) -> tokio::time::Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + delay
}

// ============================================================================
// Handle
// ============================================================================

/// Commands processed by an instance's loop.
pub enum InstanceCommand {
    Connect {
        id: String,
        sender: mpsc::UnboundedSender<ServerFrame>,
        request: ConnectRequest,
        ready: oneshot::Sender<Arc<Connection>>,
    },
    Message {
        connection: Arc<Connection>,
        text: String,
    },
    Disconnect {
        connection: Arc<Connection>,
    },
    SetReadonly {
        connection_id: String,
        readonly: bool,
        reply: oneshot::Sender<Result<bool, CoreError>>,
    },
    Call {
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<anyhow::Result<Option<Value>>>,
    },
    Workflow {
        callback: WorkflowCallback,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Shutdown,
}

/// Cloneable, type-erased address of a running instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    name: String,
    agent_type: String,
    tx: mpsc::UnboundedSender<InstanceCommand>,
}

impl InstanceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Whether the instance loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> CoreError {
        CoreError::InstanceClosed {
            name: self.name.clone(),
        }
    }

    fn send(&self, command: InstanceCommand) -> Result<(), CoreError> {
        self.tx.send(command).map_err(|_| self.closed())
    }

    /// Attach a connection; resolves once the handshake and connect hook ran.
    pub async fn connect(
        &self,
        id: impl Into<String>,
        sender: mpsc::UnboundedSender<ServerFrame>,
        request: ConnectRequest,
    ) -> Result<Arc<Connection>, CoreError> {
        let (ready, rx) = oneshot::channel();
        self.send(InstanceCommand::Connect {
            id: id.into(),
            sender,
            request,
            ready,
        })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Deliver a text frame received on `connection`.
    pub fn message(
        &self,
        connection: &Arc<Connection>,
        text: impl Into<String>,
    ) -> Result<(), CoreError> {
        self.send(InstanceCommand::Message {
            connection: connection.clone(),
            text: text.into(),
        })
    }

    /// Report that the transport behind `connection` has closed.
    pub fn disconnect(&self, connection: &Arc<Connection>) -> Result<(), CoreError> {
        self.send(InstanceCommand::Disconnect {
            connection: connection.clone(),
        })
    }

    pub async fn set_readonly(&self, connection_id: &str, readonly: bool) -> Result<bool, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(InstanceCommand::SetReadonly {
            connection_id: connection_id.to_string(),
            readonly,
            reply,
        })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Invoke a method from server-side code.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(InstanceCommand::Call {
            method: method.to_string(),
            args,
            reply,
        })?;
        rx.await.map_err(|_| anyhow::Error::from(self.closed()))?
    }

    /// Deliver a workflow engine callback.
    pub async fn workflow_callback(&self, callback: WorkflowCallback) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(InstanceCommand::Workflow { callback, reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Stop the loop after in-flight work drains.
    pub fn shutdown(&self) {
        let _ = self.tx.send(InstanceCommand::Shutdown);
    }
}
