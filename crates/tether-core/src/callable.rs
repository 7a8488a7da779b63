// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callable method dispatch.
//!
//! Each agent type registers its handlers in a [`MethodTable`]. Only entries
//! registered with [`MethodTable::callable`] or [`MethodTable::streaming`] can
//! be invoked over the wire; plain entries registered with
//! [`MethodTable::method`] are internal and serve as scheduler callbacks.
//!
//! Inheritance is expressed by building a table on top of another one with
//! [`MethodTable::inherit`]; registering a name that already exists replaces
//! the inherited handler.
//!
//! ```ignore
//! fn methods() -> MethodTable<Self> {
//!     MethodTable::inherit(counter_methods())
//!         .callable("increment", |ctx, _args| async move {
//!             let next = ctx.state().await["count"].as_i64().unwrap_or(0) + 2;
//!             ctx.set_state(json!({ "count": next })).await?;
//!             Ok(json!(next))
//!         })
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tether_protocol::{RpcResponse, ServerFrame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::{Agent, Origin};
use crate::connection::Connection;
use crate::error::CoreError;
use crate::instance::Instance;

/// Result of a callable method.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// No result; the `result` field is omitted from the response.
    Void,
    /// A JSON value, including an explicit `null`.
    Value(Value),
}

impl ReturnValue {
    pub fn into_result(self) -> Option<Value> {
        match self {
            Self::Void => None,
            Self::Value(v) => Some(v),
        }
    }
}

impl From<Value> for ReturnValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<()> for ReturnValue {
    fn from(_: ()) -> Self {
        Self::Void
    }
}

impl From<Option<Value>> for ReturnValue {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Void, Self::Value)
    }
}

type PlainHandler<A> =
    Arc<dyn Fn(CallContext<A>, Vec<Value>) -> BoxFuture<'static, anyhow::Result<ReturnValue>> + Send + Sync>;

type StreamingHandler<A> = Arc<
    dyn Fn(CallContext<A>, Vec<Value>, StreamHandle) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

enum Handler<A: Agent> {
    Plain(PlainHandler<A>),
    Streaming(StreamingHandler<A>),
}

impl<A: Agent> Clone for Handler<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(h) => Self::Plain(h.clone()),
            Self::Streaming(h) => Self::Streaming(h.clone()),
        }
    }
}

struct MethodEntry<A: Agent> {
    handler: Handler<A>,
    callable: bool,
    description: Option<String>,
}

impl<A: Agent> Clone for MethodEntry<A> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            callable: self.callable,
            description: self.description.clone(),
        }
    }
}

/// Description of a callable method, for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub description: Option<String>,
    pub streaming: bool,
}

/// Flattened name → handler table of an agent type.
pub struct MethodTable<A: Agent> {
    entries: HashMap<String, MethodEntry<A>>,
}

impl<A: Agent> Default for MethodTable<A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<A: Agent> MethodTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a base table. Later registrations override inherited ones.
    pub fn inherit(base: MethodTable<A>) -> Self {
        base
    }

    /// Register a method invokable over the wire.
    pub fn callable<F, Fut, R>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext<A>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<ReturnValue> + 'static,
    {
        self.insert(name, Handler::Plain(plain(handler)), true)
    }

    /// Register a streaming method invokable over the wire.
    pub fn streaming<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext<A>, Vec<Value>, StreamHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: StreamingHandler<A> = Arc::new(
            move |ctx: CallContext<A>, args: Vec<Value>, stream: StreamHandle| {
                handler(ctx, args, stream).boxed()
            },
        );
        self.insert(name, Handler::Streaming(handler), true)
    }

    /// Register an internal method (not invokable over the wire).
    pub fn method<F, Fut, R>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext<A>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<ReturnValue> + 'static,
    {
        self.insert(name, Handler::Plain(plain(handler)), false)
    }

    /// Attach a description to a registered method.
    pub fn describe(mut self, name: &str, description: &str) -> Self {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.description = Some(description.to_string());
        }
        self
    }

    fn insert(mut self, name: &str, handler: Handler<A>, callable: bool) -> Self {
        self.entries.insert(
            name.to_string(),
            MethodEntry {
                handler,
                callable,
                description: None,
            },
        );
        self
    }

    /// Whether any handler (callable or not) has this name.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_streaming(&self, name: &str) -> bool {
        matches!(
            self.entries.get(name).map(|e| &e.handler),
            Some(Handler::Streaming(_))
        )
    }

    /// Callable methods sorted by name.
    pub fn callable_methods(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<MethodInfo> = self
            .entries
            .iter()
            .filter(|(_, e)| e.callable)
            .map(|(name, e)| MethodInfo {
                name: name.clone(),
                description: e.description.clone(),
                streaming: matches!(e.handler, Handler::Streaming(_)),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    fn resolve(&self, name: &str) -> Result<&MethodEntry<A>, CoreError> {
        match self.entries.get(name) {
            None => Err(CoreError::MethodNotFound {
                method: name.to_string(),
            }),
            Some(entry) if !entry.callable => Err(CoreError::NotCallable {
                method: name.to_string(),
            }),
            Some(entry) => Ok(entry),
        }
    }

    /// Invoke a plain handler from server-side code, bypassing the callable
    /// marker. Used for scheduled callbacks and server-side calls. Streaming
    /// handlers need a client connection and are reported as not callable.
    pub(crate) fn invoke_internal(
        &self,
        name: &str,
        ctx: CallContext<A>,
        args: Vec<Value>,
    ) -> Result<BoxFuture<'static, anyhow::Result<ReturnValue>>, CoreError> {
        match self.entries.get(name).map(|e| &e.handler) {
            Some(Handler::Plain(h)) => Ok(h(ctx, args)),
            Some(Handler::Streaming(_)) => Err(CoreError::NotCallable {
                method: name.to_string(),
            }),
            None => Err(CoreError::MethodNotFound {
                method: name.to_string(),
            }),
        }
    }
}

fn plain<A, F, Fut, R>(handler: F) -> PlainHandler<A>
where
    A: Agent,
    F: Fn(CallContext<A>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<ReturnValue> + 'static,
{
    Arc::new(move |ctx: CallContext<A>, args: Vec<Value>| {
        handler(ctx, args)
            .map(|r: anyhow::Result<R>| r.map(Into::<ReturnValue>::into))
            .boxed()
    })
}

// ============================================================================
// Call context
// ============================================================================

/// Explicit per-call context handed to every handler.
pub struct CallContext<A: Agent> {
    instance: Arc<Instance<A>>,
    connection: Option<Arc<Connection>>,
    request_id: Option<String>,
    cancel: CancellationToken,
}

impl<A: Agent> Clone for CallContext<A> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            connection: self.connection.clone(),
            request_id: self.request_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A: Agent> CallContext<A> {
    /// Context for a call made by a client connection.
    pub fn for_connection(
        instance: Arc<Instance<A>>,
        connection: Arc<Connection>,
        request_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance,
            connection: Some(connection),
            request_id: Some(request_id.into()),
            cancel,
        }
    }

    /// Context for server-originated work.
    pub fn server(instance: Arc<Instance<A>>) -> Self {
        Self {
            instance,
            connection: None,
            request_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn agent(&self) -> &A {
        self.instance.agent()
    }

    pub fn instance(&self) -> &Arc<Instance<A>> {
        &self.instance
    }

    /// The connection that made the call, `None` for server-originated calls.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Cancelled when the client sends `rpc-cancel` for this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn origin(&self) -> Origin {
        match &self.connection {
            Some(conn) => Origin::Connection(conn.clone()),
            None => Origin::Server,
        }
    }

    /// Current instance state.
    pub async fn state(&self) -> Value {
        self.instance.state().await
    }

    /// Mutate state on behalf of the caller; readonly callers are rejected.
    pub async fn set_state(&self, state: Value) -> Result<(), CoreError> {
        self.instance.set_state(state, self.origin()).await
    }
}

// ============================================================================
// Stream handle
// ============================================================================

const STREAM_OPEN: bool = false;
const STREAM_CLOSED: bool = true;

/// Control handle for a streaming response.
///
/// Open until the first `end` or `error`; later calls are no-ops.
#[derive(Clone)]
pub struct StreamHandle {
    request_id: String,
    connection: Arc<Connection>,
    closed: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
}

impl StreamHandle {
    pub fn new(request_id: impl Into<String>, connection: Arc<Connection>) -> Self {
        Self {
            request_id: request_id.into(),
            connection,
            closed: Arc::new(AtomicBool::new(STREAM_OPEN)),
            sent: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Send an intermediate chunk. Returns false once the stream is closed.
    pub fn send(&self, chunk: impl Into<Value>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.connection
            .send(ServerFrame::RpcResponse(RpcResponse::chunk(
                self.request_id.clone(),
                chunk.into(),
            )))
    }

    /// Close the stream successfully.
    pub fn end(&self, result: impl Into<ReturnValue>) -> bool {
        if !self.close() {
            return false;
        }
        self.connection
            .send(ServerFrame::RpcResponse(RpcResponse::done(
                self.request_id.clone(),
                result.into().into_result(),
            )))
    }

    /// Close the stream with an error.
    pub fn error(&self, message: impl Into<String>) -> bool {
        if !self.close() {
            return false;
        }
        self.connection
            .send(ServerFrame::RpcResponse(RpcResponse::error(
                self.request_id.clone(),
                message,
            )))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) == STREAM_CLOSED
    }

    /// Number of chunks sent so far.
    pub fn chunks_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    fn close(&self) -> bool {
        self.closed
            .compare_exchange(STREAM_OPEN, STREAM_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    }
}

/// Invoke a callable on behalf of a connection and deliver exactly one
/// terminal response (preceded by chunks for streaming methods).
#[instrument(skip(ctx, connection, args), fields(connection_id = %connection.id()))]
pub(crate) async fn dispatch<A: Agent>(
    ctx: CallContext<A>,
    connection: Arc<Connection>,
    request_id: String,
    method: String,
    args: Vec<Value>,
) {
    let entry = match ctx.instance.methods().resolve(&method) {
        Ok(entry) => entry.clone(),
        Err(e) => {
            debug!(method = %method, error = %e, "Rejected RPC");
            connection.send(ServerFrame::RpcResponse(e.to_rpc_response(&request_id)));
            return;
        }
    };

    match entry.handler {
        Handler::Plain(handler) => {
            let outcome = AssertUnwindSafe(handler(ctx, args)).catch_unwind().await;
            let response = match outcome {
                Ok(Ok(value)) => RpcResponse::done(request_id, value.into_result()),
                Ok(Err(e)) => {
                    debug!(method = %method, error = %e, "Callable failed");
                    RpcResponse::error(request_id, e.to_string())
                }
                Err(panic) => {
                    warn!(method = %method, "Callable panicked");
                    RpcResponse::error(request_id, panic_message(panic.as_ref()))
                }
            };
            connection.send(ServerFrame::RpcResponse(response));
        }
        Handler::Streaming(handler) => {
            let stream = StreamHandle::new(request_id, connection);
            let outcome = AssertUnwindSafe(handler(ctx, args, stream.clone()))
                .catch_unwind()
                .await;
            match outcome {
                // Returning without closing ends the stream with no result.
                Ok(Ok(())) => {
                    stream.end(ReturnValue::Void);
                }
                Ok(Err(e)) => {
                    debug!(
                        method = %method,
                        chunks = stream.chunks_sent(),
                        error = %e,
                        "Streaming callable failed"
                    );
                    stream.error(e.to_string());
                }
                Err(panic) => {
                    warn!(method = %method, "Streaming callable panicked");
                    stream.error(panic_message(panic.as_ref()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRegistry, RawConnection};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionRegistry::new().wrap(RawConnection::in_memory("c", tx));
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<RpcResponse> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::RpcResponse(resp) = frame {
                out.push(resp);
            }
        }
        out
    }

    #[test]
    fn test_return_value_conversions() {
        assert_eq!(ReturnValue::from(()), ReturnValue::Void);
        assert_eq!(ReturnValue::from(None), ReturnValue::Void);
        assert_eq!(
            ReturnValue::from(json!(null)).into_result(),
            Some(Value::Null)
        );
        assert_eq!(ReturnValue::Void.into_result(), None);
    }

    #[tokio::test]
    async fn test_stream_handle_closes_once() {
        let (conn, mut rx) = connection();
        let stream = StreamHandle::new("r1", conn);

        assert!(stream.send(json!("a")));
        assert!(stream.end(json!("done")));
        assert!(!stream.end(json!("again")));
        assert!(!stream.error("late"));
        assert!(!stream.send(json!("b")));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], RpcResponse::chunk("r1", json!("a")));
        assert_eq!(frames[1], RpcResponse::done("r1", Some(json!("done"))));
        assert_eq!(stream.chunks_sent(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_first_wins() {
        let (conn, mut rx) = connection();
        let stream = StreamHandle::new("r2", conn);

        assert!(stream.error("boom"));
        assert!(!stream.end(()));
        assert!(stream.is_closed());

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![RpcResponse::error("r2", "boom")]);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "method panicked");
    }
}
