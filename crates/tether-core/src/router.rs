// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound frame routing.
//!
//! Text frames are decoded into [`ClientFrame`]s. Anything that does not
//! decode, or decodes with empty identifiers, is dropped without a reply.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tether_protocol::{ClientFrame, READONLY_ERROR, ServerFrame};
use tracing::{debug, trace};

use crate::agent::{Agent, Origin};
use crate::callable::{self, CallContext};
use crate::connection::Connection;
use crate::error::CoreError;
use crate::instance::Instance;

impl<A: Agent> Instance<A> {
    /// Handle one text frame from `connection`.
    ///
    /// State frames are applied before this returns. Calls and resume
    /// acknowledgements may take a while, so they are returned as futures
    /// for the caller to drive alongside further frames.
    pub async fn handle_message(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        text: &str,
    ) -> Option<BoxFuture<'static, ()>> {
        if !self.connections.is_current(connection) {
            debug!(connection_id = %connection.id(), "Dropping frame from superseded connection");
            return None;
        }
        let Some(frame) = ClientFrame::decode(text) else {
            trace!(connection_id = %connection.id(), "Dropping unrecognized frame");
            return None;
        };

        match frame {
            ClientFrame::State { state } => {
                let origin = Origin::Connection(connection.clone());
                if let Err(e) = self.apply_state(state, origin, true).await {
                    let error = match e {
                        CoreError::ReadonlyViolation { .. } => READONLY_ERROR.to_string(),
                        other => other.to_string(),
                    };
                    debug!(connection_id = %connection.id(), error = %error, "State frame rejected");
                    connection.send(ServerFrame::StateError { error });
                }
                None
            }
            ClientFrame::RpcRequest { id, method, args } => {
                if id.is_empty() || method.is_empty() {
                    trace!(connection_id = %connection.id(), "Dropping RPC without id or method");
                    return None;
                }

                let cancel = self.register_call(connection.id(), &id);
                let ctx = CallContext::for_connection(self.clone(), connection.clone(), id.clone(), cancel);
                let instance = self.clone();
                let connection = connection.clone();
                Some(
                    async move {
                        let connection_id = connection.id().to_string();
                        callable::dispatch(ctx, connection, id.clone(), method, args).await;
                        instance.finish_call(&connection_id, &id);
                    }
                    .boxed(),
                )
            }
            ClientFrame::RpcCancel { id } => {
                if !self.cancel_call(connection.id(), &id) {
                    trace!(connection_id = %connection.id(), request_id = %id, "Cancel for unknown call");
                }
                None
            }
            ClientFrame::StreamResumeAck { id } => {
                let instance = self.clone();
                let connection = connection.clone();
                Some(async move { instance.replay_stream(&connection, &id).await }.boxed())
            }
        }
    }
}
