// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Protocol - JSON frames exchanged between agent instances and clients
//!
//! Every agent instance is reachable over a persistent WebSocket connection.
//! Both directions carry JSON objects tagged with a `type` field.
//!
//! # Frames
//!
//! | Direction | `type` | Purpose |
//! |-----------|--------|---------|
//! | server → client | `identity` | Instance name and agent type |
//! | server → client | `state` | Full state snapshot |
//! | server → client | `state-error` | Rejected state-sync (e.g. readonly) |
//! | server → client | `mcp-servers` | Auxiliary capability list |
//! | server → client | `rpc-response` | Result, stream chunk or error for a request |
//! | server → client | `stream-resuming` | Offer to replay an interrupted stream |
//! | server → client | `stream-chunk` | Live or replayed resumable stream chunk |
//! | client → server | `state` | Replace the state |
//! | client → server | `rpc-request` | Invoke a callable method |
//! | client → server | `rpc-cancel` | Cancel an in-flight request |
//! | client → server | `stream-resume-ack` | Accept a resume offer |
//!
//! # Usage
//!
//! ```ignore
//! use tether_protocol::{ClientFrame, ServerFrame};
//!
//! let request = ClientFrame::RpcRequest {
//!     id: "1".to_string(),
//!     method: "incrementCount".to_string(),
//!     args: vec![],
//! };
//! socket.send(request.encode()?).await?;
//!
//! if let Some(ServerFrame::RpcResponse(resp)) = ServerFrame::decode(&reply) {
//!     assert!(resp.is_terminal());
//! }
//! ```

pub mod frame;

pub use frame::{
    ClientFrame, FrameError, READONLY_ERROR, RpcResponse, ServerFrame, StreamChunk,
};
