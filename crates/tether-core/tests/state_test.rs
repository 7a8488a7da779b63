// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for state sync and the connect handshake.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use tether_core::Origin;
use tether_core::connection::ConnectRequest;
use tether_core::persistence::{Persistence, SqlitePersistence};
use tether_protocol::ServerFrame;

#[tokio::test]
async fn test_handshake_frame_order() {
    let ctx = TestContext::new().await;
    let mut client = ctx.connect_raw("c", ConnectRequest::default()).await;

    assert_eq!(
        client.frames(),
        vec![
            ServerFrame::Identity {
                name: "board-1".to_string(),
                agent: "board".to_string(),
            },
            ServerFrame::State {
                state: json!({"count": 0, "ticks": 0})
            },
            ServerFrame::McpServers { servers: vec![] },
        ]
    );
}

#[tokio::test]
async fn test_corrupted_state_recovers_to_default() {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());
    persistence.save_state("{\"count\": ", None).await.unwrap();

    let ctx = TestContext::with_persistence(persistence).await;
    assert_eq!(ctx.instance.state().await, json!({"count": 0, "ticks": 0}));

    // The default replaced the unreadable row.
    let stored = ctx.persistence.load_state().await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&stored).unwrap(),
        json!({"count": 0, "ticks": 0})
    );
}

#[tokio::test]
async fn test_state_frame_syncs_other_connections() {
    let ctx = TestContext::new().await;
    let mut a = ctx.connect("a").await;
    let mut b = ctx.connect("b").await;

    ctx.send(&a, &state_frame(json!({"count": 5, "ticks": 0})))
        .await;

    assert!(a.frames().is_empty());
    assert_eq!(
        b.frames(),
        vec![ServerFrame::State {
            state: json!({"count": 5, "ticks": 0})
        }]
    );

    let history = ctx.instance.state_history(1).await.unwrap();
    assert_eq!(history[0].origin.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let ctx = TestContext::new().await;
    let mut client = ctx.connect("c").await;

    for text in [
        "",
        "[]",
        "{}",
        r#"{"type":"state"}"#,
        r#"{"type":"rpc-request","id":"1"}"#,
        r#"{"type":"rpc-request","id":"1","method":""}"#,
        r#"{"type":"rpc-cancel"}"#,
        r#"{"type":"no-such-frame","id":"1"}"#,
    ] {
        ctx.send(&client, text).await;
    }

    assert!(client.frames().is_empty());
    assert_eq!(ctx.instance.state().await, json!({"count": 0, "ticks": 0}));
}

#[tokio::test]
async fn test_state_survives_rehydration() {
    let ctx = TestContext::new().await;
    let mut client = ctx.connect("c").await;
    ctx.rpc(&mut client, "1", "increment", json!([])).await;
    ctx.rpc(&mut client, "2", "increment", json!([])).await;

    let revived = TestContext::with_persistence(ctx.persistence.clone()).await;
    assert_eq!(revived.instance.state().await["count"], json!(2));
}

#[tokio::test]
async fn test_reused_connection_id_keeps_newest_socket() {
    let ctx = TestContext::new().await;
    let mut old = ctx.connect("dup").await;
    let mut new = ctx.connect("dup").await;
    assert!(old.connection.is_superseded());
    assert_eq!(ctx.instance.connections().len(), 1);

    // Frames from the replaced socket are not applied.
    ctx.send(&old, &state_frame(json!({"count": 7, "ticks": 0})))
        .await;
    assert_eq!(ctx.instance.state().await["count"], json!(0));

    // The replaced socket closing leaves the newer one attached.
    ctx.instance.disconnect(&old.connection).await;
    assert_eq!(ctx.instance.connections().len(), 1);

    ctx.instance
        .set_state(json!({"count": 9, "ticks": 0}), Origin::Server)
        .await
        .unwrap();
    assert_eq!(
        new.frames(),
        vec![ServerFrame::State {
            state: json!({"count": 9, "ticks": 0})
        }]
    );
    assert!(old.frames().is_empty());

    ctx.instance.disconnect(&new.connection).await;
    assert!(ctx.instance.connections().is_empty());
}
