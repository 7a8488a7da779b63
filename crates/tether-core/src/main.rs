// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether - durable agent host
//!
//! Serves the built-in `counter` agent over WebSocket at
//! `/agents/counter/{name}`. Instances live in one SQLite database each under
//! `TETHER_DATA_DIR`.

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{error, info};

use tether_core::config::Config;
use tether_core::runtime::AgentRuntimeBuilder;
use tether_core::{Agent, CallContext, MethodTable, server};

/// Shared counter. Clients may edit the state directly or call
/// `increment`/`reset`.
struct Counter;

fn count(state: &Value) -> i64 {
    state["count"].as_i64().unwrap_or(0)
}

impl Agent for Counter {
    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .callable("increment", |ctx: CallContext<Self>, args| async move {
                let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                let next = count(&ctx.state().await) + by;
                ctx.set_state(json!({ "count": next })).await?;
                Ok::<_, anyhow::Error>(json!(next))
            })
            .describe("increment", "Add to the counter (default 1)")
            .callable("reset", |ctx: CallContext<Self>, _args| async move {
                ctx.set_state(json!({ "count": 0 })).await?;
                Ok::<_, anyhow::Error>(Value::Null)
            })
    }

    fn initial_state(&self) -> Option<Value> {
        Some(json!({ "count": 0 }))
    }

    fn on_error(&self, error: &anyhow::Error) {
        error!(agent = "counter", error = %error, "Agent error");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether_core=info".parse()?),
        )
        .init();

    info!("Starting Tether");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        data_dir = %config.data_dir.display(),
        http_addr = %config.http_addr,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Configuration loaded"
    );

    let runtime = AgentRuntimeBuilder::from_config(&config)
        .agent("counter", || Counter)
        .build()?;

    let restored = runtime.restore().await?;
    info!(restored, "Instances with pending alarms restored");

    server::serve(runtime.clone(), config.http_addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down...");
    })
    .await?;

    runtime.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
