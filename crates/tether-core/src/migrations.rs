// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for tether-core.
//!
//! Every agent instance owns its own SQLite database. The schema is embedded
//! and applied whenever an instance store is opened.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use tether_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/chat/room-1.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all instance-store migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
