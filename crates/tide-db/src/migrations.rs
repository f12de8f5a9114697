//! # Database Migrations
//!
//! Embedded SQL migrations for the internal sync tables.
//!
//! ## Tables
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  001_bucket_storage.sql                                                 │
//! │    ps_buckets       bucket cursor, target op, add_checksum              │
//! │    ps_oplog         (bucket, op_id) → op, row, data, checksum           │
//! │    ps_updated_rows  rows touched since the last materialization         │
//! │    ps_untyped       synced rows without a declared table                │
//! │    ps_kv            client_id, local write target, last sync time       │
//! │                                                                         │
//! │  002_crud_queue.sql                                                     │
//! │    ps_crud          id AUTOINCREMENT, tx_id, data                       │
//! │    ps_tx            current / next local transaction id                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Application tables are not migrations: they are views generated from the
//! declared schema by [`crate::Database::apply_schema`].
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Write idempotent SQL (use `IF NOT EXISTS` where possible)
//! 3. **NEVER** modify existing migrations - always add new ones

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns `(total_migrations, applied_migrations)` for diagnostics.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}
