//! # Repositories
//!
//! - [`bucket`] - Operation log, checksums, compaction, materialization
//! - [`crud`] - Local write queue
//!
//! Both hold a cloned [`crate::Database`] handle and share the `ps_kv`
//! helpers below.

pub mod bucket;
pub mod crud;

use sqlx::SqliteConnection;

use crate::error::DbResult;

pub(crate) const KV_CLIENT_ID: &str = "client_id";
/// Write checkpoint the server must reach before synced data may replace local writes.
pub(crate) const KV_LOCAL_TARGET: &str = "local_target_op";
/// Highest write checkpoint seen in an applied checkpoint.
pub(crate) const KV_APPLIED_WRITE: &str = "applied_write_checkpoint";
pub(crate) const KV_LAST_SYNCED: &str = "last_synced_at";

pub(crate) async fn kv_get(conn: &mut SqliteConnection, key: &str) -> DbResult<Option<String>> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM ps_kv WHERE key = ?")
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(value.flatten())
}

pub(crate) async fn kv_set(conn: &mut SqliteConnection, key: &str, value: Option<&str>) -> DbResult<()> {
    sqlx::query("INSERT OR REPLACE INTO ps_kv (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(conn)
        .await?;
    Ok(())
}
