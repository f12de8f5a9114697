//! # Bucket Storage
//!
//! Sole writer of synced data and the authoritative source of sync progress.
//!
//! ## Apply Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Checkpoint Lifecycle                               │
//! │                                                                         │
//! │  {"checkpoint"}          set_target_checkpoint()  remove_buckets()      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  {"data"} × N            save_sync_data()                               │
//! │       │                  ┌────────────────────────────────────────┐     │
//! │       │                  │ one write transaction per batch        │     │
//! │       │                  │ ps_oplog += ops (op_id > last_op only) │     │
//! │       │                  │ ps_updated_rows += touched rows        │     │
//! │       │                  │ visible tables NOT touched             │     │
//! │       │                  └────────────────────────────────────────┘     │
//! │       ▼                                                                 │
//! │  {"checkpoint_complete"} sync_local()                                   │
//! │                          ┌────────────────────────────────────────┐     │
//! │                          │ 1. validate every bucket checksum      │     │
//! │                          │ 2. wait while local writes pending     │     │
//! │                          │ 3. one write transaction:              │     │
//! │                          │    fold touched rows → ps_data__*      │     │
//! │                          │ 4. notify table listeners              │     │
//! │                          └────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers only ever see fully validated checkpoints: a crash between data
//! batches leaves the op log ahead of the visible tables, and the next
//! checkpoint completes the job.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tide_core::{
    fold_row_ops, BucketChecksum, BucketRequest, Checkpoint, Checksum, OpId, OpType, OplogEntry,
    RowState, SyncDataBatch,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{kv_get, kv_set, KV_APPLIED_WRITE, KV_CLIENT_ID, KV_LAST_SYNCED, KV_LOCAL_TARGET};
use crate::error::{DbError, DbResult};
use crate::pool::{Database, TableUpdate};
use crate::schema::quote_ident;

const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

// =============================================================================
// Result Types
// =============================================================================

/// One bucket whose local checksum disagrees with the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFailure {
    pub bucket: String,
    pub expected: Checksum,
    pub actual: Checksum,
}

/// Result of validating every bucket of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChecksumValidation {
    pub failed: Vec<ChecksumFailure>,
}

impl ChecksumValidation {
    pub fn is_valid(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_buckets(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.bucket.clone()).collect()
    }
}

/// Outcome of [`BucketStorage::sync_local`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncLocalOutcome {
    /// Checkpoint validated and materialized. Lists the tables whose rows changed.
    Applied { tables: BTreeSet<String> },
    /// Valid, but local writes must reach the server first.
    PendingUploads,
    /// At least one bucket failed validation. Nothing was materialized.
    ChecksumFailed { failures: Vec<ChecksumFailure> },
}

/// Download progress of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketProgress {
    pub name: String,
    pub last_op: OpId,
    pub last_applied_op: OpId,
    pub target_op: OpId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactStats {
    pub rows_compacted: u64,
    pub ops_removed: u64,
}

type OplogRow = (String, i64, String, Option<String>, i64, Option<String>);

fn entry_from_row(row_type: &str, row_id: &str, row: &OplogRow) -> DbResult<OplogEntry> {
    let (_, op_id, op, data, checksum, subkey) = row;
    Ok(OplogEntry {
        op_id: OpId(*op_id),
        op: op.parse()?,
        object_type: Some(row_type.to_string()),
        object_id: Some(row_id.to_string()),
        data: OplogEntry::parse_data(data.as_deref()).map_err(DbError::Serialization)?,
        checksum: Checksum::from_wire(*checksum),
        subkey: subkey.clone(),
    })
}

// =============================================================================
// Bucket Storage
// =============================================================================

/// Repository over the operation log and bucket metadata.
///
/// Holds the counter that drives automatic compaction, so one instance
/// should be shared by the sync client.
#[derive(Debug, Clone)]
pub struct BucketStorage {
    db: Database,
    ops_since_compact: Arc<AtomicU64>,
    compact_threshold: u64,
}

impl BucketStorage {
    pub fn new(db: Database) -> Self {
        BucketStorage {
            db,
            ops_since_compact: Arc::new(AtomicU64::new(0)),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }

    /// Compact after this many applied ops. Zero disables automatic compaction.
    pub fn with_compact_threshold(mut self, threshold: u64) -> Self {
        self.compact_threshold = threshold;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Download Side
    // =========================================================================

    /// Appends one data batch to the operation log.
    ///
    /// Runs in its own write transaction; a failure rolls back the whole batch.
    /// Ops at or below the bucket's `last_op` are skipped, so re-delivered
    /// batches are no-ops. Returns the number of ops applied.
    pub async fn save_sync_data(&self, batch: &SyncDataBatch) -> DbResult<usize> {
        let mut tx = self.db.begin_internal().await?;

        sqlx::query("INSERT OR IGNORE INTO ps_buckets (name) VALUES (?)")
            .bind(&batch.bucket)
            .execute(&mut *tx)
            .await?;

        let (last_op, add_checksum): (i64, i64) =
            sqlx::query_as("SELECT last_op, add_checksum FROM ps_buckets WHERE name = ?")
                .bind(&batch.bucket)
                .fetch_one(&mut *tx)
                .await?;

        let mut cursor = OpId(last_op);
        let mut add_checksum = Checksum::from_wire(add_checksum);
        let mut applied = 0usize;

        for op in &batch.data {
            if op.op_id <= cursor {
                if op.op_id.0 > last_op {
                    warn!(bucket = %batch.bucket, op_id = %op.op_id, "Out-of-order op skipped");
                } else {
                    debug!(bucket = %batch.bucket, op_id = %op.op_id, "Already applied, skipping");
                }
                continue;
            }
            cursor = op.op_id;
            applied += 1;

            match op.op {
                OpType::Put | OpType::Patch | OpType::Remove => {
                    let (row_type, row_id) =
                        op.row_key().ok_or_else(|| tide_core::CoreError::InvalidOpData {
                            row_type: op.object_type.clone().unwrap_or_default(),
                            row_id: op.object_id.clone().unwrap_or_default(),
                            message: format!("{} op {} without row", op.op, op.op_id),
                        })?;
                    let data = op
                        .data
                        .as_ref()
                        .map(|d| serde_json::to_string(d))
                        .transpose()?;

                    sqlx::query(
                        "INSERT OR REPLACE INTO ps_oplog (bucket, op_id, op, row_type, row_id, subkey, data, checksum) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&batch.bucket)
                    .bind(op.op_id.0)
                    .bind(op.op.as_str())
                    .bind(row_type)
                    .bind(row_id)
                    .bind(&op.subkey)
                    .bind(data)
                    .bind(op.checksum.as_i64())
                    .execute(&mut *tx)
                    .await?;

                    mark_row(&mut tx, row_type, row_id).await?;
                }
                OpType::Move => {
                    add_checksum += op.checksum;
                }
                OpType::Clear => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id) SELECT row_type, row_id FROM ps_oplog WHERE bucket = ? AND row_type IS NOT NULL AND row_id IS NOT NULL",
                    )
                    .bind(&batch.bucket)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM ps_oplog WHERE bucket = ?")
                        .bind(&batch.bucket)
                        .execute(&mut *tx)
                        .await?;
                    add_checksum = op.checksum;
                    info!(bucket = %batch.bucket, op_id = %op.op_id, "Bucket cleared");
                }
            }
        }

        sqlx::query("UPDATE ps_buckets SET last_op = ?, add_checksum = ? WHERE name = ?")
            .bind(cursor.0)
            .bind(add_checksum.as_i64())
            .bind(&batch.bucket)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.ops_since_compact
            .fetch_add(applied as u64, Ordering::Relaxed);
        debug!(bucket = %batch.bucket, applied, last_op = %cursor, "Saved sync data");
        Ok(applied)
    }

    /// Resume cursors for the next stream request.
    pub async fn bucket_states(&self) -> DbResult<Vec<BucketRequest>> {
        let rows: Vec<(String, i64)> =
            self.db
                .get_all("SELECT name, last_op FROM ps_buckets ORDER BY name", &[])
                .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_op)| BucketRequest {
                name,
                after: OpId(last_op),
            })
            .collect())
    }

    pub async fn bucket_progress(&self) -> DbResult<Vec<BucketProgress>> {
        let rows: Vec<(String, i64, i64, i64)> = self
            .db
            .get_all(
                "SELECT name, last_op, last_applied_op, target_op FROM ps_buckets ORDER BY name",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_op, last_applied_op, target_op)| BucketProgress {
                name,
                last_op: OpId(last_op),
                last_applied_op: OpId(last_applied_op),
                target_op: OpId(target_op),
            })
            .collect())
    }

    /// Records the op id each bucket is expected to reach.
    pub async fn set_target_checkpoint(&self, checkpoint: &Checkpoint) -> DbResult<()> {
        let mut tx = self.db.begin_internal().await?;
        for bucket in &checkpoint.buckets {
            let target = bucket
                .op_id
                .or(checkpoint.last_op_id)
                .unwrap_or(OpId::ZERO);
            sqlx::query(
                "INSERT INTO ps_buckets (name, target_op) VALUES (?, ?) ON CONFLICT (name) DO UPDATE SET target_op = excluded.target_op",
            )
            .bind(&bucket.bucket)
            .bind(target.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes all local state for the named buckets.
    ///
    /// Their rows are re-materialized at the next checkpoint, so data still
    /// provided by another bucket survives.
    pub async fn remove_buckets(&self, names: &[String]) -> DbResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin_internal().await?;
        for name in names {
            sqlx::query(
                "INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id) SELECT row_type, row_id FROM ps_oplog WHERE bucket = ? AND row_type IS NOT NULL AND row_id IS NOT NULL",
            )
            .bind(name)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM ps_oplog WHERE bucket = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM ps_buckets WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(buckets = ?names, "Removed buckets");
        Ok(())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Running checksum of a bucket: `add_checksum + Σ op.checksum`.
    pub async fn bucket_checksum(&self, bucket: &str) -> DbResult<Checksum> {
        let mut conn = self.db.read_lock().await?;
        local_checksum(&mut conn, bucket).await
    }

    /// Compares one bucket against the checkpoint. `None` means valid.
    pub async fn validate_checksum(
        &self,
        bucket: &str,
        checkpoint: &Checkpoint,
    ) -> DbResult<Option<ChecksumFailure>> {
        let expected = checkpoint
            .bucket(bucket)
            .ok_or_else(|| DbError::not_found("Checkpoint bucket", bucket))?;
        let mut conn = self.db.read_lock().await?;
        check_bucket(&mut conn, expected).await
    }

    /// Every bucket of the checkpoint that fails validation.
    pub async fn validate_checkpoint(&self, checkpoint: &Checkpoint) -> DbResult<ChecksumValidation> {
        let mut conn = self.db.read_lock().await?;
        let mut validation = ChecksumValidation::default();
        for expected in &checkpoint.buckets {
            if let Some(failure) = check_bucket(&mut conn, expected).await? {
                validation.failed.push(failure);
            }
        }
        Ok(validation)
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Validates the checkpoint and, when possible, makes it visible.
    pub async fn sync_local(&self, checkpoint: &Checkpoint) -> DbResult<SyncLocalOutcome> {
        let validation = self.validate_checkpoint(checkpoint).await?;
        if !validation.is_valid() {
            let failures = validation.failed;
            for failure in &failures {
                warn!(
                    bucket = %failure.bucket,
                    expected = %failure.expected,
                    actual = %failure.actual,
                    "Checksum mismatch"
                );
            }
            return Ok(SyncLocalOutcome::ChecksumFailed { failures });
        }

        let mut tx = self.db.begin_internal().await?;

        if !local_writes_settled(&mut tx, checkpoint).await? {
            // Keeps the acknowledged write checkpoint.
            tx.commit().await?;
            debug!("Local writes pending, deferring checkpoint");
            return Ok(SyncLocalOutcome::PendingUploads);
        }

        let typed: HashSet<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ps\\_data\\_\\_%' ESCAPE '\\'",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        let touched: Vec<(String, String)> =
            sqlx::query_as("SELECT row_type, row_id FROM ps_updated_rows")
                .fetch_all(&mut *tx)
                .await?;

        let mut tables = BTreeSet::new();
        for (row_type, row_id) in &touched {
            let state = materialized_state(&mut tx, row_type, row_id).await?;
            let data_table = format!("ps_data__{}", row_type);
            let is_typed = typed.contains(&data_table);

            match (state, is_typed) {
                (Some(data), true) => {
                    sqlx::query(&format!(
                        "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
                        quote_ident(&data_table)
                    ))
                    .bind(row_id)
                    .bind(serde_json::to_string(&Value::Object(data))?)
                    .execute(&mut *tx)
                    .await?;
                }
                (Some(data), false) => {
                    sqlx::query("INSERT OR REPLACE INTO ps_untyped (type, id, data) VALUES (?, ?, ?)")
                        .bind(row_type)
                        .bind(row_id)
                        .bind(serde_json::to_string(&Value::Object(data))?)
                        .execute(&mut *tx)
                        .await?;
                }
                (None, true) => {
                    sqlx::query(&format!(
                        "DELETE FROM {} WHERE id = ?",
                        quote_ident(&data_table)
                    ))
                    .bind(row_id)
                    .execute(&mut *tx)
                    .await?;
                }
                (None, false) => {
                    sqlx::query("DELETE FROM ps_untyped WHERE type = ? AND id = ?")
                        .bind(row_type)
                        .bind(row_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tables.insert(row_type.clone());
        }

        sqlx::query("DELETE FROM ps_updated_rows")
            .execute(&mut *tx)
            .await?;

        for bucket in checkpoint.bucket_names() {
            sqlx::query("UPDATE ps_buckets SET last_applied_op = last_op WHERE name = ?")
                .bind(bucket)
                .execute(&mut *tx)
                .await?;
        }

        kv_set(&mut tx, KV_LAST_SYNCED, Some(&Utc::now().to_rfc3339())).await?;
        tx.commit().await?;

        info!(
            rows = touched.len(),
            tables = tables.len(),
            "Checkpoint applied"
        );
        self.db.notify_table_updates(TableUpdate {
            tables: tables.clone(),
        });

        if self.compact_threshold > 0
            && self.ops_since_compact.load(Ordering::Relaxed) >= self.compact_threshold
        {
            self.ops_since_compact.store(0, Ordering::Relaxed);
            self.compact().await?;
        }

        Ok(SyncLocalOutcome::Applied { tables })
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Folds every multi-op row chain into a single PUT.
    ///
    /// Chains ending removed are deleted and their checksum is moved into the
    /// bucket's `add_checksum`. Bucket checksums are unchanged.
    pub async fn compact(&self) -> DbResult<CompactStats> {
        let mut tx = self.db.begin_internal().await?;

        let chains: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT bucket, row_type, row_id, subkey FROM ps_oplog WHERE row_type IS NOT NULL AND row_id IS NOT NULL GROUP BY bucket, row_type, row_id, subkey HAVING COUNT(*) > 1 OR SUM(op != 'PUT') > 0",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut stats = CompactStats::default();
        let mut removed_checksums: BTreeMap<String, Checksum> = BTreeMap::new();

        for (bucket, row_type, row_id, subkey) in &chains {
            let rows: Vec<OplogRow> = sqlx::query_as(
                "SELECT bucket, op_id, op, data, checksum, subkey FROM ps_oplog WHERE bucket = ? AND row_type = ? AND row_id = ? AND subkey IS ? ORDER BY op_id",
            )
            .bind(bucket)
            .bind(row_type)
            .bind(row_id)
            .bind(subkey)
            .fetch_all(&mut *tx)
            .await?;

            let entries = rows
                .iter()
                .map(|row| entry_from_row(row_type, row_id, row))
                .collect::<DbResult<Vec<_>>>()?;
            let state: RowState = fold_row_ops(&entries);

            sqlx::query(
                "DELETE FROM ps_oplog WHERE bucket = ? AND row_type = ? AND row_id = ? AND subkey IS ?",
            )
            .bind(bucket)
            .bind(row_type)
            .bind(row_id)
            .bind(subkey)
            .execute(&mut *tx)
            .await?;

            match state.data {
                Some(data) => {
                    sqlx::query(
                        "INSERT INTO ps_oplog (bucket, op_id, op, row_type, row_id, subkey, data, checksum) VALUES (?, ?, 'PUT', ?, ?, ?, ?, ?)",
                    )
                    .bind(bucket)
                    .bind(state.op_id.0)
                    .bind(row_type)
                    .bind(row_id)
                    .bind(subkey)
                    .bind(serde_json::to_string(&Value::Object(data))?)
                    .bind(state.checksum.as_i64())
                    .execute(&mut *tx)
                    .await?;
                    stats.ops_removed += entries.len() as u64 - 1;
                }
                None => {
                    *removed_checksums.entry(bucket.clone()).or_default() += state.checksum;
                    stats.ops_removed += entries.len() as u64;
                }
            }
            stats.rows_compacted += 1;
        }

        for (bucket, checksum) in removed_checksums {
            let current: i64 = sqlx::query_scalar("SELECT add_checksum FROM ps_buckets WHERE name = ?")
                .bind(&bucket)
                .fetch_one(&mut *tx)
                .await?;
            let updated = Checksum::from_wire(current) + checksum;
            sqlx::query("UPDATE ps_buckets SET add_checksum = ? WHERE name = ?")
                .bind(updated.as_i64())
                .bind(&bucket)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            rows = stats.rows_compacted,
            ops_removed = stats.ops_removed,
            "Compacted operation log"
        );
        Ok(stats)
    }

    // =========================================================================
    // Client State
    // =========================================================================

    /// When the last checkpoint was applied, if ever.
    pub async fn last_synced_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let mut conn = self.db.read_lock().await?;
        let value = kv_get(&mut conn, KV_LAST_SYNCED).await?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub async fn has_completed_sync(&self) -> DbResult<bool> {
        Ok(self.last_synced_at().await?.is_some())
    }

    /// Stable identifier of this client database, generated on first use.
    pub async fn client_id(&self) -> DbResult<String> {
        let mut tx = self.db.begin_internal().await?;
        if let Some(id) = kv_get(&mut tx, KV_CLIENT_ID).await? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        kv_set(&mut tx, KV_CLIENT_ID, Some(&id)).await?;
        tx.commit().await?;
        info!(client_id = %id, "Generated client id");
        Ok(id)
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn mark_row(conn: &mut SqliteConnection, row_type: &str, row_id: &str) -> DbResult<()> {
    sqlx::query("INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id) VALUES (?, ?)")
        .bind(row_type)
        .bind(row_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn local_checksum(conn: &mut SqliteConnection, bucket: &str) -> DbResult<Checksum> {
    let add: Option<i64> = sqlx::query_scalar("SELECT add_checksum FROM ps_buckets WHERE name = ?")
        .bind(bucket)
        .fetch_optional(&mut *conn)
        .await?;
    let ops: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(checksum), 0) FROM ps_oplog WHERE bucket = ?")
        .bind(bucket)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Checksum::from_wire(add.unwrap_or(0)) + Checksum::from_wire(ops))
}

async fn check_bucket(
    conn: &mut SqliteConnection,
    expected: &BucketChecksum,
) -> DbResult<Option<ChecksumFailure>> {
    let actual = local_checksum(conn, &expected.bucket).await?;
    if actual == expected.checksum {
        Ok(None)
    } else {
        Ok(Some(ChecksumFailure {
            bucket: expected.bucket.clone(),
            expected: expected.checksum,
            actual,
        }))
    }
}

/// True when no local write is waiting to be reflected by the server.
async fn local_writes_settled(conn: &mut SqliteConnection, checkpoint: &Checkpoint) -> DbResult<bool> {
    let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ps_crud")
        .fetch_one(&mut *conn)
        .await?;
    if pending > 0 {
        return Ok(false);
    }

    let stored: Option<OpId> = kv_get(conn, KV_APPLIED_WRITE)
        .await?
        .and_then(|v| v.parse().ok());
    let applied = stored.max(checkpoint.write_checkpoint);
    if applied != stored {
        if let Some(op) = applied {
            kv_set(conn, KV_APPLIED_WRITE, Some(&op.to_string())).await?;
        }
    }

    let target: Option<OpId> = kv_get(conn, KV_LOCAL_TARGET)
        .await?
        .and_then(|v| v.parse().ok());
    Ok(match target {
        None => true,
        Some(target) => applied.is_some_and(|op| op >= target),
    })
}

/// Final state of a row across all buckets: the present state with the highest op id wins.
async fn materialized_state(
    conn: &mut SqliteConnection,
    row_type: &str,
    row_id: &str,
) -> DbResult<Option<serde_json::Map<String, Value>>> {
    let rows: Vec<OplogRow> = sqlx::query_as(
        "SELECT bucket, op_id, op, data, checksum, subkey FROM ps_oplog WHERE row_type = ? AND row_id = ? ORDER BY op_id",
    )
    .bind(row_type)
    .bind(row_id)
    .fetch_all(conn)
    .await?;

    let mut sources: BTreeMap<(String, Option<String>), Vec<OplogEntry>> = BTreeMap::new();
    for row in &rows {
        let entry = entry_from_row(row_type, row_id, row)?;
        sources
            .entry((row.0.clone(), entry.subkey.clone()))
            .or_default()
            .push(entry);
    }

    Ok(sources
        .values()
        .map(|ops| fold_row_ops(ops))
        .filter(|state| state.data.is_some())
        .max_by_key(|state| state.op_id)
        .and_then(|state| state.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assets_schema, open_temp};
    use serde_json::json;

    fn put(op_id: i64, id: &str, data: Value, checksum: u32) -> OplogEntry {
        OplogEntry {
            op_id: OpId(op_id),
            op: OpType::Put,
            object_type: Some("assets".into()),
            object_id: Some(id.into()),
            data: data.as_object().cloned(),
            checksum: Checksum::new(checksum),
            subkey: None,
        }
    }

    fn patch(op_id: i64, id: &str, data: Value, checksum: u32) -> OplogEntry {
        OplogEntry {
            op: OpType::Patch,
            ..put(op_id, id, data, checksum)
        }
    }

    fn remove(op_id: i64, id: &str, checksum: u32) -> OplogEntry {
        OplogEntry {
            op: OpType::Remove,
            data: None,
            ..put(op_id, id, json!({}), checksum)
        }
    }

    fn batch(bucket: &str, data: Vec<OplogEntry>) -> SyncDataBatch {
        SyncDataBatch {
            bucket: bucket.into(),
            data,
            has_more: false,
            after: None,
            next_after: None,
        }
    }

    fn checkpoint(buckets: &[(&str, u32)]) -> Checkpoint {
        Checkpoint {
            last_op_id: None,
            write_checkpoint: None,
            buckets: buckets
                .iter()
                .map(|(name, checksum)| BucketChecksum {
                    bucket: name.to_string(),
                    checksum: Checksum::new(*checksum),
                    op_id: None,
                    count: None,
                })
                .collect(),
        }
    }

    async fn asset_ids(db: &Database) -> Vec<(String, Option<String>)> {
        db.get_all("SELECT id, description FROM assets ORDER BY id", &[])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_checkpoint_applies_when_checksum_matches() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        let cp = checkpoint(&[("b1", 42)]);
        storage.set_target_checkpoint(&cp).await.unwrap();
        storage
            .save_sync_data(&batch(
                "b1",
                vec![
                    put(1, "r1", json!({"description": "one"}), 20),
                    put(2, "r2", json!({"description": "two"}), 22),
                ],
            ))
            .await
            .unwrap();

        // Nothing visible before the checkpoint completes.
        assert!(asset_ids(&db).await.is_empty());

        let outcome = storage.sync_local(&cp).await.unwrap();
        assert!(matches!(outcome, SyncLocalOutcome::Applied { ref tables } if tables.contains("assets")));
        assert_eq!(
            asset_ids(&db).await,
            vec![
                ("r1".to_string(), Some("one".to_string())),
                ("r2".to_string(), Some("two".to_string()))
            ]
        );
        assert!(storage.has_completed_sync().await.unwrap());

        let progress = storage.bucket_progress().await.unwrap();
        assert_eq!(progress[0].last_applied_op, OpId(2));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_reports_failure() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        storage
            .save_sync_data(&batch(
                "b1",
                vec![
                    put(1, "r1", json!({"description": "one"}), 20),
                    put(2, "r2", json!({"description": "two"}), 21),
                ],
            ))
            .await
            .unwrap();

        let cp = checkpoint(&[("b1", 42)]);
        match storage.sync_local(&cp).await.unwrap() {
            SyncLocalOutcome::ChecksumFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].bucket, "b1");
                assert_eq!(failures[0].actual, Checksum::new(41));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(asset_ids(&db).await.is_empty());

        // Discarding the bucket resets its cursor for a full redownload.
        storage.remove_buckets(&["b1".to_string()]).await.unwrap();
        assert!(storage.bucket_states().await.unwrap().is_empty());
        assert_eq!(storage.bucket_checksum("b1").await.unwrap(), Checksum::ZERO);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_idempotent() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        let data = batch(
            "b1",
            vec![
                put(1, "r1", json!({"description": "one"}), 20),
                patch(2, "r1", json!({"description": "uno"}), 5),
            ],
        );
        assert_eq!(storage.save_sync_data(&data).await.unwrap(), 2);
        let cp = checkpoint(&[("b1", 25)]);
        storage.sync_local(&cp).await.unwrap();
        let before = asset_ids(&db).await;

        assert_eq!(storage.save_sync_data(&data).await.unwrap(), 0);
        storage.sync_local(&cp).await.unwrap();
        assert_eq!(asset_ids(&db).await, before);
        assert_eq!(storage.bucket_checksum("b1").await.unwrap(), Checksum::new(25));
        assert_eq!(
            storage.bucket_states().await.unwrap(),
            vec![BucketRequest { name: "b1".into(), after: OpId(2) }]
        );
    }

    #[tokio::test]
    async fn test_compaction_preserves_checksum_and_payload() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets().with_compact_threshold(0);

        storage
            .save_sync_data(&batch(
                "b1",
                vec![
                    put(1, "r1", json!({"description": "desk", "make": "acme"}), 100),
                    patch(2, "r1", json!({"description": "chair"}), 7),
                    put(3, "r2", json!({"description": "lamp"}), 3),
                    remove(4, "r2", 9),
                ],
            ))
            .await
            .unwrap();
        let before = storage.bucket_checksum("b1").await.unwrap();

        let stats = storage.compact().await.unwrap();
        assert_eq!(stats.rows_compacted, 2);
        assert_eq!(storage.bucket_checksum("b1").await.unwrap(), before);

        let ops: Vec<(i64, String, Option<String>, i64)> = db
            .get_all("SELECT op_id, op, data, checksum FROM ps_oplog WHERE bucket = 'b1'", &[])
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, 2);
        assert_eq!(ops[0].1, "PUT");
        assert_eq!(ops[0].3, 107);
        let payload: Value = serde_json::from_str(ops[0].2.as_deref().unwrap()).unwrap();
        assert_eq!(payload, json!({"description": "chair", "make": "acme"}));

        let cp = checkpoint(&[("b1", before.value())]);
        assert!(matches!(storage.sync_local(&cp).await.unwrap(), SyncLocalOutcome::Applied { .. }));
        assert_eq!(asset_ids(&db).await, vec![("r1".to_string(), Some("chair".to_string()))]);
    }

    #[tokio::test]
    async fn test_clear_and_move() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        storage
            .save_sync_data(&batch("b1", vec![put(1, "r1", json!({"description": "x"}), 10)]))
            .await
            .unwrap();
        storage.sync_local(&checkpoint(&[("b1", 10)])).await.unwrap();
        assert_eq!(asset_ids(&db).await.len(), 1);

        let mut clear = remove(2, "r1", 4);
        clear.op = OpType::Clear;
        clear.object_type = None;
        clear.object_id = None;
        let mut moved = remove(3, "r9", 6);
        moved.op = OpType::Move;
        storage
            .save_sync_data(&batch("b1", vec![clear, moved]))
            .await
            .unwrap();

        assert_eq!(storage.bucket_checksum("b1").await.unwrap(), Checksum::new(10));
        storage.sync_local(&checkpoint(&[("b1", 10)])).await.unwrap();
        assert!(asset_ids(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_row_in_two_buckets_survives_removal_from_one() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        storage
            .save_sync_data(&batch("a", vec![put(1, "r1", json!({"description": "old"}), 1)]))
            .await
            .unwrap();
        storage
            .save_sync_data(&batch("b", vec![put(2, "r1", json!({"description": "new"}), 2)]))
            .await
            .unwrap();
        storage.sync_local(&checkpoint(&[("a", 1), ("b", 2)])).await.unwrap();
        assert_eq!(asset_ids(&db).await, vec![("r1".to_string(), Some("new".to_string()))]);

        storage.remove_buckets(&["b".to_string()]).await.unwrap();
        storage.sync_local(&checkpoint(&[("a", 1)])).await.unwrap();
        assert_eq!(asset_ids(&db).await, vec![("r1".to_string(), Some("old".to_string()))]);
    }

    #[tokio::test]
    async fn test_pending_uploads_defer_materialization() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let storage = db.buckets();

        db.execute("INSERT INTO assets (id, description) VALUES ('local', 'mine')", &[])
            .await
            .unwrap();
        storage
            .save_sync_data(&batch("b1", vec![put(1, "r1", json!({"description": "x"}), 10)]))
            .await
            .unwrap();

        let cp = checkpoint(&[("b1", 10)]);
        assert_eq!(storage.sync_local(&cp).await.unwrap(), SyncLocalOutcome::PendingUploads);

        // Uploaded without a write checkpoint: wait until the server reports one.
        let crud = db.crud();
        let tx = crud.next_crud_transaction().await.unwrap().unwrap();
        crud.mark_uploaded(&tx, None).await.unwrap();
        assert_eq!(storage.sync_local(&cp).await.unwrap(), SyncLocalOutcome::PendingUploads);

        assert!(crud.update_local_target(OpId(7)).await.unwrap());
        assert_eq!(storage.sync_local(&cp).await.unwrap(), SyncLocalOutcome::PendingUploads);

        let acknowledged = Checkpoint {
            write_checkpoint: Some(OpId(7)),
            ..cp.clone()
        };
        assert!(matches!(
            storage.sync_local(&acknowledged).await.unwrap(),
            SyncLocalOutcome::Applied { .. }
        ));
        // Later checkpoints without a write checkpoint keep applying.
        assert!(matches!(storage.sync_local(&cp).await.unwrap(), SyncLocalOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_untyped_rows_adopted_by_schema() {
        let (db, _dir) = open_temp().await;
        let storage = db.buckets();
        storage
            .save_sync_data(&batch("b1", vec![put(1, "r1", json!({"description": "x"}), 10)]))
            .await
            .unwrap();
        storage.sync_local(&checkpoint(&[("b1", 10)])).await.unwrap();

        let untyped: Vec<(String, String)> =
            db.get_all("SELECT type, id FROM ps_untyped", &[]).await.unwrap();
        assert_eq!(untyped, vec![("assets".to_string(), "r1".to_string())]);

        db.apply_schema(&assets_schema()).await.unwrap();
        assert_eq!(asset_ids(&db).await, vec![("r1".to_string(), Some("x".to_string()))]);
    }

    #[tokio::test]
    async fn test_client_id_is_stable() {
        let (db, _dir) = open_temp().await;
        let first = db.buckets().client_id().await.unwrap();
        let second = db.buckets().client_id().await.unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn test_validate_single_bucket() {
        let (db, _dir) = open_temp().await;
        let storage = db.buckets();
        storage
            .save_sync_data(&batch("b1", vec![put(1, "r1", json!({}), 10)]))
            .await
            .unwrap();
        let cp = checkpoint(&[("b1", 10)]);
        assert!(storage.validate_checksum("b1", &cp).await.unwrap().is_none());
        assert!(storage.validate_checksum("zz", &cp).await.is_err());
    }
}
