//! # CRUD Queue
//!
//! Local writes are recorded by view triggers into `ps_crud`. This module
//! reads them back for upload and removes them once the backend has
//! accepted them.
//!
//! ```text
//! view write ──trigger──► ps_crud (id, tx_id, data)
//!                              │
//!            next_crud_transaction() / crud_batch(n)
//!                              │
//!                         upload_data()
//!                              │
//!                    complete(last_client_id, write_checkpoint)
//!                              │
//!             queue empty? ──► ps_kv.local_target_op = checkpoint | MAX
//! ```

use serde_json::{Map, Value};
use tide_core::{CrudBatch, CrudEntry, CrudTransaction, OpId, UpdateType};
use tracing::{debug, info};

use super::{kv_get, kv_set, KV_LOCAL_TARGET};
use crate::error::DbResult;
use crate::pool::{Database, WriteTransaction};

/// Upload queue over `ps_crud`.
#[derive(Debug, Clone)]
pub struct CrudQueue {
    db: Database,
}

impl CrudQueue {
    pub fn new(db: Database) -> Self {
        CrudQueue { db }
    }

    /// The oldest local transaction, with all of its entries in id order.
    ///
    /// Entries without a transaction id are returned one at a time.
    pub async fn next_crud_transaction(&self) -> DbResult<Option<CrudTransaction>> {
        let mut tx = self.db.read_transaction().await?;

        let first: Option<(i64, Option<i64>, String)> =
            sqlx::query_as("SELECT id, tx_id, data FROM ps_crud ORDER BY id LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        let Some((id, tx_id, data)) = first else {
            return Ok(None);
        };

        let rows: Vec<(i64, Option<i64>, String)> = match tx_id {
            Some(tx_id) => {
                sqlx::query_as("SELECT id, tx_id, data FROM ps_crud WHERE tx_id = ? ORDER BY id")
                    .bind(tx_id)
                    .fetch_all(&mut *tx)
                    .await?
            }
            None => vec![(id, tx_id, data)],
        };

        let crud = rows
            .iter()
            .map(|(id, tx_id, data)| CrudEntry::from_row(*id, *tx_id, data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(CrudTransaction {
            transaction_id: tx_id,
            crud,
        }))
    }

    /// Up to `limit` oldest entries regardless of transaction boundaries.
    pub async fn crud_batch(&self, limit: usize) -> DbResult<CrudBatch> {
        let rows: Vec<(i64, Option<i64>, String)> =
            sqlx::query_as("SELECT id, tx_id, data FROM ps_crud ORDER BY id LIMIT ?")
                .bind(limit as i64 + 1)
                .fetch_all(&mut *self.db.read_lock().await?)
                .await?;

        let have_more = rows.len() > limit;
        let crud = rows
            .iter()
            .take(limit)
            .map(|(id, tx_id, data)| CrudEntry::from_row(*id, *tx_id, data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CrudBatch { crud, have_more })
    }

    /// Removes every entry up to and including `last_client_id`.
    ///
    /// When that empties the queue the client must not apply synced data
    /// until the server reports `write_checkpoint`. Without one the target
    /// becomes [`OpId::MAX`] until [`Self::update_local_target`] learns it.
    pub async fn complete(&self, last_client_id: i64, write_checkpoint: Option<OpId>) -> DbResult<()> {
        let mut tx = self.db.begin_internal().await?;

        let removed = sqlx::query("DELETE FROM ps_crud WHERE id <= ?")
            .bind(last_client_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ps_crud")
            .fetch_one(&mut *tx)
            .await?;

        if remaining == 0 {
            let target = write_checkpoint.unwrap_or(OpId::MAX);
            kv_set(&mut tx, KV_LOCAL_TARGET, Some(&target.to_string())).await?;
        }

        tx.commit().await?;
        debug!(last_client_id, removed, remaining, "Completed CRUD entries");
        Ok(())
    }

    pub async fn mark_uploaded(
        &self,
        transaction: &CrudTransaction,
        write_checkpoint: Option<OpId>,
    ) -> DbResult<()> {
        match transaction.last_client_id() {
            Some(last) => self.complete(last, write_checkpoint).await,
            None => Ok(()),
        }
    }

    /// Queues an entry inside an open write transaction, for writes that
    /// bypass the generated views. Returns the entry's client id.
    pub async fn record_crud(
        tx: &mut WriteTransaction,
        op: UpdateType,
        table: &str,
        id: &str,
        data: Option<Map<String, Value>>,
    ) -> DbResult<i64> {
        let tx_id = tx.transaction_id();
        let entry = CrudEntry {
            client_id: 0,
            op,
            table: table.to_string(),
            id: id.to_string(),
            transaction_id: Some(tx_id),
            op_data: data,
        };
        let payload = serde_json::to_string(&entry.stored_payload())?;
        let result = tx
            .execute(
                "INSERT INTO ps_crud (tx_id, data) VALUES (?, ?)",
                &[tx_id.into(), payload.into()],
            )
            .await?;
        Ok(result.insert_id)
    }

    pub async fn pending_count(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ps_crud")
            .fetch_one(&mut *self.db.read_lock().await?)
            .await?;
        Ok(count as u64)
    }

    /// Write checkpoint the server must reach before synced data applies, if any.
    pub async fn local_target(&self) -> DbResult<Option<OpId>> {
        let mut conn = self.db.read_lock().await?;
        Ok(kv_get(&mut conn, KV_LOCAL_TARGET)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// Replaces a pending [`OpId::MAX`] target with the checkpoint fetched from the server.
    ///
    /// Does nothing and returns `false` if new local writes arrived meanwhile
    /// or the target is already concrete.
    pub async fn update_local_target(&self, write_checkpoint: OpId) -> DbResult<bool> {
        let mut tx = self.db.begin_internal().await?;

        let target: Option<OpId> = kv_get(&mut tx, KV_LOCAL_TARGET)
            .await?
            .and_then(|v| v.parse().ok());
        if target != Some(OpId::MAX) {
            return Ok(false);
        }

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ps_crud")
            .fetch_one(&mut *tx)
            .await?;
        if pending > 0 {
            return Ok(false);
        }

        kv_set(&mut tx, KV_LOCAL_TARGET, Some(&write_checkpoint.to_string())).await?;
        tx.commit().await?;
        info!(write_checkpoint = %write_checkpoint, "Local write target set");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assets_schema, open_temp};
    use serde_json::json;

    #[tokio::test]
    async fn test_transaction_groups_entries() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();

        let mut tx = db.write_transaction().await.unwrap();
        tx.execute("INSERT INTO assets (id, description) VALUES ('a1', 'desk')", &[])
            .await
            .unwrap();
        tx.execute("INSERT INTO assets (id, description) VALUES ('a2', 'lamp')", &[])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        db.execute("INSERT INTO assets (id, description) VALUES ('a3', 'chair')", &[])
            .await
            .unwrap();

        let crud = db.crud();
        let first = crud.next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(first.crud.len(), 2);
        assert_eq!(first.crud[0].id, "a1");
        assert_eq!(first.crud[1].id, "a2");
        assert!(first.crud.iter().all(|e| e.transaction_id == first.transaction_id));

        crud.mark_uploaded(&first, None).await.unwrap();
        let second = crud.next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(second.crud.len(), 1);
        assert_ne!(second.transaction_id, first.transaction_id);

        // The queue was not empty after the first completion.
        assert_eq!(crud.local_target().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_update_delete_queues_three_entries() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();

        db.execute("INSERT INTO assets (id, description, quantity) VALUES ('a1', 'desk', 1)", &[])
            .await
            .unwrap();
        db.execute("UPDATE assets SET quantity = 2 WHERE id = 'a1'", &[])
            .await
            .unwrap();
        db.execute("DELETE FROM assets WHERE id = 'a1'", &[])
            .await
            .unwrap();

        let batch = db.crud().crud_batch(10).await.unwrap();
        assert!(!batch.have_more);
        let ops: Vec<UpdateType> = batch.crud.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![UpdateType::Put, UpdateType::Patch, UpdateType::Delete]);
        assert_eq!(
            Value::Object(batch.crud[1].op_data.clone().unwrap()),
            json!({"quantity": 2})
        );
    }

    #[tokio::test]
    async fn test_batch_have_more_and_complete() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        for i in 0..3 {
            db.execute(
                "INSERT INTO assets (id, description) VALUES (?, 'x')",
                &[format!("a{}", i).into()],
            )
            .await
            .unwrap();
        }

        let crud = db.crud();
        let batch = crud.crud_batch(2).await.unwrap();
        assert_eq!(batch.crud.len(), 2);
        assert!(batch.have_more);

        crud.complete(batch.last_client_id().unwrap(), None).await.unwrap();
        assert_eq!(crud.pending_count().await.unwrap(), 1);

        let rest = crud.crud_batch(2).await.unwrap();
        crud.complete(rest.last_client_id().unwrap(), Some(OpId(12))).await.unwrap();
        assert_eq!(crud.pending_count().await.unwrap(), 0);
        assert_eq!(crud.local_target().await.unwrap(), Some(OpId(12)));
        assert!(crud.next_crud_transaction().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_target_only_replaces_sentinel() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        let crud = db.crud();

        assert!(!crud.update_local_target(OpId(3)).await.unwrap());

        db.execute("INSERT INTO assets (id) VALUES ('a1')", &[]).await.unwrap();
        let tx = crud.next_crud_transaction().await.unwrap().unwrap();
        crud.mark_uploaded(&tx, None).await.unwrap();
        assert_eq!(crud.local_target().await.unwrap(), Some(OpId::MAX));

        // A new local write arrived before the checkpoint was fetched.
        db.execute("INSERT INTO assets (id) VALUES ('a2')", &[]).await.unwrap();
        assert!(!crud.update_local_target(OpId(3)).await.unwrap());

        let tx = crud.next_crud_transaction().await.unwrap().unwrap();
        crud.mark_uploaded(&tx, None).await.unwrap();
        assert!(crud.update_local_target(OpId(3)).await.unwrap());
        assert_eq!(crud.local_target().await.unwrap(), Some(OpId(3)));
        assert!(!crud.update_local_target(OpId(4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_crud_shares_transaction_id() {
        let (db, _dir) = open_temp().await;
        let mut tx = db.write_transaction().await.unwrap();
        let tx_id = tx.transaction_id();
        let a = CrudQueue::record_crud(&mut tx, UpdateType::Delete, "notes", "n1", None)
            .await
            .unwrap();
        let b = CrudQueue::record_crud(
            &mut tx,
            UpdateType::Put,
            "notes",
            "n2",
            json!({"body": "hi"}).as_object().cloned(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert!(b > a);

        let queued = db.crud().next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(queued.transaction_id, Some(tx_id));
        assert_eq!(queued.crud.len(), 2);
        assert_eq!(queued.crud[1].table, "notes");
    }
}
