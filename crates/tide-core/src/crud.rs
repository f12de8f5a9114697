//! # CRUD Queue Types
//!
//! Local writes waiting for upload, grouped by the local transaction that
//! produced them.
//!
//! ## Stored Payload
//! ```text
//! ps_crud.data = {"op":"PATCH","type":"assets","id":"r1","data":{"make":"x"}}
//!                  │            │              │         │
//!                  │            │              │         └─ changed columns (PUT/PATCH only)
//!                  │            │              └─ row id
//!                  │            └─ table name
//!                  └─ PUT | PATCH | DELETE
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{CoreError, CoreResult};

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Insert or replace the full row.
    Put,
    /// Update the listed columns.
    Patch,
    /// Delete the row.
    Delete,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::Put => write!(f, "PUT"),
            UpdateType::Patch => write!(f, "PATCH"),
            UpdateType::Delete => write!(f, "DELETE"),
        }
    }
}

/// One queued local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Strictly increasing local id (`ps_crud.id`).
    #[serde(rename = "op_id")]
    pub client_id: i64,
    pub op: UpdateType,
    #[serde(rename = "type")]
    pub table: String,
    pub id: String,
    #[serde(rename = "tx_id", default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub op_data: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct StoredCrud {
    op: UpdateType,
    #[serde(rename = "type")]
    table: String,
    id: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

impl CrudEntry {
    /// Decodes a `ps_crud` row.
    pub fn from_row(client_id: i64, transaction_id: Option<i64>, data: &str) -> CoreResult<Self> {
        let stored: StoredCrud =
            serde_json::from_str(data).map_err(|e| CoreError::InvalidCrudEntry {
                id: client_id,
                message: e.to_string(),
            })?;

        Ok(CrudEntry {
            client_id,
            op: stored.op,
            table: stored.table,
            id: stored.id,
            transaction_id,
            op_data: stored.data,
        })
    }

    /// The payload shape stored in `ps_crud.data`.
    pub fn stored_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("op".into(), Value::String(self.op.to_string()));
        payload.insert("type".into(), Value::String(self.table.clone()));
        payload.insert("id".into(), Value::String(self.id.clone()));
        if let Some(data) = &self.op_data {
            payload.insert("data".into(), Value::Object(data.clone()));
        }
        Value::Object(payload)
    }
}

/// All entries committed together in one local transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudTransaction {
    pub transaction_id: Option<i64>,
    pub crud: Vec<CrudEntry>,
}

impl CrudTransaction {
    /// Highest client id in the transaction. Completing up to it removes the whole transaction.
    pub fn last_client_id(&self) -> Option<i64> {
        self.crud.last().map(|e| e.client_id)
    }
}

/// A bounded slice of the queue, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudBatch {
    pub crud: Vec<CrudEntry>,
    /// More entries exist beyond this batch.
    pub have_more: bool,
}

impl CrudBatch {
    pub fn last_client_id(&self) -> Option<i64> {
        self.crud.last().map(|e| e.client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_row() {
        let entry = CrudEntry::from_row(
            7,
            Some(3),
            r#"{"op":"PUT","type":"assets","id":"a1","data":{"description":"test"}}"#,
        )
        .unwrap();
        assert_eq!(entry.op, UpdateType::Put);
        assert_eq!(entry.table, "assets");
        assert_eq!(entry.transaction_id, Some(3));
        assert_eq!(entry.op_data.unwrap()["description"], json!("test"));
    }

    #[test]
    fn test_delete_has_no_data() {
        let entry =
            CrudEntry::from_row(1, Some(1), r#"{"op":"DELETE","type":"assets","id":"a1"}"#).unwrap();
        assert!(entry.op_data.is_none());
        assert_eq!(
            entry.stored_payload(),
            json!({"op": "DELETE", "type": "assets", "id": "a1"})
        );
    }

    #[test]
    fn test_upload_json_shape() {
        let entry = CrudEntry {
            client_id: 2,
            op: UpdateType::Patch,
            table: "assets".into(),
            id: "a1".into(),
            transaction_id: Some(5),
            op_data: json!({"make": "x"}).as_object().cloned(),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"op_id": 2, "op": "PATCH", "type": "assets", "id": "a1", "tx_id": 5, "data": {"make": "x"}})
        );
    }

    #[test]
    fn test_invalid_payload() {
        let err = CrudEntry::from_row(9, None, r#"{"op":"UPSERT"}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidCrudEntry { id: 9, .. }));
    }
}
