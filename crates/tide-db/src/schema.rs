//! # Schema Application
//!
//! Turns declared tables into views over JSON backing tables, with
//! INSTEAD OF triggers that keep the backing table current and append
//! local writes to the CRUD queue.
//!
//! ## Generated Objects
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Table "assets" (description TEXT, quantity INTEGER)                    │
//! │                                                                         │
//! │  ps_data__assets (id TEXT PK, data TEXT)   ← synced + local rows (JSON) │
//! │         ▲                                                               │
//! │         │ json_extract + CAST                                           │
//! │  VIEW assets (id, description, quantity)   ← what the app queries       │
//! │         │                                                               │
//! │         │ INSTEAD OF INSERT / UPDATE / DELETE                           │
//! │         ▼                                                               │
//! │  ps_data__assets  +  ps_crud (tx_id = ps_tx.current_tx)                 │
//! │                                                                         │
//! │  INSERT → PUT    non-null columns                                       │
//! │  UPDATE → PATCH  changed columns only (id changes rejected)             │
//! │  DELETE → DELETE no data                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::Row;
use tide_core::{Schema, Table};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::pool::Database;

const TRIGGER_PREFIX: &str = "ps_view_";

impl Database {
    /// Replaces all generated views and triggers with ones for `schema`.
    ///
    /// Backing tables are kept, so existing rows survive schema changes.
    /// Rows synced before their table was declared are moved out of `ps_untyped`.
    pub async fn apply_schema(&self, schema: &Schema) -> DbResult<()> {
        schema
            .validate()
            .map_err(|e| DbError::InvalidSchema(e.to_string()))?;

        let mut tx = self.begin_internal().await?;

        let triggers: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'ps\\_view\\_%' ESCAPE '\\'",
        )
        .fetch_all(&mut *tx)
        .await?;
        for trigger in triggers {
            sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&trigger)))
                .execute(&mut *tx)
                .await?;
        }

        let views = sqlx::query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'view'",
        )
        .fetch_all(&mut *tx)
        .await?;
        for view in views {
            let name: String = view.try_get("name")?;
            let sql: Option<String> = view.try_get("sql")?;
            if sql.is_some_and(|s| s.contains("\"ps_data__") || s.contains("\"ps_data_local__")) {
                sqlx::query(&format!("DROP VIEW IF EXISTS {}", quote_ident(&name)))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for table in &schema.tables {
            let data_table = quote_ident(&table.data_table());
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY NOT NULL, data TEXT)",
                data_table
            ))
            .execute(&mut *tx)
            .await?;

            if !table.local_only {
                let moved = sqlx::query(&format!(
                    "INSERT OR REPLACE INTO {} (id, data) SELECT id, data FROM ps_untyped WHERE type = ?",
                    data_table
                ))
                .bind(&table.name)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM ps_untyped WHERE type = ?")
                    .bind(&table.name)
                    .execute(&mut *tx)
                    .await?;
                if moved.rows_affected() > 0 {
                    debug!(table = %table.name, rows = moved.rows_affected(), "Adopted untyped rows");
                }
            }

            sqlx::query(&view_ddl(table)).execute(&mut *tx).await?;
            for trigger in trigger_ddl(table) {
                sqlx::query(&trigger).execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;
        info!(tables = schema.tables.len(), "Schema applied");
        Ok(())
    }
}

// =============================================================================
// DDL Generation
// =============================================================================

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn view_ddl(table: &Table) -> String {
    let mut names = vec![quote_ident("id")];
    let mut selects = vec!["id".to_string()];
    for column in &table.columns {
        names.push(quote_ident(&column.name));
        selects.push(format!(
            "CAST(json_extract(data, {}) AS {})",
            quote_literal(&format!("$.{}", column.name)),
            column.column_type.sql()
        ));
    }

    format!(
        "CREATE VIEW {} ({}) AS SELECT {} FROM {}",
        quote_ident(table.view()),
        names.join(", "),
        selects.join(", "),
        quote_ident(&table.data_table())
    )
}

/// `json_object('a', NEW."a", ...)` over every column.
fn row_object(table: &Table, row: &str) -> String {
    let pairs: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{}, {}.{}", quote_literal(&c.name), row, quote_ident(&c.name)))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// Object of the columns selected by `condition(column)`.
fn filtered_object(table: &Table, condition: impl Fn(&str) -> String) -> String {
    if table.columns.is_empty() {
        return "json_object()".to_string();
    }
    let parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let column = quote_ident(&c.name);
            format!(
                "SELECT {} AS k, NEW.{} AS v WHERE {}",
                quote_literal(&c.name),
                column,
                condition(&column)
            )
        })
        .collect();
    format!(
        "(SELECT json_group_object(k, v) FROM ({}))",
        parts.join(" UNION ALL ")
    )
}

fn crud_insert(table: &Table, op: &str, id: &str, data: Option<String>) -> String {
    let data = data
        .map(|d| format!(", 'data', json({})", d))
        .unwrap_or_default();
    format!(
        "INSERT INTO ps_crud (tx_id, data) SELECT current_tx, json_object('op', {}, 'type', {}, 'id', {}{}) FROM ps_tx WHERE id = 1;",
        quote_literal(op),
        quote_literal(&table.name),
        id,
        data
    )
}

fn trigger_ddl(table: &Table) -> Vec<String> {
    let view = quote_ident(table.view());
    let data_table = quote_ident(&table.data_table());
    let trigger = |kind: &str| quote_ident(&format!("{}{}_{}", TRIGGER_PREFIX, kind, table.name));
    let require_id = "SELECT CASE WHEN (NEW.id IS NULL) THEN RAISE (FAIL, 'id is required') END;";

    let put_data = filtered_object(table, |c| format!("NEW.{} IS NOT NULL", c));

    if table.insert_only {
        return vec![format!(
            "CREATE TRIGGER {} INSTEAD OF INSERT ON {} FOR EACH ROW BEGIN {} {} END",
            trigger("insert"),
            view,
            require_id,
            crud_insert(table, "PUT", "NEW.id", Some(put_data))
        )];
    }

    let (insert_crud, update_crud, delete_crud) = if table.local_only {
        (String::new(), String::new(), String::new())
    } else {
        let patch_data = filtered_object(table, |c| format!("NEW.{} IS NOT OLD.{}", c, c));
        (
            crud_insert(table, "PUT", "NEW.id", Some(put_data)),
            crud_insert(table, "PATCH", "NEW.id", Some(patch_data)),
            crud_insert(table, "DELETE", "OLD.id", None),
        )
    };

    vec![
        format!(
            "CREATE TRIGGER {} INSTEAD OF INSERT ON {} FOR EACH ROW BEGIN {} INSERT INTO {} (id, data) VALUES (NEW.id, {}); {} END",
            trigger("insert"),
            view,
            require_id,
            data_table,
            row_object(table, "NEW"),
            insert_crud
        ),
        format!(
            "CREATE TRIGGER {} INSTEAD OF UPDATE ON {} FOR EACH ROW BEGIN SELECT CASE WHEN (OLD.id != NEW.id) THEN RAISE (FAIL, 'Cannot update id') END; UPDATE {} SET data = {} WHERE id = NEW.id; {} END",
            trigger("update"),
            view,
            data_table,
            row_object(table, "NEW"),
            update_crud
        ),
        format!(
            "CREATE TRIGGER {} INSTEAD OF DELETE ON {} FOR EACH ROW BEGIN DELETE FROM {} WHERE id = OLD.id; {} END",
            trigger("delete"),
            view,
            data_table,
            delete_crud
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assets_schema, open_temp};
    use crate::SqlValue;
    use serde_json::{json, Value};
    use tide_core::{Column, UpdateType};

    #[test]
    fn test_view_ddl() {
        let table = Table::new("assets")
            .column(Column::text("description"))
            .column(Column::integer("quantity"));
        let ddl = view_ddl(&table);
        assert!(ddl.starts_with("CREATE VIEW \"assets\" (\"id\", \"description\", \"quantity\")"));
        assert!(ddl.contains("CAST(json_extract(data, '$.quantity') AS INTEGER)"));
        assert!(ddl.ends_with("FROM \"ps_data__assets\""));
    }

    #[test]
    fn test_local_only_triggers_skip_crud() {
        let table = Table::new("drafts").column(Column::text("body")).local_only();
        assert!(trigger_ddl(&table).iter().all(|t| !t.contains("ps_crud")));

        let insert_only = Table::new("logs").column(Column::text("level")).insert_only();
        let triggers = trigger_ddl(&insert_only);
        assert_eq!(triggers.len(), 1);
        assert!(!triggers[0].contains("ps_data__logs"));
    }

    #[tokio::test]
    async fn test_insert_records_put_without_nulls() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();

        db.execute(
            "INSERT INTO assets (id, description, make) VALUES (?, ?, ?)",
            &["a1".into(), "test".into(), SqlValue::Null],
        )
        .await
        .unwrap();

        let tx = db.crud().next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(tx.crud.len(), 1);
        let entry = &tx.crud[0];
        assert_eq!(entry.op, UpdateType::Put);
        assert_eq!(entry.table, "assets");
        assert_eq!(
            Value::Object(entry.op_data.clone().unwrap()),
            json!({"description": "test"})
        );

        let rows: Vec<(String, Option<String>)> = db
            .get_all("SELECT id, description FROM assets", &[])
            .await
            .unwrap();
        assert_eq!(rows, vec![("a1".to_string(), Some("test".to_string()))]);
    }

    #[tokio::test]
    async fn test_update_records_changed_columns_only() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        db.execute(
            "INSERT INTO assets (id, description, make) VALUES ('a1', 'test', 'acme')",
            &[],
        )
        .await
        .unwrap();
        db.execute("UPDATE assets SET description = 'test2' WHERE id = 'a1'", &[])
            .await
            .unwrap();

        let batch = db.crud().crud_batch(10).await.unwrap();
        assert_eq!(batch.crud.len(), 2);
        assert_eq!(batch.crud[1].op, UpdateType::Patch);
        assert_eq!(
            Value::Object(batch.crud[1].op_data.clone().unwrap()),
            json!({"description": "test2"})
        );
    }

    #[tokio::test]
    async fn test_update_rejects_id_change() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        db.execute("INSERT INTO assets (id) VALUES ('a1')", &[]).await.unwrap();

        let err = db
            .execute("UPDATE assets SET id = 'a2' WHERE id = 'a1'", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Cannot update id"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        db.execute("INSERT INTO assets (id) VALUES ('a1')", &[]).await.unwrap();

        let err = db
            .execute("INSERT INTO assets (id) VALUES ('a1')", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
        assert_eq!(db.crud().pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reapply_keeps_rows() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&assets_schema()).await.unwrap();
        db.execute("INSERT INTO assets (id, description) VALUES ('a1', 'x')", &[])
            .await
            .unwrap();

        db.apply_schema(&assets_schema()).await.unwrap();
        let rows: Vec<(String,)> = db.get_all("SELECT id FROM assets", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
