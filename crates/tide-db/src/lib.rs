//! # tide-db: Local Database Adapter and Bucket Storage
//!
//! SQLite access for the sync engine: a single writer connection plus a
//! pool of read-only connections, the internal sync tables, and the
//! repositories that move data between the operation log, the visible
//! tables and the upload queue.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tide Data Flow                                 │
//! │                                                                         │
//! │  app SQL ──► views ──triggers──► ps_data__*  +  ps_crud                 │
//! │                                                 │                       │
//! │  ┌──────────────────────────────────────────────┼──────────────────┐   │
//! │  │                     tide-db (THIS CRATE)     │                  │   │
//! │  │                                              ▼                  │   │
//! │  │   ┌───────────────┐    ┌────────────────┐  ┌──────────────┐    │   │
//! │  │   │   Database    │    │ BucketStorage  │  │  CrudQueue   │    │   │
//! │  │   │   (pool.rs)   │◄───│ oplog, verify, │  │ next tx,     │    │   │
//! │  │   │ 1 writer      │    │ materialize,   │  │ complete,    │    │   │
//! │  │   │ N readers     │    │ compact        │  │ write target │    │   │
//! │  │   └───────────────┘    └────────────────┘  └──────────────┘    │   │
//! │  │          ▲                                                      │   │
//! │  │          └── schema.rs: views + triggers from a declared Schema │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connections, statement execution, transactions, notifications
//! - [`schema`] - View and trigger generation
//! - [`migrations`] - Embedded migrations for the internal tables
//! - [`repository`] - Bucket storage and CRUD queue
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tide_db::{Database, DbConfig};
//!
//! let db = Database::open(DbConfig::new("path/to/tide.db")).await?;
//! db.apply_schema(&schema).await?;
//!
//! let pending = db.crud().pending_count().await?;
//! let cursors = db.buckets().bucket_states().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{
    Database, DbConfig, ExecuteResult, SqlValue, TableUpdate, WriteLock, WriteTransaction,
};

pub use repository::bucket::{
    BucketProgress, BucketStorage, ChecksumFailure, ChecksumValidation, CompactStats,
    SyncLocalOutcome,
};
pub use repository::crud::CrudQueue;

#[cfg(test)]
pub(crate) mod test_support {
    use tide_core::{Column, Schema, Table};

    use crate::{Database, DbConfig};

    /// Opens a fresh database in a temp directory. Keep the directory alive for the test.
    pub async fn open_temp() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbConfig::new(dir.path().join("test.db")))
            .await
            .unwrap();
        (db, dir)
    }

    pub fn assets_schema() -> Schema {
        Schema::new(vec![Table::new("assets")
            .column(Column::text("description"))
            .column(Column::text("make"))
            .column(Column::integer("quantity"))])
    }
}
