//! # Database Pool Management
//!
//! The Local Database Adapter: SQL execution, a read/write lock pool and
//! change notifications over one SQLite file.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Connection Pools                          │
//! │                                                                         │
//! │  Database::open(config)                                                │
//! │       │                                                                 │
//! │       ├──► writer pool (exactly 1 connection, read-write)              │
//! │       │        │                                                        │
//! │       │        └──► migrations                                         │
//! │       │                                                                 │
//! │       └──► reader pool (N connections, read-only)                      │
//! │                                                                         │
//! │  ┌───────────────────────────┐   ┌─────────────────────────────────┐   │
//! │  │ Write slot                │   │ Read slots                      │   │
//! │  │ ┌─────┐                   │   │ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ │   │
//! │  │ │ W   │ one active write  │   │ │ R1  │ │ R2  │ │ R3  │ │ R4  │ │   │
//! │  │ └─────┘ transaction       │   │ └─────┘ └─────┘ └─────┘ └─────┘ │   │
//! │  └───────────────────────────┘   └─────────────────────────────────┘   │
//! │                                                                         │
//! │  Idle read connections are queued FIFO: a released connection goes to   │
//! │  the back, the next read takes from the front, so the least recently    │
//! │  busy slot serves each read.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! WAL lets readers proceed while the single writer commits. Busy timeouts
//! serialize writers from other processes sharing the same file.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Arguments, FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::bucket::BucketStorage;
use crate::repository::crud::CrudQueue;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tide.db")
///     .read_connections(4)
///     .busy_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file. Created if missing.
    pub database_path: PathBuf,

    /// Number of read slots.
    /// Default: 4
    pub read_connections: u32,

    /// How long a statement waits on a lock held by another connection or process.
    /// Default: 30 seconds
    pub busy_timeout: Duration,

    /// How long to wait for a free connection.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Whether to run migrations on open.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            read_connections: 4,
            busy_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    pub fn read_connections(mut self, count: u32) -> Self {
        self.read_connections = count.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }
}

// =============================================================================
// Parameters and Results
// =============================================================================

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Outcome of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub insert_id: i64,
}

/// Tables whose visible contents changed after a sync materialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableUpdate {
    pub tables: BTreeSet<String>,
}

impl TableUpdate {
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

fn arguments<'q>(params: &[SqlValue]) -> DbResult<SqliteArguments<'q>> {
    let mut args = SqliteArguments::default();
    for param in params {
        let added = match param {
            SqlValue::Null => args.add(Option::<i64>::None),
            SqlValue::Integer(v) => args.add(*v),
            SqlValue::Real(v) => args.add(*v),
            SqlValue::Text(v) => args.add(v.clone()),
            SqlValue::Blob(v) => args.add(v.clone()),
        };
        added.map_err(|e| DbError::QueryFailed(e.to_string()))?;
    }
    Ok(args)
}

async fn execute_on(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlValue],
) -> DbResult<ExecuteResult> {
    let result = sqlx::query_with(sql, arguments(params)?)
        .execute(conn)
        .await?;
    Ok(ExecuteResult {
        rows_affected: result.rows_affected(),
        insert_id: result.last_insert_rowid(),
    })
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the local database. Cheap to clone; all clones share the pools.
///
/// ## Usage
/// ```rust,ignore
/// let db = Database::open(DbConfig::new("./tide.db")).await?;
/// db.apply_schema(&schema).await?;
///
/// db.execute("INSERT INTO assets(id, description) VALUES (?, ?)", &["a1".into(), "desk".into()]).await?;
/// let rows: Vec<(String,)> = db.get_all("SELECT id FROM assets", &[]).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    writer: SqlitePool,
    readers: SqlitePool,
    path: Arc<PathBuf>,
    crud_changed: Arc<Notify>,
    table_updates: broadcast::Sender<TableUpdate>,
}

impl Database {
    /// Opens (creating if needed) the database and runs migrations.
    ///
    /// ## What This Does
    /// 1. Opens the single writer connection (WAL, NORMAL synchronous, foreign keys)
    /// 2. Runs migrations on the writer (if enabled)
    /// 3. Opens the read-only reader pool
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Opening local database"
        );

        let base = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let writer_options = base
            .clone()
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(None)
            .connect_with(writer_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        if config.run_migrations {
            migrations::run_migrations(&writer).await?;
        }

        let readers = SqlitePoolOptions::new()
            .max_connections(config.read_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect_with(base.read_only(true))
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            read_connections = config.read_connections,
            "Database pools created"
        );

        let (table_updates, _) = broadcast::channel(64);

        Ok(Database {
            writer,
            readers,
            path: Arc::new(config.database_path),
            crud_changed: Arc::new(Notify::new()),
            table_updates,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Statement Execution
    // =========================================================================

    /// Executes one statement in its own write transaction.
    ///
    /// Writes through views are queued for upload under a fresh transaction id.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<ExecuteResult> {
        let mut tx = self.write_transaction().await?;
        let result = tx.execute(sql, params).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Runs a query on a read slot and maps every row.
    pub async fn get_all<T>(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(sqlx::query_as_with::<_, T, _>(sql, arguments(params)?)
            .fetch_all(&self.readers)
            .await?)
    }

    /// Runs a query on a read slot; errors with `NotFound` when there is no row.
    pub async fn get<T>(&self, sql: &str, params: &[SqlValue]) -> DbResult<T>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        self.get_optional(sql, params)
            .await?
            .ok_or_else(|| DbError::not_found("Row", sql))
    }

    pub async fn get_optional<T>(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(sqlx::query_as_with::<_, T, _>(sql, arguments(params)?)
            .fetch_optional(&self.readers)
            .await?)
    }

    // =========================================================================
    // Locks and Transactions
    // =========================================================================

    /// Holds a read slot until the connection is dropped.
    pub async fn read_lock(&self) -> DbResult<PoolConnection<Sqlite>> {
        Ok(self.readers.acquire().await?)
    }

    /// Holds the write slot until the guard is dropped. Excludes every other writer.
    ///
    /// Statements run in autocommit mode. Writes through views are queued
    /// under one transaction id allocated here, separate from any earlier one.
    pub async fn write_lock(&self) -> DbResult<WriteLock> {
        let mut conn = self.writer.acquire().await?;
        let transaction_id = allocate_transaction_id(&mut conn).await?;
        debug!(tx_id = transaction_id, "Write lock taken");
        Ok(WriteLock {
            conn,
            transaction_id,
            crud_changed: self.crud_changed.clone(),
        })
    }

    /// A consistent snapshot on a read slot. Rolled back when dropped.
    pub async fn read_transaction(&self) -> DbResult<Transaction<'static, Sqlite>> {
        Ok(self.readers.begin().await?)
    }

    /// Begins an application write transaction and allocates its local transaction id.
    ///
    /// Rolled back when dropped without [`WriteTransaction::commit`].
    pub async fn write_transaction(&self) -> DbResult<WriteTransaction> {
        let mut tx = self.writer.begin().await?;
        let transaction_id = allocate_transaction_id(&mut tx).await?;
        debug!(tx_id = transaction_id, "Write transaction started");

        Ok(WriteTransaction {
            tx,
            transaction_id,
            crud_changed: self.crud_changed.clone(),
        })
    }

    /// Write transaction for internal sync bookkeeping. Does not allocate a local transaction id.
    pub(crate) async fn begin_internal(&self) -> DbResult<Transaction<'static, Sqlite>> {
        Ok(self.writer.begin().await?)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Signalled after every committed application write.
    pub fn crud_notifier(&self) -> Arc<Notify> {
        self.crud_changed.clone()
    }

    pub fn subscribe_table_updates(&self) -> broadcast::Receiver<TableUpdate> {
        self.table_updates.subscribe()
    }

    pub(crate) fn notify_table_updates(&self, update: TableUpdate) {
        if update.tables.is_empty() {
            return;
        }
        // No subscribers is fine.
        let _ = self.table_updates.send(update);
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Bucket storage over this database.
    pub fn buckets(&self) -> BucketStorage {
        BucketStorage::new(self.clone())
    }

    /// The local write queue.
    pub fn crud(&self) -> CrudQueue {
        CrudQueue::new(self.clone())
    }

    pub async fn migration_status(&self) -> DbResult<(usize, usize)> {
        migrations::migration_status(&self.writer).await
    }

    /// Closes both pools. Later operations fail.
    pub async fn close(&self) {
        info!("Closing database connection pools");
        self.readers.close().await;
        self.writer.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.readers).await.is_ok()
    }
}

// =============================================================================
// Write Transaction
// =============================================================================

async fn allocate_transaction_id(conn: &mut SqliteConnection) -> DbResult<i64> {
    Ok(sqlx::query_scalar(
        "UPDATE ps_tx SET current_tx = next_tx, next_tx = next_tx + 1 WHERE id = 1 RETURNING current_tx",
    )
    .fetch_one(conn)
    .await?)
}

/// Exclusive use of the write connection, from [`Database::write_lock`].
///
/// Dropping it wakes the uploader, since statements may have queued entries.
pub struct WriteLock {
    conn: PoolConnection<Sqlite>,
    transaction_id: i64,
    crud_changed: Arc<Notify>,
}

impl WriteLock {
    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<ExecuteResult> {
        execute_on(&mut self.conn, sql, params).await
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.crud_changed.notify_one();
    }
}

/// An open application write transaction.
///
/// Every CRUD entry recorded while it is open shares [`Self::transaction_id`].
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    transaction_id: i64,
    crud_changed: Arc<Notify>,
}

impl WriteTransaction {
    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    /// Raw connection for queries not covered by the helpers.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<ExecuteResult> {
        execute_on(&mut self.tx, sql, params).await
    }

    pub async fn get_all<T>(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(sqlx::query_as_with::<_, T, _>(sql, arguments(params)?)
            .fetch_all(&mut *self.tx)
            .await?)
    }

    pub async fn get_optional<T>(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(sqlx::query_as_with::<_, T, _>(sql, arguments(params)?)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    pub async fn commit(self) -> DbResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        self.crud_changed.notify_one();
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_temp;

    #[tokio::test]
    async fn test_open_and_health_check() {
        let (db, _dir) = open_temp().await;
        assert!(db.health_check().await);

        let (total, applied) = db.migration_status().await.unwrap();
        assert_eq!(total, applied);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .read_connections(0)
            .busy_timeout(Duration::from_secs(1));

        assert_eq!(config.read_connections, 1);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let (db, _dir) = open_temp().await;
        db.execute("CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT, n INTEGER)", &[])
            .await
            .unwrap();

        let result = db
            .execute(
                "INSERT INTO notes (id, body, n) VALUES (?, ?, ?)",
                &["n1".into(), "hello".into(), SqlValue::from(Some(3i64))],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);

        let rows: Vec<(String, String, i64)> =
            db.get_all("SELECT id, body, n FROM notes", &[]).await.unwrap();
        assert_eq!(rows, vec![("n1".to_string(), "hello".to_string(), 3)]);

        let missing: Option<(String,)> = db
            .get_optional("SELECT id FROM notes WHERE id = ?", &["nope".into()])
            .await
            .unwrap();
        assert!(missing.is_none());
        assert!(matches!(
            db.get::<(String,)>("SELECT id FROM notes WHERE id = ?", &["nope".into()]).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_ids_increase() {
        let (db, _dir) = open_temp().await;
        let first = db.write_transaction().await.unwrap();
        let a = first.transaction_id();
        first.commit().await.unwrap();

        let second = db.write_transaction().await.unwrap();
        assert!(second.transaction_id() > a);
    }

    #[tokio::test]
    async fn test_dropped_write_transaction_rolls_back() {
        let (db, _dir) = open_temp().await;
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

        {
            let mut tx = db.write_transaction().await.unwrap();
            tx.execute("INSERT INTO t (v) VALUES (1)", &[]).await.unwrap();
            // dropped without commit
        }

        let count: (i64,) = db.get("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_reads_proceed_during_write() {
        let (db, _dir) = open_temp().await;
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        db.execute("INSERT INTO t (v) VALUES (1)", &[]).await.unwrap();

        let mut tx = db.write_transaction().await.unwrap();
        tx.execute("INSERT INTO t (v) VALUES (2)", &[]).await.unwrap();

        // Two concurrent read slots see the last committed state.
        let _held = db.read_lock().await.unwrap();
        let count: (i64,) = db.get("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count.0, 1);

        tx.commit().await.unwrap();
        let count: (i64,) = db.get("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count.0, 2);
    }

    #[tokio::test]
    async fn test_write_lock_starts_new_transaction() {
        let (db, _dir) = open_temp().await;
        db.apply_schema(&crate::test_support::assets_schema()).await.unwrap();
        db.execute("INSERT INTO assets (id, description) VALUES ('a1', 'desk')", &[])
            .await
            .unwrap();

        let mut lock = db.write_lock().await.unwrap();
        lock.execute("INSERT INTO assets (id, description) VALUES ('a2', 'lamp')", &[])
            .await
            .unwrap();
        lock.execute("UPDATE assets SET description = 'big lamp' WHERE id = 'a2'", &[])
            .await
            .unwrap();
        let lock_tx = lock.transaction_id();
        drop(lock);

        let crud = db.crud();
        let first = crud.next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(first.crud.len(), 1);
        assert_eq!(first.crud[0].id, "a1");
        assert_ne!(first.transaction_id, Some(lock_tx));

        crud.mark_uploaded(&first, None).await.unwrap();
        let second = crud.next_crud_transaction().await.unwrap().unwrap();
        assert_eq!(second.transaction_id, Some(lock_tx));
        assert_eq!(second.crud.len(), 2);
    }

    #[tokio::test]
    async fn test_read_only_slots_reject_writes() {
        let (db, _dir) = open_temp().await;
        let mut conn = db.read_lock().await.unwrap();
        let result = sqlx::query("CREATE TABLE x (v INTEGER)")
            .execute(&mut *conn)
            .await;
        assert!(result.is_err());
    }
}
