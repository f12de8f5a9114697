//! # tide-sync: Streaming Sync Client
//!
//! Keeps a local SQLite database consistent with a replication service and
//! pushes local writes to the application's backend.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Client Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncClient (explicit context object)            │  │
//! │  │                                                                  │  │
//! │  │  connect(connector) / disconnect()                               │  │
//! │  │  status() / subscribe_status() / add_emitter()                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ StreamingSync  │  │     Remote     │  │  CrudUploader          │    │
//! │  │ Client         │  │                │  │                        │    │
//! │  │ checkpoint →   │  │ credentials    │  │ oldest transaction     │    │
//! │  │ data → apply   │  │ cache + HTTP   │  │ first, fatal errors    │    │
//! │  │ backoff        │  │ StreamTransport│  │ discarded              │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                               │                                         │
//! │                  ┌────────────┴────────────┐                            │
//! │                  ▼                         ▼                            │
//! │        WebSocketTransport         HttpStreamTransport                   │
//! │        (request_n credits)        (ndjson, read pausing)                │
//! │                  └──────── DataStream ─────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - `SyncClient`, connection lifecycle
//! - [`streaming`] - Download state machine
//! - [`upload`] - CRUD upload loop
//! - [`remote`] - Authenticated requests to the sync service
//! - [`transport`] - WebSocket and HTTP stream transports
//! - [`stream`] - `DataStream` queue and credit accounting
//! - [`protocol`] - Request and line types
//! - [`connector`] - Application-supplied credentials and upload handler
//! - [`credentials`] - Token cache with early refresh
//! - [`lock`] - Lock registry and cross-process storage lock
//! - [`status`] - `SyncStatus` and event emitters
//! - [`config`] - TOML and environment configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tide_sync::{SyncClient, SyncConfig};
//! use tide_db::{Database, DbConfig};
//!
//! let db = Database::open(DbConfig::new("app.db")).await?;
//! let client = SyncClient::new(db, SyncConfig::load_or_default(None)).await?;
//!
//! client.connect(Arc::new(MyConnector::new())).await?;
//! client.wait_for_first_sync().await?;
//! println!("Connected: {}", client.status().connected);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod remote;
pub mod status;
pub mod stream;
pub mod streaming;
pub mod transport;
pub mod upload;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::SyncClient;
pub use config::{StorageSettings, StreamSettings, SyncConfig, TransportKind, UploadSettings};
pub use connector::{BackendConnector, ConnectorError, UploadError};
pub use credentials::{Credentials, CredentialsCache};
pub use error::{SyncError, SyncResult};
pub use lock::{DatabaseId, LockKey, LockPurpose, LockRegistry, SharedStorageLock};
pub use protocol::{StreamingSyncLine, StreamingSyncRequest};
pub use remote::Remote;
pub use status::{ConnectionState, DataFlow, NoOpEmitter, SyncEventEmitter, SyncStatus};
pub use stream::{CreditWindow, DataStream, DataStreamEvent};
pub use streaming::StreamingSyncClient;
pub use transport::{HttpStreamTransport, StreamTarget, StreamTransport, WebSocketTransport};
pub use upload::CrudUploader;
