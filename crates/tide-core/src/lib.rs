//! # tide-core: Pure Sync Types
//!
//! Everything the sync engine agrees on with the server and with local
//! storage, expressed as plain data and pure functions.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tide Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Host Application                             │   │
//! │  │      local reads/writes ──► SyncClient::connect(connector)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │         tide-sync (transport, state machine, uploads)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tide-db (SQLite adapter, bucket storage)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tide-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐                  │   │
//! │  │   │  bucket   │  │   crud    │  │  schema   │                  │   │
//! │  │   │ OplogEntry│  │ CrudEntry │  │  Table    │                  │   │
//! │  │   │ Checkpoint│  │ CrudTx    │  │  Column   │                  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘                  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bucket`] - Op ids, checksums, oplog entries, checkpoints, row folding
//! - [`crud`] - Local write queue entries and transactions
//! - [`schema`] - Table/column model and validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tide_core::bucket::Checksum;
//!
//! // Checksums are additive and wrap at 32 bits
//! let total: Checksum = [Checksum::new(20), Checksum::new(22)].into_iter().sum();
//! assert_eq!(total, Checksum::new(42));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bucket;
pub mod crud;
pub mod error;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use bucket::{
    fold_row_ops, BucketChecksum, BucketRequest, Checkpoint, CheckpointDiff, Checksum, OpId,
    OpType, OplogEntry, RowState, SyncDataBatch,
};
pub use crud::{CrudBatch, CrudEntry, CrudTransaction, UpdateType};
pub use error::{CoreError, CoreResult};
pub use schema::{Column, ColumnType, Schema, Table};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of columns per table (SQLite json_object argument limit / 2).
pub const MAX_COLUMNS: usize = 63;

/// Prefix reserved for internal tables.
pub const INTERNAL_TABLE_PREFIX: &str = "ps_";
