//! # Error Types
//!
//! Domain-specific error types for tide-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tide-core errors (this file)                                          │
//! │  └── CoreError        - Malformed wire data, invalid schema            │
//! │                                                                         │
//! │  tide-db errors (separate crate)                                       │
//! │  └── DbError          - Local database failures                        │
//! │                                                                         │
//! │  tide-sync errors (separate crate)                                     │
//! │  └── SyncError        - Auth, transport, checksum, upload failures     │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → SyncStatus.last_error         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by pure validation and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    // =========================================================================
    // Wire Data Errors
    // =========================================================================
    /// Op type string not one of PUT/PATCH/REMOVE/MOVE/CLEAR.
    #[error("Invalid op type: {0}")]
    InvalidOpType(String),

    /// Op id could not be parsed as a 64-bit integer.
    #[error("Invalid op id: {0}")]
    InvalidOpId(String),

    /// The `data` field of an operation is neither an object nor a JSON-encoded object.
    #[error("Invalid operation data for {row_type}/{row_id}: {message}")]
    InvalidOpData {
        row_type: String,
        row_id: String,
        message: String,
    },

    /// A stored CRUD payload could not be decoded.
    #[error("Invalid CRUD entry {id}: {message}")]
    InvalidCrudEntry { id: i64, message: String },

    /// A checkpoint diff arrived without a base checkpoint.
    #[error("Checkpoint diff received without a base checkpoint")]
    MissingBaseCheckpoint,

    // =========================================================================
    // Schema Errors
    // =========================================================================
    /// Table or column name is not a plain identifier.
    #[error("Invalid name '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidName(String),

    /// Too many columns on a table.
    #[error("Table {table} has {count} columns, maximum is {max}")]
    TooManyColumns {
        table: String,
        count: usize,
        max: usize,
    },

    /// Column named after the implicit primary key.
    #[error("Table {0} declares an 'id' column; the id column is implicit")]
    ReservedColumn(String),

    /// Same table or column declared twice.
    #[error("Duplicate name '{0}'")]
    DuplicateName(String),

    /// Table uses the internal table prefix.
    #[error("Table name '{0}' uses the reserved ps_ prefix")]
    ReservedPrefix(String),

    /// Contradictory table options.
    #[error("Table {0} cannot be both local-only and insert-only")]
    ConflictingOptions(String),
}
