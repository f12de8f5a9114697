//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Authentication │  │   Transport     │  │     Storage             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  no credentials │  │  Connection     │  │  DbError (rolled back,  │ │
//! │  │  no endpoint    │  │  Timeout        │  │  retried next cycle)    │ │
//! │  │  HTTP 401       │  │  Keepalive      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Checksum      │  │    Upload       │  │   Configuration         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  resync bucket  │  │  FatalUpload    │  │  InvalidConfig          │ │
//! │  │  stay connected │  │  (discarded)    │  │  InvalidUrl             │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only [`SyncError::is_auth_error`] and configuration errors reach the
//! caller of `connect()`. Everything else surfaces through `SyncStatus`.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Credentials are missing, expired, or rejected by the service.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // =========================================================================
    // Checksum Errors
    // =========================================================================
    /// Local bucket state disagrees with a checkpoint.
    #[error("Checksum mismatch for buckets: {}", buckets.join(", "))]
    ChecksumMismatch { buckets: Vec<String> },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// No line received within the keepalive deadline.
    #[error("No sync line received for {0} seconds")]
    KeepaliveTimeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Stream ended by the server.
    #[error("Disconnected from sync service")]
    Disconnected,

    // =========================================================================
    // Upload Errors
    // =========================================================================
    /// Backend rejected a transaction as structurally invalid. It is discarded.
    #[error("Upload rejected: {0}")]
    FatalUpload(String),

    /// Connector reported a transient upload failure.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Local database failure.
    #[error("Storage error: {0}")]
    Storage(#[from] tide_db::DbError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed line or request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Client is shutting down.
    #[error("Sync client is shutting down")]
    ShuttingDown,

    /// Another process holds the shared storage lock.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Http(response) => {
                let status = response.status().as_u16();
                if status == 401 {
                    SyncError::Authentication(format!("HTTP {}", status))
                } else {
                    SyncError::Http {
                        status,
                        message: "WebSocket upgrade rejected".into(),
                    }
                }
            }
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::Timeout(0);
        }
        match err.status() {
            Some(status) if status.as_u16() == 401 => {
                SyncError::Authentication(err.to_string())
            }
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_decode() => SyncError::Protocol(err.to_string()),
            None => SyncError::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConnectionFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the sync loop should back off and try again.
    ///
    /// Transport errors are retried without limit: the client is built for
    /// intermittent connectivity. Storage failures roll back and retry on
    /// the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Timeout(_)
                | SyncError::KeepaliveTimeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::Disconnected
                | SyncError::Storage(_)
                | SyncError::UploadFailed(_)
                | SyncError::Protocol(_)
                | SyncError::Authentication(_)
        ) || matches!(self, SyncError::Http { status, .. } if *status >= 500 || *status == 429)
    }

    /// Returns true if credentials must be refreshed before retrying.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Authentication(_))
            || matches!(self, SyncError::Http { status: 401, .. })
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::KeepaliveTimeout(60).is_retryable());
        assert!(SyncError::Http { status: 503, message: "busy".into() }.is_retryable());

        assert!(!SyncError::Http { status: 400, message: "bad".into() }.is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_auth_errors() {
        assert!(SyncError::Authentication("no token".into()).is_auth_error());
        assert!(SyncError::Http { status: 401, message: String::new() }.is_auth_error());
        assert!(!SyncError::Timeout(10).is_auth_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ChecksumMismatch {
            buckets: vec!["b1".into(), "b2".into()],
        };
        assert_eq!(err.to_string(), "Checksum mismatch for buckets: b1, b2");
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
    }
}
