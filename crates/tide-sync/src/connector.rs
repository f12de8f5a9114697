//! # Backend Connector
//!
//! The capability the application supplies: where to sync from, with which
//! token, and how to write queued local changes to its backend of record.
//!
//! ```text
//! ┌──────────────────┐  fetch_credentials()   ┌──────────────────────────┐
//! │                  │ ─────────────────────► │  endpoint + token        │
//! │   tide-sync      │                        │  (app auth service)      │
//! │                  │  upload_data(queue)    ├──────────────────────────┤
//! │                  │ ─────────────────────► │  next_crud_transaction() │
//! │                  │                        │  POST to backend         │
//! │                  │ ◄───────────────────── │  mark_uploaded()         │
//! └──────────────────┘   Ok | Fatal | Retry   └──────────────────────────┘
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tide_db::CrudQueue;

pub use crate::credentials::Credentials;

/// Failure fetching credentials from the application.
#[derive(Debug, Clone, Error)]
#[error("Credential fetch failed: {0}")]
pub struct ConnectorError(pub String);

impl ConnectorError {
    pub fn new(message: impl Into<String>) -> Self {
        ConnectorError(message.into())
    }
}

/// Failure reported by [`BackendConnector::upload_data`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// The backend rejected the data itself. Retrying cannot succeed.
    #[error("Fatal upload error {code}: {message}")]
    Fatal { code: String, message: String },

    /// Network or transient server failure. The transaction stays queued.
    #[error("Retryable upload error: {0}")]
    Retryable(String),
}

impl UploadError {
    /// Classifies a backend error code.
    ///
    /// Postgres data exceptions (`22xxx`), integrity violations (`23xxx`),
    /// access or syntax errors (`42xxx`) and PostgREST errors (`PGRSTxxx`)
    /// are fatal. Anything else is retried.
    pub fn from_backend_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let fatal = code.starts_with("PGRST")
            || (code.len() == 5 && ["22", "23", "42"].iter().any(|class| code.starts_with(class)));

        if fatal {
            UploadError::Fatal {
                code: code.to_string(),
                message,
            }
        } else {
            UploadError::Retryable(format!("{}: {}", code, message))
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, UploadError::Fatal { .. })
    }
}

/// Application-supplied credentials and upload handler.
///
/// ## Example
/// ```rust,ignore
/// struct MyConnector { http: reqwest::Client }
///
/// #[async_trait]
/// impl BackendConnector for MyConnector {
///     async fn fetch_credentials(&self) -> Result<Option<Credentials>, ConnectorError> {
///         Ok(Some(Credentials::new("https://sync.example.com", "token")))
///     }
///
///     async fn upload_data(&self, queue: &CrudQueue) -> Result<(), UploadError> {
///         let Some(tx) = queue.next_crud_transaction().await.map_err(retry)? else { return Ok(()) };
///         self.http.post(URL).json(&tx.crud).send().await.map_err(retry)?;
///         queue.mark_uploaded(&tx, None).await.map_err(retry)
///     }
/// }
/// ```
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// `Ok(None)` means "not signed in": the client cannot connect yet.
    async fn fetch_credentials(&self) -> Result<Option<Credentials>, ConnectorError>;

    /// Uploads the next queued transaction and completes it.
    ///
    /// Returning `Ok` without completing anything while entries are queued
    /// is reported as an upload that made no progress.
    async fn upload_data(&self, queue: &CrudQueue) -> Result<(), UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_code_classification() {
        assert!(UploadError::from_backend_code("23505", "duplicate key").is_fatal());
        assert!(UploadError::from_backend_code("22P02", "invalid input").is_fatal());
        assert!(UploadError::from_backend_code("42501", "permission denied").is_fatal());
        assert!(UploadError::from_backend_code("PGRST204", "no column").is_fatal());

        assert!(!UploadError::from_backend_code("08006", "connection failure").is_fatal());
        assert!(!UploadError::from_backend_code("2300", "short").is_fatal());
        assert!(!UploadError::from_backend_code("503", "unavailable").is_fatal());
    }
}
