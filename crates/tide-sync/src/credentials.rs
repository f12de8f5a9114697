//! # Credentials Cache
//!
//! Resolves credentials through the connector and reuses them until they
//! come within [`REFRESH_MARGIN_SECS`] of expiry.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connector::BackendConnector;
use crate::error::{SyncError, SyncResult};

/// Refresh this long before `expires_at`.
pub const REFRESH_MARGIN_SECS: i64 = 30;

/// Where to sync from and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL of the sync service.
    pub endpoint: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Credentials {
            endpoint: endpoint.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when the token expires within the refresh margin.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(REFRESH_MARGIN_SECS) >= expires_at,
            None => false,
        }
    }
}

/// Shared cache in front of [`BackendConnector::fetch_credentials`]. Cheap to clone.
#[derive(Clone)]
pub struct CredentialsCache {
    connector: Arc<dyn BackendConnector>,
    cached: Arc<RwLock<Option<Credentials>>>,
}

impl CredentialsCache {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        CredentialsCache {
            connector,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Current credentials, fetching when absent or about to expire.
    ///
    /// `Ok(None)` means the application is not signed in.
    pub async fn get(&self) -> SyncResult<Option<Credentials>> {
        {
            let guard = self.cached.read().await;
            if let Some(creds) = guard.as_ref() {
                if !creds.needs_refresh(Utc::now()) {
                    return Ok(Some(creds.clone()));
                }
            }
        }

        let mut guard = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(creds) = guard.as_ref() {
            if !creds.needs_refresh(Utc::now()) {
                return Ok(Some(creds.clone()));
            }
        }

        let fresh = self.fetch().await?;
        *guard = fresh.clone();
        Ok(fresh)
    }

    /// Current credentials or an authentication error.
    pub async fn require(&self) -> SyncResult<Credentials> {
        let creds = self
            .get()
            .await?
            .ok_or_else(|| SyncError::Authentication("Not signed in".into()))?;
        if creds.endpoint.trim().is_empty() {
            return Err(SyncError::Authentication("No endpoint configured".into()));
        }
        Ok(creds)
    }

    /// Drops the cached token so the next request fetches a new one.
    pub async fn invalidate(&self) {
        debug!("Invalidating cached credentials");
        *self.cached.write().await = None;
    }

    /// Fetches new credentials in the background, keeping the current ones on failure.
    pub fn prefetch(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            match cache.fetch().await {
                Ok(Some(creds)) => {
                    *cache.cached.write().await = Some(creds);
                    info!("Prefetched credentials");
                }
                Ok(None) => warn!("Credential prefetch returned no credentials"),
                Err(e) => warn!(error = %e, "Credential prefetch failed"),
            }
        });
    }

    async fn fetch(&self) -> SyncResult<Option<Credentials>> {
        let creds = self
            .connector
            .fetch_credentials()
            .await
            .map_err(|e| SyncError::Authentication(e.to_string()))?;
        debug!(present = creds.is_some(), "Fetched credentials");
        Ok(creds)
    }
}
