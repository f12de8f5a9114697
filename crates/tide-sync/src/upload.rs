//! # CRUD Uploader
//!
//! Drains the local write queue through the application's connector, one
//! transaction at a time and strictly in creation order.
//!
//! ## Upload Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  local commit ─┐                                                        │
//! │  poll tick ────┼──► next_crud_transaction()                             │
//! │                │         │                                              │
//! │                │         ├── None ──► write checkpoint fetch            │
//! │                │         │            (if the target is still MAX)      │
//! │                │         ▼                                              │
//! │                │    connector.upload_data(queue)                        │
//! │                │         │                                              │
//! │                │         ├── Ok ─────────► same tx still first?         │
//! │                │         │                  yes: "made no progress"     │
//! │                │         │                  no:  next transaction       │
//! │                │         ├── Fatal ──────► mark_uploaded (discard)      │
//! │                │         └── Retryable ──► backoff, retry same tx       │
//! │                │                           local commits don't wake it  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use tide_core::OpId;
use tide_db::{BucketStorage, CrudQueue};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadSettings;
use crate::connector::{BackendConnector, UploadError};
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockKey, LockRegistry};
use crate::remote::Remote;
use crate::status::StatusHub;

pub struct CrudUploader {
    crud: CrudQueue,
    storage: BucketStorage,
    connector: Arc<dyn BackendConnector>,
    remote: Remote,
    status: StatusHub,
    settings: UploadSettings,
    changed: Arc<Notify>,
    locks: LockRegistry,
    lock_key: LockKey,
}

impl CrudUploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crud: CrudQueue,
        storage: BucketStorage,
        connector: Arc<dyn BackendConnector>,
        remote: Remote,
        status: StatusHub,
        settings: UploadSettings,
        changed: Arc<Notify>,
        locks: LockRegistry,
        lock_key: LockKey,
    ) -> Self {
        CrudUploader {
            crud,
            storage,
            connector,
            remote,
            status,
            settings,
            changed,
            locks,
            lock_key,
        }
    }

    /// Uploads until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!("CRUD uploader starting");
        let mut backoff = self.create_backoff();

        loop {
            let result = {
                let _guard = tokio::select! {
                    guard = self.locks.acquire(&self.lock_key) => guard,
                    _ = cancel.cancelled() => break,
                };
                tokio::select! {
                    result = self.upload_all(&cancel) => result,
                    _ = cancel.cancelled() => Err(SyncError::ShuttingDown),
                }
            };

            match result {
                Ok(()) => {
                    backoff.reset();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.changed.notified() => debug!("Local write, checking upload queue"),
                        _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                    }
                }
                Err(SyncError::ShuttingDown) => break,
                Err(e) => {
                    warn!(error = %e, "Upload failed, will retry");
                    self.status.update(|s| s.data_flow.uploading = false);
                    self.status.error(&e.to_string(), true);
                    let wait = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.settings.retry_max_backoff());
                    // New local writes do not shorten the backoff.
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        self.status.update(|s| s.data_flow.uploading = false);
        info!("CRUD uploader stopped");
    }

    /// Uploads until the queue is empty.
    async fn upload_all(&self, cancel: &CancellationToken) -> SyncResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::ShuttingDown);
            }

            let depth = self.crud.pending_count().await?;
            let Some(transaction) = self.crud.next_crud_transaction().await? else {
                self.status.update(|s| {
                    s.upload_queue_depth = 0;
                    s.data_flow.uploading = false;
                });
                return self.settle_write_target(cancel).await;
            };
            self.status.update(|s| {
                s.upload_queue_depth = depth;
                s.data_flow.uploading = true;
            });

            let first = transaction.crud.first().map(|entry| entry.client_id);
            debug!(
                transaction_id = ?transaction.transaction_id,
                entries = transaction.crud.len(),
                "Uploading transaction"
            );

            match self.connector.upload_data(&self.crud).await {
                Ok(()) => {
                    let next = self.crud.next_crud_transaction().await?;
                    let next_first = next.and_then(|t| t.crud.first().map(|entry| entry.client_id));
                    if next_first.is_some() && next_first == first {
                        return Err(SyncError::UploadFailed(format!(
                            "upload_data returned without completing entry {}",
                            first.unwrap_or_default()
                        )));
                    }
                }
                Err(UploadError::Fatal { code, message }) => {
                    error!(
                        code = %code,
                        message = %message,
                        transaction_id = ?transaction.transaction_id,
                        "Backend rejected transaction, discarding it"
                    );
                    self.crud.mark_uploaded(&transaction, None).await?;
                    let reason = SyncError::FatalUpload(format!("{}: {}", code, message));
                    self.status.upload_discarded(&transaction, &reason.to_string());
                }
                Err(UploadError::Retryable(message)) => {
                    return Err(SyncError::UploadFailed(message));
                }
            }

            self.status.update(|s| s.data_flow.uploaded_transactions += 1);
        }
    }

    /// Learns the server's write checkpoint once the queue drained without one.
    async fn settle_write_target(&self, cancel: &CancellationToken) -> SyncResult<()> {
        if self.crud.local_target().await? != Some(OpId::MAX) {
            return Ok(());
        }
        let client_id = self.storage.client_id().await?;
        let checkpoint = self.remote.write_checkpoint(&client_id, cancel).await?;
        if self.crud.update_local_target(checkpoint).await? {
            debug!(write_checkpoint = %checkpoint, "Write checkpoint received");
        }
        Ok(())
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.settings.retry_initial_backoff(),
            max_interval: self.settings.retry_max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
