//! # Streaming Sync
//!
//! The download half of the client: keeps a stream open, writes what
//! arrives into bucket storage and applies complete checkpoints.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────────────┐   run()    ┌────────────┐  stream open  ┌────────┐   │
//! │   │ Disconnected │ ─────────► │ Connecting │ ────────────► │ Active │   │
//! │   └──────────────┘            └────────────┘               └────────┘   │
//! │          ▲                        ▲    ▲                     │   │      │
//! │          │ cancel                 │    │ token expired       │   │      │
//! │          │ (any state)            │    └─────────────────────┘   │      │
//! │          │                   backoff                             │      │
//! │          │                        │       ┌───────┐  transport   │      │
//! │          │                        └────── │ Error │ ◄─ error ────┘      │
//! │          │                                └───────┘  keepalive          │
//! │                                                                         │
//! │   Checksum failure: drop the failing buckets, reopen after 50ms.        │
//! │   Status stays Active.                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tide_core::Checkpoint;
use tide_db::{BucketStorage, SyncLocalOutcome};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamSettings;
use crate::credentials::REFRESH_MARGIN_SECS;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{StreamingSyncLine, StreamingSyncRequest};
use crate::remote::Remote;
use crate::status::{ConnectionState, StatusHub};
use crate::transport::LineStream;

/// Pause before reopening after a checksum failure.
const RESYNC_DELAY: Duration = Duration::from_millis(50);

/// Why a stream ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Cancelled,
    /// The server reported the token expired; credentials were dropped.
    TokenExpired,
    /// Buckets failed validation and were removed.
    Resync,
}

pub struct StreamingSyncClient {
    storage: BucketStorage,
    remote: Remote,
    status: StatusHub,
    settings: StreamSettings,
}

impl StreamingSyncClient {
    pub fn new(
        storage: BucketStorage,
        remote: Remote,
        status: StatusHub,
        settings: StreamSettings,
    ) -> Self {
        StreamingSyncClient {
            storage,
            remote,
            status,
            settings,
        }
    }

    /// Syncs until `cancel` fires. Never returns an error: failures are
    /// reported through the status and retried.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Streaming sync starting");
        let mut backoff = self.create_backoff();
        let mut stay_connected = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !stay_connected {
                self.status.update(|s| s.set_state(ConnectionState::Connecting));
            }
            stay_connected = false;

            match self.streaming_iteration(&cancel, &mut backoff).await {
                Ok(StreamEnd::Cancelled) | Err(SyncError::ShuttingDown) => break,
                Ok(StreamEnd::TokenExpired) => {
                    info!("Token expired, reconnecting with fresh credentials");
                }
                Ok(StreamEnd::Resync) => {
                    stay_connected = true;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RESYNC_DELAY) => {}
                    }
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(error = %e, "Sync stream failed");
                    } else {
                        error!(error = %e, "Sync stream failed");
                    }
                    self.status.update(|s| {
                        s.set_state(ConnectionState::Error);
                        s.data_flow.downloading = false;
                    });
                    self.status.error(&e.to_string(), e.is_retryable());

                    let Some(delay) = backoff.next_backoff() else {
                        error!("Backoff exhausted");
                        break;
                    };
                    debug!(?delay, "Waiting before reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            info!("Shutdown during backoff");
                            break;
                        }
                    }
                }
            }
        }

        self.status.update(|s| {
            s.set_state(ConnectionState::Disconnected);
            s.data_flow.downloading = false;
        });
        info!("Streaming sync stopped");
    }

    /// One stream, from request to end.
    async fn streaming_iteration(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> SyncResult<StreamEnd> {
        let buckets = self.storage.bucket_states().await?;
        let client_id = self.storage.client_id().await?;
        debug!(buckets = buckets.len(), "Opening sync stream");
        let request =
            StreamingSyncRequest::new(buckets, self.settings.parameters.clone(), client_id);

        let stream_cancel = cancel.child_token();
        let stream = self.remote.open_stream(&request, stream_cancel.clone()).await?;

        let result = self.consume(&stream, cancel, backoff).await;
        stream.close();
        stream_cancel.cancel();
        result
    }

    async fn consume(
        &self,
        stream: &LineStream,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> SyncResult<StreamEnd> {
        self.status.update(|s| s.set_state(ConnectionState::Active));
        let keepalive = self.settings.keepalive_timeout();
        let mut target: Option<Checkpoint> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = timeout(keepalive, stream.read()) => next,
            };
            let line = match next {
                Err(_) => return Err(SyncError::KeepaliveTimeout(keepalive.as_secs())),
                Ok(None) => return Err(SyncError::Disconnected),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(line))) => line,
            };
            backoff.reset();
            debug!(line = line.type_name(), "Sync line");

            match line {
                StreamingSyncLine::Checkpoint(checkpoint) => {
                    let existing = self.storage.bucket_states().await?;
                    let removed =
                        checkpoint.removed_buckets(existing.iter().map(|b| b.name.as_str()));
                    self.begin_checkpoint(&checkpoint, &removed).await?;
                    target = Some(checkpoint);
                }

                StreamingSyncLine::CheckpointDiff(diff) => {
                    let Some(current) = target.as_ref() else {
                        return Err(SyncError::Protocol(
                            "checkpoint_diff received before any checkpoint".into(),
                        ));
                    };
                    let next = current.apply_diff(&diff);
                    self.begin_checkpoint(&next, &diff.removed_buckets).await?;
                    target = Some(next);
                }

                StreamingSyncLine::Data(batch) => {
                    let saved = self.storage.save_sync_data(&batch).await? as u64;
                    self.status.update(|s| s.data_flow.downloaded_operations += saved);
                }

                StreamingSyncLine::CheckpointComplete { .. } => {
                    let Some(checkpoint) = target.as_ref() else {
                        warn!("checkpoint_complete without a checkpoint, ignoring");
                        continue;
                    };
                    if self.complete_checkpoint(checkpoint).await? {
                        return Ok(StreamEnd::Resync);
                    }
                }

                StreamingSyncLine::TokenExpiresIn(secs) => {
                    if secs <= 0 {
                        self.remote.credentials().invalidate().await;
                        return Ok(StreamEnd::TokenExpired);
                    }
                    if secs < REFRESH_MARGIN_SECS {
                        debug!(secs, "Token expiring soon, prefetching");
                        self.remote.credentials().prefetch();
                    }
                }

                StreamingSyncLine::Keepalive {} => {}
            }
        }
    }

    async fn begin_checkpoint(&self, checkpoint: &Checkpoint, removed: &[String]) -> SyncResult<()> {
        if !removed.is_empty() {
            info!(buckets = ?removed, "Removing buckets no longer in checkpoint");
            self.storage.remove_buckets(removed).await?;
        }
        self.storage.set_target_checkpoint(checkpoint).await?;

        let progress = self.storage.bucket_progress().await?;
        self.status.update(|s| {
            s.data_flow.downloading = true;
            s.set_buckets(progress);
        });
        Ok(())
    }

    /// Applies the checkpoint. Returns true when buckets must be redownloaded.
    async fn complete_checkpoint(&self, checkpoint: &Checkpoint) -> SyncResult<bool> {
        match self.storage.sync_local(checkpoint).await? {
            SyncLocalOutcome::Applied { tables } => {
                let last_synced_at = self.storage.last_synced_at().await?;
                let progress = self.storage.bucket_progress().await?;
                self.status.update(|s| {
                    s.has_synced = true;
                    s.last_synced_at = last_synced_at;
                    s.data_flow.downloading = false;
                    s.last_error = None;
                    s.set_buckets(progress);
                });
                if !tables.is_empty() {
                    self.status.tables_updated(&tables);
                }
                Ok(false)
            }
            SyncLocalOutcome::PendingUploads => {
                debug!("Checkpoint waits for local uploads");
                Ok(false)
            }
            SyncLocalOutcome::ChecksumFailed { failures } => {
                let buckets: Vec<String> = failures.into_iter().map(|f| f.bucket).collect();
                self.storage.remove_buckets(&buckets).await?;
                let err = SyncError::ChecksumMismatch { buckets };
                warn!(error = %err, "Redownloading buckets");
                self.status.error(&err.to_string(), true);
                Ok(true)
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.settings.initial_backoff(),
            max_interval: self.settings.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
