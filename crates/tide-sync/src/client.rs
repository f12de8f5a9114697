//! # Sync Client
//!
//! The context object the host application builds once per database and
//! passes around. It owns storage, the status hub and, while connected, the
//! sync task that drives streaming and uploads.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncClient                                                             │
//! │                                                                         │
//! │  connect(connector)                                                     │
//! │    ├─ Connect lock (one connect sequence per database)                  │
//! │    ├─ stop the previous sync, if any                                    │
//! │    ├─ resolve credentials         ──► errors returned to the caller     │
//! │    └─ spawn sync task                                                   │
//! │         ├─ wait for SharedStorageLock (when configured, cancellable)    │
//! │         ├─ StreamingSyncClient    ──► errors surface in SyncStatus      │
//! │         └─ CrudUploader           ──► errors surface in SyncStatus      │
//! │                                                                         │
//! │  disconnect()                                                           │
//! │    └─ cancel, join the task, which releases the storage lock            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tide_core::{CrudBatch, CrudTransaction};
use tide_db::{BucketStorage, CrudQueue, Database};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StreamSettings, SyncConfig, TransportKind};
use crate::connector::BackendConnector;
use crate::credentials::CredentialsCache;
use crate::error::{SyncError, SyncResult};
use crate::lock::{DatabaseId, LockKey, LockPurpose, LockRegistry, SharedStorageLock};
use crate::remote::Remote;
use crate::status::{ConnectionState, StatusHub, SyncEventEmitter, SyncStatus};
use crate::streaming::StreamingSyncClient;
use crate::transport::{HttpStreamTransport, StreamTransport, WebSocketTransport};
use crate::upload::CrudUploader;

struct ActiveSync {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SyncClient {
    db: Database,
    storage: BucketStorage,
    crud: CrudQueue,
    config: SyncConfig,
    database_id: DatabaseId,
    locks: LockRegistry,
    status: StatusHub,
    transport: Option<Arc<dyn StreamTransport>>,
    connect_generation: AtomicU64,
    active: Mutex<Option<ActiveSync>>,
}

impl SyncClient {
    /// Wraps an open database. Sync progress already stored is reflected
    /// in the initial status.
    pub async fn new(db: Database, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let storage = db
            .buckets()
            .with_compact_threshold(config.storage.compact_threshold);
        let crud = db.crud();

        let status = StatusHub::new();
        let has_synced = storage.has_completed_sync().await?;
        let last_synced_at = storage.last_synced_at().await?;
        let progress = storage.bucket_progress().await?;
        let depth = crud.pending_count().await?;
        status.update(|s| {
            s.has_synced = has_synced;
            s.last_synced_at = last_synced_at;
            s.upload_queue_depth = depth;
            s.set_buckets(progress);
        });

        Ok(SyncClient {
            database_id: DatabaseId::from_path(db.path()),
            db,
            storage,
            crud,
            config,
            locks: LockRegistry::new(),
            status,
            transport: None,
            connect_generation: AtomicU64::new(0),
            active: Mutex::new(None),
        })
    }

    /// Shares a lock registry with other clients in this process.
    pub fn with_lock_registry(mut self, locks: LockRegistry) -> Self {
        self.locks = locks;
        self
    }

    /// Uses `transport` instead of the one selected by configuration.
    pub fn with_transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn storage(&self) -> &BucketStorage {
        &self.storage
    }

    pub fn crud(&self) -> &CrudQueue {
        &self.crud
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn add_emitter(&self, emitter: Arc<dyn SyncEventEmitter>) {
        self.status.add_emitter(emitter);
    }

    /// Resolves once a checkpoint has been applied, now or in an earlier session.
    pub async fn wait_for_first_sync(&self) -> SyncResult<()> {
        let mut rx = self.status.subscribe();
        rx.wait_for(|s| s.has_synced)
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))?;
        Ok(())
    }

    // =========================================================================
    // Upload Queue
    // =========================================================================

    pub async fn next_crud_transaction(&self) -> SyncResult<Option<CrudTransaction>> {
        Ok(self.crud.next_crud_transaction().await?)
    }

    pub async fn crud_batch(&self, limit: usize) -> SyncResult<CrudBatch> {
        Ok(self.crud.crud_batch(limit).await?)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Starts syncing with `connector`, replacing any active sync.
    ///
    /// Returns an error only when credentials cannot be resolved or the
    /// configuration is unusable. Concurrent calls collapse: a call that
    /// is overtaken by a newer one while waiting returns `Ok` without
    /// connecting.
    pub async fn connect(&self, connector: Arc<dyn BackendConnector>) -> SyncResult<()> {
        let generation = self.connect_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self
            .locks
            .acquire(&LockKey::new(self.database_id.clone(), LockPurpose::Connect))
            .await;

        if self.connect_generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Superseded by a newer connect call");
            return Ok(());
        }

        self.stop().await;

        let credentials = CredentialsCache::new(connector.clone());
        let creds = credentials.require().await?;
        info!(endpoint = %creds.endpoint, transport = %self.config.stream.transport, "Connecting");

        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => build_transport(&self.config.stream)?,
        };
        let remote = Remote::new(credentials, transport, self.config.stream.clone())?;

        let cancel = CancellationToken::new();

        let streaming = StreamingSyncClient::new(
            self.storage.clone(),
            remote.clone(),
            self.status.clone(),
            self.config.stream.clone(),
        );
        let locks = self.locks.clone();
        let sync_key = LockKey::new(self.database_id.clone(), LockPurpose::Sync);
        let stream_cancel = cancel.clone();
        let stream = async move {
            let _sync = tokio::select! {
                guard = locks.acquire(&sync_key) => guard,
                _ = stream_cancel.cancelled() => return,
            };
            streaming.run(stream_cancel).await;
        };

        let uploader = CrudUploader::new(
            self.crud.clone(),
            self.storage.clone(),
            connector,
            remote,
            self.status.clone(),
            self.config.upload.clone(),
            self.db.crud_notifier(),
            self.locks.clone(),
            LockKey::new(self.database_id.clone(), LockPurpose::Upload),
        );
        let upload = uploader.run(cancel.clone());

        let storage_path = self
            .config
            .stream
            .shared_storage_lock
            .then(|| self.db.path().to_path_buf());
        let status = self.status.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _storage_lock = match storage_path {
                Some(path) => match SharedStorageLock::acquire(&path, &task_cancel).await {
                    Ok(lock) => Some(lock),
                    Err(SyncError::ShuttingDown) => return,
                    Err(e) => {
                        warn!(error = %e, "Shared storage lock unavailable");
                        status.error(&e.to_string(), false);
                        return;
                    }
                },
                None => None,
            };
            tokio::join!(stream, upload);
        });

        *self.active.lock().await = Some(ActiveSync { cancel, task });
        Ok(())
    }

    /// Stops syncing. Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        let _guard = self
            .locks
            .acquire(&LockKey::new(self.database_id.clone(), LockPurpose::Connect))
            .await;
        self.stop().await;
    }

    async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        info!("Disconnecting");
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!(error = %e, "Sync task ended abnormally");
        }
        self.status.update(|s| {
            s.set_state(ConnectionState::Disconnected);
            s.data_flow.downloading = false;
            s.data_flow.uploading = false;
        });
    }
}

fn build_transport(settings: &StreamSettings) -> SyncResult<Arc<dyn StreamTransport>> {
    Ok(match settings.transport {
        TransportKind::Websocket => Arc::new(WebSocketTransport::new(
            settings.connect_timeout(),
            settings.credit_batch,
            settings.credit_low_water,
        )),
        TransportKind::Http => Arc::new(HttpStreamTransport::new(
            settings.connect_timeout(),
            settings.credit_batch,
            settings.credit_low_water,
        )?),
    })
}
