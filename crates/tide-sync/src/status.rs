//! # Sync Status
//!
//! Everything the application can observe about sync health. Background
//! failures never reach the caller as errors; they land here.
//!
//! ```text
//!   streaming task ─┐                        ┌─► watch::Receiver<SyncStatus>
//!                   ├─► StatusHub::update ───┤
//!   upload task ────┘                        └─► SyncEventEmitter × N
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tide_core::CrudTransaction;
use tide_db::BucketProgress;
use tokio::sync::watch;

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected. Only reached through `disconnect()`.
    #[default]
    Disconnected,
    /// Opening a stream.
    Connecting,
    /// Receiving lines.
    Active,
    /// Waiting out a backoff before reconnecting.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFlow {
    /// Between a checkpoint and its completion.
    pub downloading: bool,
    pub uploading: bool,
    /// Ops received since connecting.
    pub downloaded_operations: u64,
    /// Transactions removed from the queue since connecting, discarded ones included.
    pub uploaded_transactions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub has_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub data_flow: DataFlow,
    pub buckets: BTreeMap<String, BucketProgress>,
    pub upload_queue_depth: u64,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Sets the state and the two flags derived from it.
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.connected = state == ConnectionState::Active;
        self.connecting = state == ConnectionState::Connecting;
    }

    pub fn set_buckets(&mut self, progress: Vec<BucketProgress>) {
        self.buckets = progress.into_iter().map(|p| (p.name.clone(), p)).collect();
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync events. Implement only what you need.
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, _status: &SyncStatus) {}

    /// A checkpoint changed rows in these tables.
    fn emit_tables_updated(&self, _tables: &BTreeSet<String>) {}

    /// A transaction was dropped after the backend rejected it.
    fn emit_upload_discarded(&self, _transaction: &CrudTransaction, _reason: &str) {}

    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {}

// =============================================================================
// Status Hub
// =============================================================================

/// Single owner of the current status and the emitter list. Cheap to clone.
#[derive(Clone)]
pub struct StatusHub {
    status: Arc<watch::Sender<SyncStatus>>,
    emitters: Arc<RwLock<Vec<Arc<dyn SyncEventEmitter>>>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        StatusHub {
            status: Arc::new(status),
            emitters: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn add_emitter(&self, emitter: Arc<dyn SyncEventEmitter>) {
        self.emitters.write().push(emitter);
    }

    /// Applies `f` and notifies everyone if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let changed = self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
        if changed {
            let snapshot = self.current();
            for emitter in self.emitters() {
                emitter.emit_status(&snapshot);
            }
        }
    }

    pub fn tables_updated(&self, tables: &BTreeSet<String>) {
        for emitter in self.emitters() {
            emitter.emit_tables_updated(tables);
        }
    }

    pub fn upload_discarded(&self, transaction: &CrudTransaction, reason: &str) {
        for emitter in self.emitters() {
            emitter.emit_upload_discarded(transaction, reason);
        }
    }

    /// Records the error in the status and forwards it to emitters.
    pub fn error(&self, message: &str, retryable: bool) {
        self.update(|s| s.last_error = Some(message.to_string()));
        for emitter in self.emitters() {
            emitter.emit_error(message, retryable);
        }
    }

    // Snapshot so emitters run without the lock held.
    fn emitters(&self) -> Vec<Arc<dyn SyncEventEmitter>> {
        self.emitters.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        states: Mutex<Vec<ConnectionState>>,
        errors: Mutex<Vec<String>>,
    }

    impl SyncEventEmitter for Recording {
        fn emit_status(&self, status: &SyncStatus) {
            self.states.lock().push(status.state);
        }

        fn emit_error(&self, message: &str, _retryable: bool) {
            self.errors.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Active.to_string(), "active");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }

    #[test]
    fn test_set_state_derives_flags() {
        let mut status = SyncStatus::default();
        status.set_state(ConnectionState::Connecting);
        assert!(status.connecting && !status.connected);
        status.set_state(ConnectionState::Active);
        assert!(status.connected && !status.connecting);
    }

    #[tokio::test]
    async fn test_hub_notifies_on_change_only() {
        let hub = StatusHub::new();
        let recording = Arc::new(Recording::default());
        hub.add_emitter(recording.clone());
        hub.add_emitter(Arc::new(NoOpEmitter));
        let mut rx = hub.subscribe();

        hub.update(|s| s.set_state(ConnectionState::Connecting));
        hub.update(|s| s.set_state(ConnectionState::Connecting));
        hub.update(|s| s.set_state(ConnectionState::Active));

        assert_eq!(
            *recording.states.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Active]
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, ConnectionState::Active);

        hub.error("boom", true);
        assert_eq!(hub.current().last_error.as_deref(), Some("boom"));
        assert_eq!(*recording.errors.lock(), vec!["boom".to_string()]);
    }
}
