//! # tide-cli
//!
//! Opens a database, connects it with a static token and logs every status
//! change until Ctrl-C.
//!
//! ```text
//! TIDE_ENDPOINT ─┐
//! TIDE_TOKEN ────┼─► StaticTokenConnector ─► SyncClient::connect
//! --config ──────┘        SyncConfig::load
//! ```

use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tide_db::{CrudQueue, Database, DbConfig};
use tide_sync::{
    BackendConnector, ConnectorError, Credentials, SyncClient, SyncConfig, UploadError,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sync a local database and log progress.
#[derive(Parser)]
#[command(name = "tide-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a tide.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file to sync
    db_path: PathBuf,
}

/// Credentials from the environment. Queued local writes are logged and dropped.
struct StaticTokenConnector {
    endpoint: String,
    token: String,
}

impl StaticTokenConnector {
    fn from_env() -> Result<Self, String> {
        let endpoint = std::env::var("TIDE_ENDPOINT").map_err(|_| "TIDE_ENDPOINT is not set")?;
        let token = std::env::var("TIDE_TOKEN").map_err(|_| "TIDE_TOKEN is not set")?;
        Ok(StaticTokenConnector { endpoint, token })
    }
}

#[async_trait]
impl BackendConnector for StaticTokenConnector {
    async fn fetch_credentials(&self) -> Result<Option<Credentials>, ConnectorError> {
        Ok(Some(Credentials::new(&self.endpoint, &self.token)))
    }

    async fn upload_data(&self, queue: &CrudQueue) -> Result<(), UploadError> {
        let transaction = queue
            .next_crud_transaction()
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))?;
        let Some(transaction) = transaction else {
            return Ok(());
        };
        warn!(
            transaction_id = ?transaction.transaction_id,
            entries = transaction.crud.len(),
            "Discarding local writes"
        );
        queue
            .mark_uploaded(&transaction, None)
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let connector = Arc::new(StaticTokenConnector::from_env()?);
    let config = SyncConfig::load(cli.config)?;

    let db = Database::open(DbConfig::new(&cli.db_path)).await?;
    info!(path = %cli.db_path.display(), "Database opened");

    let client = SyncClient::new(db, config).await?;
    let mut status = client.subscribe_status();
    client.connect(connector).await?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = status.borrow_and_update().clone();
                info!(
                    state = %s.state,
                    has_synced = s.has_synced,
                    last_synced_at = ?s.last_synced_at,
                    downloaded = s.data_flow.downloaded_operations,
                    uploaded = s.data_flow.uploaded_transactions,
                    queue = s.upload_queue_depth,
                    buckets = s.buckets.len(),
                    error = ?s.last_error,
                    "Sync status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    client.disconnect().await;
    client.database().close().await;
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tide=trace` - Show trace for tide crates only
/// - Default: INFO, with debug for tide crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tide=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
