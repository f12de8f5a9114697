//! # Remote
//!
//! Every request to the sync service goes through here, so credentials are
//! resolved and refreshed in one place.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tide_core::OpId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::StreamSettings;
use crate::credentials::{Credentials, CredentialsCache};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{StreamingSyncRequest, WriteCheckpointResponse};
use crate::transport::http::error_for_response;
use crate::transport::{LineStream, StreamTarget, StreamTransport};

#[derive(Clone)]
pub struct Remote {
    credentials: CredentialsCache,
    transport: Arc<dyn StreamTransport>,
    http: reqwest::Client,
    settings: StreamSettings,
}

fn endpoint_url(creds: &Credentials, path: &str) -> SyncResult<Url> {
    let base = creds.endpoint.trim_end_matches('/');
    Ok(Url::parse(&format!("{}{}", base, path))?)
}

impl Remote {
    pub fn new(
        credentials: CredentialsCache,
        transport: Arc<dyn StreamTransport>,
        settings: StreamSettings,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.connect_timeout() * 3)
            .build()?;
        Ok(Remote {
            credentials,
            transport,
            http,
            settings,
        })
    }

    pub fn credentials(&self) -> &CredentialsCache {
        &self.credentials
    }

    /// GET `path` (which may carry a query string) and decode the JSON body.
    ///
    /// Cancelling drops the request, which closes its connection, and
    /// returns `ShuttingDown`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<T> {
        tokio::select! {
            result = self.get_json(path) => result,
            _ = cancel.cancelled() => {
                debug!(path, "GET cancelled");
                Err(SyncError::ShuttingDown)
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let creds = self.credentials.require().await?;
        let url = endpoint_url(&creds, path)?;
        debug!(%url, "GET");

        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Token {}", creds.token))
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let err = error_for_response(response).await;
            if err.is_auth_error() {
                self.credentials.invalidate().await;
            }
            return Err(err);
        }
        Ok(response.json().await?)
    }

    /// Highest write the service has recorded for this client.
    pub async fn write_checkpoint(
        &self,
        client_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<OpId> {
        let path = format!(
            "{}?client_id={}",
            self.settings.write_checkpoint_path,
            url::form_urlencoded::byte_serialize(client_id.as_bytes()).collect::<String>()
        );
        let response: WriteCheckpointResponse = self.fetch_json(&path, cancel).await?;
        Ok(response.data.write_checkpoint)
    }

    /// Opens the sync stream with fresh credentials.
    pub async fn open_stream(
        &self,
        request: &StreamingSyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<LineStream> {
        let creds = self.credentials.require().await?;
        let target = StreamTarget {
            url: endpoint_url(&creds, &self.settings.stream_path)?,
            token: creds.token,
        };

        match self.transport.open(target, request, cancel).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                if e.is_auth_error() {
                    warn!("Stream rejected credentials, invalidating");
                    self.credentials.invalidate().await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{BackendConnector, ConnectorError, UploadError};
    use crate::streaming::tests::{fast_settings, ScriptedTransport};
    use async_trait::async_trait;
    use std::time::Duration;
    use tide_db::CrudQueue;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Endpoint(String);

    #[async_trait]
    impl BackendConnector for Endpoint {
        async fn fetch_credentials(&self) -> Result<Option<Credentials>, ConnectorError> {
            Ok(Some(Credentials::new(&self.0, "token")))
        }

        async fn upload_data(&self, _queue: &CrudQueue) -> Result<(), UploadError> {
            Ok(())
        }
    }

    /// Accepts connections and never answers. Reports when a peer hangs up.
    async fn silent_server() -> (String, tokio::sync::mpsc::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                    let _ = closed_tx.send(()).await;
                });
            }
        });
        (format!("http://{}", addr), closed_rx)
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_fetch() {
        let (endpoint, mut closed) = silent_server().await;
        let remote = Remote::new(
            CredentialsCache::new(Arc::new(Endpoint(endpoint))),
            Arc::new(ScriptedTransport::default()),
            fast_settings(),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let fetch = {
            let remote = remote.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { remote.write_checkpoint("client-1", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fetch.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), fetch)
            .await
            .expect("fetch returned after cancel")
            .unwrap();
        assert!(matches!(result, Err(SyncError::ShuttingDown)));
        // The request's connection is closed, not left idle.
        tokio::time::timeout(Duration::from_secs(2), closed.recv())
            .await
            .expect("server saw the connection close");
    }

    #[test]
    fn test_endpoint_url() {
        let creds = Credentials::new("https://sync.example.com/", "t");
        assert_eq!(
            endpoint_url(&creds, "/sync/stream").unwrap().as_str(),
            "https://sync.example.com/sync/stream"
        );
        let creds = Credentials::new("https://example.com/api", "t");
        assert_eq!(
            endpoint_url(&creds, "/write-checkpoint2.json?client_id=a").unwrap().as_str(),
            "https://example.com/api/write-checkpoint2.json?client_id=a"
        );
        assert!(endpoint_url(&Credentials::new("not a url", "t"), "/x").is_err());
    }
}
