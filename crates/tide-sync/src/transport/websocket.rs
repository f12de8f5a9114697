//! # WebSocket Transport
//!
//! Opens the stream over a WebSocket and regulates the server with credit
//! frames.
//!
//! ## Frames
//! ```text
//! client → {"request": {buckets, ...}, "request_n": 10}    first frame
//! server → {"checkpoint": {...}}                            one line per text frame
//! server → {"data": {...}}
//! client → {"request_n": 5}                                 on low water
//! ```
//!
//! Lines of unknown type use up credit without reaching the reader, so the
//! pump tops up for them itself.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{LineStream, StreamTarget, StreamTransport};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{StreamingSyncLine, StreamingSyncRequest};
use crate::stream::{CreditWindow, DataStream, DataStreamEvent, DataStreamOptions};

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    credit_batch: usize,
    credit_low_water: usize,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration, credit_batch: usize, credit_low_water: usize) -> Self {
        WebSocketTransport {
            connect_timeout,
            credit_batch,
            credit_low_water,
        }
    }
}

/// `http(s)` endpoints are dialled as `ws(s)`.
pub(crate) fn websocket_url(url: &Url) -> SyncResult<Url> {
    let mut url = url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SyncError::InvalidUrl(format!("Unsupported scheme: {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(url.to_string()))?;
    Ok(url)
}

/// Sends a `request_n` frame if the window is at low water.
async fn grant_credit<S>(write: &mut S, window: &mut CreditWindow) -> SyncResult<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    if let Some(n) = window.on_low_water() {
        let frame = json!({ "request_n": n }).to_string();
        write.send(WsMessage::Text(frame.into())).await?;
        debug!(credit = n, "Granted stream credit");
    }
    Ok(())
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn open(
        &self,
        target: StreamTarget,
        request: &StreamingSyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<LineStream> {
        let url = websocket_url(&target.url)?;
        let mut ws_request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&target.authorization())
            .map_err(|e| SyncError::Authentication(format!("Invalid token: {}", e)))?;
        ws_request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, response) = match timeout(self.connect_timeout, connect_async(ws_request)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(self.connect_timeout.as_secs())),
        };
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let (mut write, mut read) = ws_stream.split();

        let mut window = CreditWindow::new(self.credit_batch, self.credit_low_water);
        let first = json!({ "request": request, "request_n": window.initial() });
        write.send(WsMessage::Text(first.to_string().into())).await?;
        info!(url = %url, buckets = request.buckets.len(), "Sync stream opened (websocket)");

        let stream: LineStream = DataStream::new(DataStreamOptions {
            low_water: self.credit_low_water,
            high_water: self.credit_batch,
        });
        let mut events = stream.subscribe();
        let producer = stream.clone();

        let low_water = self.credit_low_water;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("WebSocket stream cancelled");
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }

                    event = events.recv() => match event {
                        Some(DataStreamEvent::LowWater) => {
                            if let Err(e) = grant_credit(&mut write, &mut window).await {
                                producer.enqueue(Err(e));
                                break;
                            }
                        }
                        Some(DataStreamEvent::Closed) | None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },

                    frame = read.next() => {
                        let parsed = match frame {
                            Some(Ok(WsMessage::Text(text))) => StreamingSyncLine::parse(text.as_str()),
                            Some(Ok(WsMessage::Binary(data))) => std::str::from_utf8(&data)
                                .map_err(|e| SyncError::Protocol(e.to_string()))
                                .and_then(StreamingSyncLine::parse),
                            Some(Ok(WsMessage::Ping(data))) => {
                                let _ = write.send(WsMessage::Pong(data)).await;
                                continue;
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                info!(?frame, "Server closed sync stream");
                                producer.enqueue(Err(SyncError::Disconnected));
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!(error = %e, "WebSocket error");
                                producer.enqueue(Err(SyncError::from(e)));
                                break;
                            }
                            None => {
                                producer.enqueue(Err(SyncError::Disconnected));
                                break;
                            }
                        };

                        window.on_item();
                        match parsed {
                            Ok(Some(line)) => {
                                producer.enqueue(Ok(line));
                            }
                            // Skipped lines never reach a reader, so no read reports low water for them.
                            Ok(None) if producer.len() <= low_water => {
                                if let Err(e) = grant_credit(&mut write, &mut window).await {
                                    producer.enqueue(Err(e));
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                producer.enqueue(Err(e));
                                break;
                            }
                        }
                    }
                }
            }
            producer.close();
        });

        Ok(stream)
    }
}
