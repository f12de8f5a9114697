//! # HTTP Streaming Transport
//!
//! POSTs the request and reads newline-delimited JSON from the chunked body.
//! There is no credit channel: the pump stops polling the body once the
//! queue reaches high water, which stalls the socket through TCP flow
//! control, and resumes at low water.
//!
//! The body reader and the queue are decoupled, so the pump owns the reader
//! and drops it on cancel or close. That aborts the connection.

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LineStream, StreamTarget, StreamTransport};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{StreamingSyncLine, StreamingSyncRequest};
use crate::stream::{DataStream, DataStreamEvent, DataStreamOptions};

#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
    options: DataStreamOptions,
}

impl HttpStreamTransport {
    pub fn new(connect_timeout: Duration, high_water: usize, low_water: usize) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(HttpStreamTransport {
            client,
            connect_timeout,
            options: DataStreamOptions {
                low_water,
                high_water,
            },
        })
    }
}

/// Maps a non-success response to an error, keeping the body for context.
pub(crate) async fn error_for_response(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        SyncError::Authentication(format!("HTTP 401: {}", message))
    } else {
        SyncError::Http {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(
        &self,
        target: StreamTarget,
        request: &StreamingSyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<LineStream> {
        let send = self
            .client
            .post(target.url.clone())
            .header(AUTHORIZATION, target.authorization())
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::ShuttingDown),
            result = tokio::time::timeout(self.connect_timeout, send) => match result {
                Ok(response) => response?,
                Err(_) => return Err(SyncError::Timeout(self.connect_timeout.as_secs())),
            },
        };

        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        info!(url = %target.url, buckets = request.buckets.len(), "Sync stream opened (http)");

        let body = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        let stream: LineStream = DataStream::new(self.options);
        let mut events = stream.subscribe();
        let producer = stream.clone();

        tokio::spawn(async move {
            let mut paused = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("HTTP stream cancelled");
                        break;
                    }

                    event = events.recv() => match event {
                        // Events can be stale, so re-check the queue.
                        Some(DataStreamEvent::LowWater) => paused = producer.is_full(),
                        Some(DataStreamEvent::Closed) | None => break,
                    },

                    line = lines.next(), if !paused => match line {
                        Some(Ok(text)) => match StreamingSyncLine::parse(&text) {
                            Ok(Some(line)) => {
                                producer.enqueue(Ok(line));
                                paused = producer.is_full();
                            }
                            Ok(None) => {}
                            Err(e) => {
                                producer.enqueue(Err(e));
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            warn!(error = %e, "HTTP stream read failed");
                            producer.enqueue(Err(SyncError::ConnectionFailed(e.to_string())));
                            break;
                        }
                        None => {
                            producer.enqueue(Err(SyncError::Disconnected));
                            break;
                        }
                    },
                }
            }
            // Dropping the reader aborts the request.
            drop(lines);
            producer.close();
        });

        Ok(stream)
    }
}
