//! # Stream Transports
//!
//! One interface, two implementations picked when the client is built.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  StreamTransport::open(target, request, cancel) → LineStream            │
//! │                                                                         │
//! │  WebSocketTransport             HttpStreamTransport                     │
//! │  ─────────────────              ───────────────────                     │
//! │  ws(s)://…/sync/stream          POST https://…/sync/stream              │
//! │  text frames, one line each     chunked body, newline-delimited JSON    │
//! │  explicit request_n credits     pauses reading at high water            │
//! │                                                                         │
//! │  Both spawn a pump task that owns the socket. The task ends, and the    │
//! │  socket is dropped, on cancel, on consumer close, or on error.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod websocket;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SyncResult;
use crate::protocol::{StreamingSyncLine, StreamingSyncRequest};
use crate::stream::DataStream;

pub use http::HttpStreamTransport;
pub use websocket::WebSocketTransport;

/// Decoded lines, or the error that ended the stream (always last).
pub type LineStream = DataStream<SyncResult<StreamingSyncLine>>;

/// Resolved address and token for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub url: Url,
    pub token: String,
}

impl StreamTarget {
    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a stream. Returns once the server accepted the request.
    ///
    /// Cancelling `cancel` or closing the returned stream tears down the
    /// connection.
    async fn open(
        &self,
        target: StreamTarget,
        request: &StreamingSyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<LineStream>;
}
