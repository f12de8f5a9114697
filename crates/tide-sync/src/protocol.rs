//! # Sync Protocol
//!
//! The request sent when opening a stream and the lines received on it.
//! Both transports carry the same JSON documents; only the framing differs.
//!
//! ## Line Types
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  {"checkpoint": {last_op_id, write_checkpoint?, buckets: [...]}}        │
//! │  {"checkpoint_diff": {updated_buckets, removed_buckets, ...}}           │
//! │  {"data": {bucket, data: [op, ...], has_more?, after?, next_after?}}    │
//! │  {"checkpoint_complete": {last_op_id?}}                                 │
//! │  {"token_expires_in": 42}               doubles as a keepalive          │
//! │  {"keepalive": {}}                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A single top-level key selects the line type. Unknown keys are logged and
//! skipped so newer servers can add line types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tide_core::{BucketRequest, Checkpoint, CheckpointDiff, OpId, SyncDataBatch};
use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Body of the stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSyncRequest {
    /// Resume cursor of every bucket held locally.
    pub buckets: Vec<BucketRequest>,
    pub include_checksum: bool,
    /// Ask for op data as JSON text rather than nested objects.
    pub raw_data: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub client_id: String,
}

impl StreamingSyncRequest {
    pub fn new(
        buckets: Vec<BucketRequest>,
        parameters: BTreeMap<String, Value>,
        client_id: impl Into<String>,
    ) -> Self {
        StreamingSyncRequest {
            buckets,
            include_checksum: true,
            raw_data: true,
            parameters,
            client_id: client_id.into(),
        }
    }
}

/// One line of the sync stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingSyncLine {
    Checkpoint(Checkpoint),
    CheckpointDiff(CheckpointDiff),
    Data(SyncDataBatch),
    CheckpointComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_op_id: Option<OpId>,
    },
    /// Seconds until the current token expires.
    TokenExpiresIn(i64),
    Keepalive {},
}

impl StreamingSyncLine {
    /// Decodes one line. `Ok(None)` for blank lines and unknown line types.
    pub fn parse(text: &str) -> SyncResult<Option<Self>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> SyncResult<Option<Self>> {
        let key = match &value {
            Value::Object(map) if map.len() == 1 => map.keys().next().cloned().unwrap_or_default(),
            _ => {
                return Err(SyncError::Protocol(format!(
                    "sync line must be an object with one key: {}",
                    value
                )))
            }
        };

        match key.as_str() {
            "checkpoint" | "checkpoint_diff" | "data" | "checkpoint_complete"
            | "token_expires_in" | "keepalive" => Ok(Some(serde_json::from_value(value)?)),
            other => {
                warn!(line_type = %other, "Skipping unknown sync line");
                Ok(None)
            }
        }
    }

    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamingSyncLine::Checkpoint(_) => "checkpoint",
            StreamingSyncLine::CheckpointDiff(_) => "checkpoint_diff",
            StreamingSyncLine::Data(_) => "data",
            StreamingSyncLine::CheckpointComplete { .. } => "checkpoint_complete",
            StreamingSyncLine::TokenExpiresIn(_) => "token_expires_in",
            StreamingSyncLine::Keepalive {} => "keepalive",
        }
    }
}

/// Response of the write checkpoint endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WriteCheckpointResponse {
    pub data: WriteCheckpointData,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WriteCheckpointData {
    pub write_checkpoint: OpId,
}
