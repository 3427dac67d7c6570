//! Message shapes of the sync call and their frame encoding.
//!
//! One call is one connection: the client sends a single `REQUEST` frame,
//! the server answers with `RESPONSE` (or `LEGACY_RESPONSE`) frames and
//! terminates with either `END` or `ERROR`. Payloads are bincode encoded
//! and wrapped in the frame header from `protocol_core`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{frame, metadata};
use crate::protocol_core::{read_frame, write_frame};

/// Key/value pairs sent alongside the request, like RPC call metadata
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata(BTreeMap<String, String>);

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get(metadata::CLIENT_ID)
    }

    // Carried but never checked: there is no authentication layer.
    pub fn auth_token(&self) -> Option<&str> {
        self.get(metadata::AUTH_TOKEN)
    }
}

/// One inventory entry as reported by the client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub metadata: CallMetadata,
    pub info: Vec<FileInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Keep,
    Delete,
    Transfer,
    Complete,
}

/// One per-path message of the response stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub path: String,
    pub action: Action,
    pub data: Vec<u8>,
}

impl SyncResponse {
    pub fn keep(path: impl Into<String>) -> Self {
        Self { path: path.into(), action: Action::Keep, data: Vec::new() }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self { path: path.into(), action: Action::Delete, data: Vec::new() }
    }

    pub fn chunk(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self { path: path.into(), action: Action::Transfer, data }
    }

    pub fn complete(path: impl Into<String>) -> Self {
        Self { path: path.into(), action: Action::Complete, data: Vec::new() }
    }
}

/// Older response shape without an action tag
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LegacyResponse {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    Internal,
    ProtocolViolation,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

/// Counts the server reports with a successful end of stream
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndSummary {
    pub kept: u64,
    pub deleted: u64,
    pub transferred: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(SyncRequest),
    Response(SyncResponse),
    Legacy(LegacyResponse),
    End(EndSummary),
    Error(Status),
}

fn encode_payload<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SyncError::protocol(format!("encode: {}", e)))
}

fn decode_payload<'a, T: Deserialize<'a>>(what: &str, payload: &'a [u8]) -> SyncResult<T> {
    bincode::deserialize(payload).map_err(|e| SyncError::protocol(format!("bad {}: {}", what, e)))
}

impl Frame {
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Request(_) => frame::REQUEST,
            Frame::Response(_) => frame::RESPONSE,
            Frame::Legacy(_) => frame::LEGACY_RESPONSE,
            Frame::End(_) => frame::END,
            Frame::Error(_) => frame::ERROR,
        }
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        match self {
            Frame::Request(r) => encode_payload(r),
            Frame::Response(r) => encode_payload(r),
            Frame::Legacy(r) => encode_payload(r),
            Frame::End(s) => encode_payload(s),
            Frame::Error(s) => encode_payload(s),
        }
    }

    pub fn decode(frame_type: u8, payload: &[u8]) -> SyncResult<Self> {
        match frame_type {
            frame::REQUEST => Ok(Frame::Request(decode_payload("REQUEST", payload)?)),
            frame::RESPONSE => Ok(Frame::Response(decode_payload("RESPONSE", payload)?)),
            frame::LEGACY_RESPONSE => Ok(Frame::Legacy(decode_payload("LEGACY_RESPONSE", payload)?)),
            frame::END => Ok(Frame::End(decode_payload("END", payload)?)),
            frame::ERROR => Ok(Frame::Error(decode_payload("ERROR", payload)?)),
            other => Err(SyncError::protocol(format!("unknown frame type {}", other))),
        }
    }
}

pub async fn send_frame<W>(w: &mut W, f: &Frame) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = f.encode()?;
    write_frame(w, f.frame_type(), &payload).await
}

/// Read the next frame; `None` when the peer closed cleanly between frames
pub async fn recv_frame<R>(r: &mut R) -> SyncResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(r).await? {
        Some((typ, payload)) => Frame::decode(typ, &payload).map(Some),
        None => Ok(None),
    }
}
