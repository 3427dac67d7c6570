//! Error taxonomy shared by the server and client sessions

use std::path::{Path, PathBuf};

use crate::wire::StatusCode;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Missing call metadata or unusable configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Read, write or mkdir failure on either side. Aborts the session.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server terminated the call with an error status.
    #[error("server terminated the call ({code:?}): {message}")]
    Remote { code: StatusCode, message: String },

    /// The session was torn down while work was in flight.
    #[error("session cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }

    /// Status reported to the client when this error ends a server session
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Config(_) => StatusCode::InvalidArgument,
            SyncError::Protocol(_) => StatusCode::ProtocolViolation,
            SyncError::Remote { code, .. } => *code,
            SyncError::Io { .. } | SyncError::Cancelled => StatusCode::Internal,
        }
    }
}

/// Attach a path to `std::io::Result` values, like anyhow's `with_context`
pub trait IoResultExt<T> {
    fn at_path(self, path: impl AsRef<Path>) -> SyncResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> SyncResult<T> {
        self.map_err(|e| SyncError::io(path, e))
    }
}
