//! Server and client settings, loadable from TOML and overridable from the CLI

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::protocol::{DEFAULT_BIND, DEFAULT_POOL_SIZE, MAX_FRAME_SIZE, TRANSFER_CHUNK_SIZE};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Parent of the per-client storage roots
    pub storage_root: PathBuf,
    /// Max concurrently open source files
    pub pool_size: usize,
    /// Bytes per TRANSFER message
    pub chunk_size: usize,
    /// Index every client root at startup and serve the first request from it
    pub precompute: bool,
    /// Answer with the untagged legacy response shape
    pub legacy_framing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            storage_root: PathBuf::from("storage-server"),
            pool_size: DEFAULT_POOL_SIZE,
            chunk_size: TRANSFER_CHUNK_SIZE,
            precompute: false,
            legacy_framing: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub server: String,
    /// Selects the storage root on the server
    pub client_id: String,
    /// Sent as call metadata; the server does not check it
    pub auth_token: Option<String>,
    /// Local tree to make identical to the server's
    pub root: PathBuf,
    /// Max concurrently open files while indexing and writing
    pub pool_size: usize,
    /// Append audit lines here
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_BIND.to_string(),
            client_id: String::new(),
            auth_token: None,
            root: PathBuf::from("storage-client"),
            pool_size: DEFAULT_POOL_SIZE,
            log_file: None,
        }
    }
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> SyncResult<T> {
    let text = std::fs::read_to_string(path).at_path(path)?;
    toml::from_str(&text).map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
}

impl ServerConfig {
    pub fn from_toml_file(path: &Path) -> SyncResult<Self> {
        read_toml(path)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.pool_size == 0 {
            return Err(SyncError::Config("pool_size must be at least 1".into()));
        }
        // Leave room for the path and bincode framing inside one frame
        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_SIZE / 2 {
            return Err(SyncError::Config(format!(
                "chunk_size must be between 1 and {}",
                MAX_FRAME_SIZE / 2
            )));
        }
        if self.bind.trim().is_empty() {
            return Err(SyncError::Config("bind address is empty".into()));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn from_toml_file(path: &Path) -> SyncResult<Self> {
        read_toml(path)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.pool_size == 0 {
            return Err(SyncError::Config("pool_size must be at least 1".into()));
        }
        if self.server.trim().is_empty() {
            return Err(SyncError::Config("server address is empty".into()));
        }
        crate::protocol_core::validate_client_id(Some(&self.client_id))?;
        Ok(())
    }
}
