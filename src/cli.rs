//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::SyncResult;

/// Daemon options used by hashsyncd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "hashsync daemon - serves per-client storage roots")]
pub struct DaemonOpts {
    /// TOML config file; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding one subdirectory per client id
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Max concurrently open source files
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Index every client root at startup
    #[arg(long)]
    pub precompute: bool,

    /// Answer with the untagged legacy response shape
    #[arg(long)]
    pub legacy_framing: bool,
}

impl DaemonOpts {
    pub fn resolve(&self) -> SyncResult<ServerConfig> {
        let mut cfg = match &self.config {
            Some(path) => ServerConfig::from_toml_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(storage) = &self.storage {
            cfg.storage_root = storage.clone();
        }
        if let Some(n) = self.pool_size {
            cfg.pool_size = n;
        }
        cfg.precompute |= self.precompute;
        cfg.legacy_framing |= self.legacy_framing;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Client options used by hashsync
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "hashsync - make a local tree identical to the server's copy")]
pub struct ClientOpts {
    /// TOML config file; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(long)]
    pub server: Option<String>,

    /// Storage root selector on the server
    #[arg(long)]
    pub client_id: Option<String>,

    /// Sent as call metadata (not checked by the server)
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Local tree to synchronize
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Max concurrently open files
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Append audit lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl ClientOpts {
    pub fn resolve(&self) -> SyncResult<ClientConfig> {
        let mut cfg = match &self.config {
            Some(path) => ClientConfig::from_toml_file(path)?,
            None => ClientConfig::default(),
        };
        if let Some(server) = &self.server {
            cfg.server = server.clone();
        }
        if let Some(id) = &self.client_id {
            cfg.client_id = id.clone();
        }
        if self.auth_token.is_some() {
            cfg.auth_token = self.auth_token.clone();
        }
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if let Some(n) = self.pool_size {
            cfg.pool_size = n;
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_flags_override_defaults() {
        let opts = ClientOpts::parse_from([
            "hashsync",
            "--client-id",
            "client-12345",
            "--root",
            "/tmp/tree",
            "--pool-size",
            "7",
        ]);
        let cfg = opts.resolve().unwrap();
        assert_eq!(cfg.client_id, "client-12345");
        assert_eq!(cfg.root, PathBuf::from("/tmp/tree"));
        assert_eq!(cfg.pool_size, 7);
        assert_eq!(cfg.auth_token, None);
    }

    #[test]
    fn test_client_without_id_is_rejected() {
        let opts = ClientOpts::parse_from(["hashsync"]);
        assert!(opts.resolve().is_err());
    }

    #[test]
    fn test_daemon_flags() {
        let opts = DaemonOpts::parse_from(["hashsyncd", "--storage", "/srv", "--precompute"]);
        let cfg = opts.resolve().unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv"));
        assert!(cfg.precompute);
        assert!(!cfg.legacy_framing);
    }
}
