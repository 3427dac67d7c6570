//! hashsync - make a local directory tree identical to the server's copy
//!
//! Design goals:
//! - Only changed files cross the wire, decided by SHA-256 content digest
//! - Open file descriptors stay bounded on both sides
//! - A failed sync never leaves a half-written file in place of a good one

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use hashsync::cli::ClientOpts;
use hashsync::client::sync_tree;
use hashsync::logger::{Logger, NoopLogger, TextLogger};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = ClientOpts::parse();
    let config = opts.resolve().context("invalid client configuration")?;

    // Choose logger once; NoopLogger costs nothing in the write path
    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                tracing::warn!(error = %e, "audit log unavailable, continuing without it");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let report = rt
        .block_on(sync_tree(&config, logger))
        .with_context(|| format!("sync with {} failed", config.server))?;

    println!(
        "Synced {}: {} kept, {} deleted, {} written ({} bytes) in {:.2}s",
        config.root.display(),
        report.local.kept,
        report.local.deleted + report.local.stale_removed,
        report.local.written,
        report.local.bytes_written,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}
