use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hashsync::cli::DaemonOpts;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = DaemonOpts::parse();
    let config = opts.resolve().context("invalid daemon configuration")?;

    if !config.storage_root.exists() {
        std::fs::create_dir_all(&config.storage_root).with_context(|| {
            format!("Failed to create storage root: {}", config.storage_root.display())
        })?;
    }
    if !config.storage_root.is_dir() {
        anyhow::bail!("Storage root is not a directory: {}", config.storage_root.display());
    }

    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to all interfaces; clientId is not authenticated, use trusted networks only");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(hashsync::server::serve(config))?;
    Ok(())
}
