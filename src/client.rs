//! Client side of the sync call

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::fs_enum::{index, Inventory};
use crate::legacy::LegacyAdapter;
use crate::logger::Logger;
use crate::pool::ResourcePool;
use crate::protocol::{metadata, timeouts::CONNECT_MS};
use crate::sink::{Sink, SinkStats};
use crate::wire::{recv_frame, send_frame, CallMetadata, EndSummary, Frame, SyncRequest};

/// Outcome of one successful sync
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub local: SinkStats,
    pub server: EndSummary,
    pub elapsed: Duration,
}

pub async fn connect(addr: &str) -> SyncResult<TcpStream> {
    let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
        Ok(res) => res.at_path(addr)?,
        Err(_) => {
            return Err(SyncError::io(
                addr,
                std::io::Error::new(std::io::ErrorKind::TimedOut, format!("connect timeout ({} ms)", CONNECT_MS)),
            ))
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(server = %addr, error = %e, "set_nodelay failed");
    }
    Ok(stream)
}

/// Make `config.root` identical to the server's copy for `config.client_id`
pub async fn sync_tree(config: &ClientConfig, logger: Arc<dyn Logger>) -> SyncResult<SyncReport> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.root).await.at_path(&config.root)?;
    let pool = ResourcePool::new(config.pool_size);
    let inventory = index(&config.root, &pool).await?;
    tracing::info!(root = %config.root.display(), files = inventory.len(), "local inventory built");

    let mut md = CallMetadata::new();
    md.set(metadata::CLIENT_ID, config.client_id.as_str());
    if let Some(token) = &config.auth_token {
        md.set(metadata::AUTH_TOKEN, token.as_str());
    }

    let stream = connect(&config.server).await?;
    let (mut rd, mut wr) = stream.into_split();
    logger.start(&config.root, &config.client_id);
    sync_over(&mut rd, &mut wr, &config.root, md, inventory, pool, logger).await
}

/// Run one session over an already-open stream pair
pub async fn sync_over<R, W>(
    rd: &mut R,
    wr: &mut W,
    root: &Path,
    md: CallMetadata,
    inventory: Inventory,
    pool: ResourcePool,
    logger: Arc<dyn Logger>,
) -> SyncResult<SyncReport>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let request = SyncRequest {
        metadata: md,
        info: inventory.to_wire(),
    };
    send_frame(wr, &Frame::Request(request)).await?;

    let sink = Sink::new(root, pool, inventory.paths().map(str::to_string)).with_logger(Arc::clone(&logger));
    let server = match receive(rd, &sink).await {
        Ok(summary) => summary,
        Err(e) => {
            let err = sink.abort().await.unwrap_or(e);
            logger.error("sync", &err.to_string());
            return Err(err);
        }
    };
    let local = match sink.finish().await {
        Ok(stats) => stats,
        Err(e) => {
            logger.error("finish", &e.to_string());
            return Err(e);
        }
    };

    let elapsed = started.elapsed();
    logger.done(local.written, local.bytes_written, elapsed.as_secs_f64());
    tracing::info!(
        kept = local.kept,
        deleted = local.deleted,
        written = local.written,
        bytes = local.bytes_written,
        stale = local.stale_removed,
        elapsed_ms = elapsed.as_millis() as u64,
        "sync complete"
    );
    Ok(SyncReport { local, server, elapsed })
}

// Feed the response stream into the sink until END
async fn receive<R>(rd: &mut R, sink: &Sink) -> SyncResult<EndSummary>
where
    R: AsyncRead + Unpin,
{
    let mut legacy: Option<LegacyAdapter> = None;
    let mut canonical = false;
    loop {
        match recv_frame(rd).await? {
            Some(Frame::Response(msg)) => {
                if legacy.is_some() {
                    return Err(SyncError::protocol("tagged response inside a legacy stream"));
                }
                canonical = true;
                sink.apply(msg).await?;
            }
            Some(Frame::Legacy(msg)) => {
                if canonical {
                    return Err(SyncError::protocol("legacy response inside a tagged stream"));
                }
                let adapter = legacy.get_or_insert_with(LegacyAdapter::new);
                sink.apply(adapter.translate(msg)?).await?;
            }
            Some(Frame::End(summary)) => {
                if let Some(adapter) = legacy.take() {
                    for msg in adapter.finish() {
                        sink.apply(msg).await?;
                    }
                }
                return Ok(summary);
            }
            Some(Frame::Error(status)) => {
                return Err(SyncError::Remote {
                    code: status.code,
                    message: status.message,
                })
            }
            Some(Frame::Request(_)) => return Err(SyncError::protocol("server sent a REQUEST frame")),
            None => {
                return Err(SyncError::io(
                    "<stream>",
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream ended without END"),
                ))
            }
        }
    }
}
