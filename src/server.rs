//! Daemon side of the sync call.
//!
//! One connection carries one session. The session reads the request,
//! picks the storage root named by `clientId`, plans against the server's
//! inventory and streams the plan. Transfers run as one task per path,
//! each holding a pool lease while its source file is open; all outbound
//! messages funnel through a single writer task that owns the socket. The
//! first failing task aborts the rest and the call ends with ERROR instead
//! of END.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

use crate::config::ServerConfig;
use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::fs_enum::{index_or_empty, list_subdirs, Inventory};
use crate::planner::{plan, Plan, PlannedAction};
use crate::pool::ResourcePool;
use crate::protocol::timeouts::REQUEST_MS;
use crate::protocol_core::validate_client_id;
use crate::wire::{
    recv_frame, send_frame, EndSummary, Frame, LegacyResponse, Status, SyncRequest, SyncResponse,
};

// Outbound frames buffered between producers and the socket writer
const OUTBOUND_QUEUE: usize = 64;

/// Inventories computed ahead of time, one per client root.
/// An entry is handed out once and then recomputed, so a cached inventory
/// never serves more than one sync cycle.
#[derive(Default)]
pub struct InventoryCache {
    entries: Mutex<HashMap<String, Inventory>>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self, client_id: &str) -> Option<Inventory> {
        self.entries.lock().remove(client_id)
    }

    pub fn put(&self, client_id: &str, inv: Inventory) {
        self.entries.lock().insert(client_id.to_string(), inv);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ServerState {
    pub config: ServerConfig,
    pub pool: ResourcePool,
    pub cache: InventoryCache,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let pool = ResourcePool::new(config.pool_size);
        Self {
            config,
            pool,
            cache: InventoryCache::new(),
        }
    }

    fn client_root(&self, client_id: &str) -> PathBuf {
        self.config.storage_root.join(client_id)
    }

    /// Index every client root under the storage root concurrently
    pub async fn precompute(&self) -> SyncResult<usize> {
        let ids = list_subdirs(&self.config.storage_root).await?;
        let mut tasks = JoinSet::new();
        for id in ids {
            let root = self.client_root(&id);
            let pool = self.pool.clone();
            tasks.spawn(async move { index_or_empty(&root, &pool).await.map(|inv| (id, inv)) });
        }
        let mut count = 0;
        while let Some(joined) = tasks.join_next().await {
            let (id, inv) = joined.map_err(|_| SyncError::Cancelled)??;
            tracing::info!(client = %id, files = inv.len(), "precomputed inventory");
            self.cache.put(&id, inv);
            count += 1;
        }
        Ok(count)
    }

    async fn inventory_for(&self, client_id: &str) -> SyncResult<Inventory> {
        if let Some(inv) = self.cache.take(client_id) {
            tracing::debug!(client = %client_id, "serving cached inventory");
            return Ok(inv);
        }
        index_or_empty(&self.client_root(client_id), &self.pool).await
    }

    fn schedule_refresh(self: &Arc<Self>, client_id: &str) {
        if !self.config.precompute {
            return;
        }
        let state = Arc::clone(self);
        let id = client_id.to_string();
        tokio::spawn(async move {
            match index_or_empty(&state.client_root(&id), &state.pool).await {
                Ok(inv) => state.cache.put(&id, inv),
                Err(e) => tracing::warn!(client = %id, error = %e, "inventory refresh failed"),
            }
        });
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind the listener and, if configured, warm the inventory cache
    pub async fn bind(config: ServerConfig) -> SyncResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|e| SyncError::Config(format!("bind {}: {}", config.bind, e)))?;
        let state = Arc::new(ServerState::new(config));
        if state.config.precompute {
            let n = state.precompute().await?;
            tracing::info!(roots = n, "inventory cache warmed");
        }
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        self.listener.local_addr().at_path("<listener>")
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept connections forever, one task per session
    pub async fn run(self) -> SyncResult<()> {
        tracing::info!(
            bind = %self.state.config.bind,
            storage = %self.state.config.storage_root.display(),
            pool = self.state.pool.limit(),
            "hashsync daemon listening"
        );
        loop {
            let (stream, peer) = self.listener.accept().await.at_path("<listener>")?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    tracing::warn!(peer = %peer, error = %e, "session failed");
                }
            });
        }
    }
}

pub async fn serve(config: ServerConfig) -> SyncResult<()> {
    Server::bind(config).await?.run().await
}

async fn read_request(rd: &mut OwnedReadHalf) -> SyncResult<SyncRequest> {
    match timeout(Duration::from_millis(REQUEST_MS), recv_frame(rd)).await {
        Ok(Ok(Some(Frame::Request(req)))) => Ok(req),
        Ok(Ok(Some(other))) => Err(SyncError::protocol(format!(
            "expected REQUEST, got frame type {}",
            other.frame_type()
        ))),
        Ok(Ok(None)) => Err(SyncError::protocol("connection closed before REQUEST")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SyncError::protocol(format!("no REQUEST within {} ms", REQUEST_MS))),
    }
}

async fn send_status(wr: &mut OwnedWriteHalf, err: &SyncError) {
    let status = Status {
        code: err.status_code(),
        message: err.to_string(),
    };
    if let Err(e) = send_frame(wr, &Frame::Error(status)).await {
        tracing::debug!(error = %e, "could not deliver error status");
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) -> SyncResult<OwnedWriteHalf> {
    while let Some(f) = rx.recv().await {
        send_frame(&mut wr, &f).await?;
    }
    Ok(wr)
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> SyncResult<()> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let (mut rd, mut wr) = stream.into_split();

    let opened = async {
        let request = read_request(&mut rd).await?;
        ServerSession::open(request, &state).await
    }
    .await;
    let session = match opened {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting call");
            send_status(&mut wr, &e).await;
            let _ = wr.shutdown().await;
            return Err(e);
        }
    };
    let client_id = session.client_id.clone();

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(wr, rx));
    let produced = session.stream(tx, &state.pool, &state.config).await;
    let mut wr = writer.await.map_err(|_| SyncError::Cancelled)??;

    state.schedule_refresh(&client_id);
    match produced {
        Ok(summary) => {
            send_frame(&mut wr, &Frame::End(summary)).await?;
            let _ = wr.shutdown().await;
            Ok(())
        }
        Err(e) => {
            tracing::warn!(client = %client_id, error = %e, "aborting response stream");
            send_status(&mut wr, &e).await;
            let _ = wr.shutdown().await;
            Err(e)
        }
    }
}

/// Per-call state: created when the request is accepted, dropped when the
/// response stream ends. Aborting the stream aborts every transfer task.
pub struct ServerSession {
    id: uuid::Uuid,
    client_id: String,
    root: PathBuf,
    plan: Plan,
    started: Instant,
}

impl ServerSession {
    pub async fn open(request: SyncRequest, state: &ServerState) -> SyncResult<Self> {
        let client_id = validate_client_id(request.metadata.client_id())?.to_string();
        let client_inv = Inventory::from_wire(&request.info)?;
        let id = uuid::Uuid::new_v4();
        tracing::info!(
            session = %id,
            client = %client_id,
            auth_token = request.metadata.auth_token().is_some(),
            reported = client_inv.len(),
            "sync request"
        );

        let server_inv = state.inventory_for(&client_id).await?;
        let plan = plan(&client_inv, &server_inv);
        tracing::debug!(
            session = %id,
            keep = plan.count(PlannedAction::Keep),
            transfer = plan.count(PlannedAction::Transfer),
            delete = plan.count(PlannedAction::Delete),
            noop = plan.is_noop(),
            "planned"
        );
        Ok(Self {
            id,
            root: state.client_root(&client_id),
            client_id,
            plan,
            started: Instant::now(),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Push the plan into `tx`. Returns once every message is queued, or on
    /// the first failure with all outstanding transfers aborted.
    pub async fn stream(
        self,
        tx: mpsc::Sender<Frame>,
        pool: &ResourcePool,
        config: &ServerConfig,
    ) -> SyncResult<EndSummary> {
        let legacy = config.legacy_framing;
        let mut summary = EndSummary::default();
        let mut tasks = JoinSet::new();

        for (path, action) in &self.plan.entries {
            match action {
                PlannedAction::Delete => {
                    summary.deleted += 1;
                    if let Some(f) = outbound(SyncResponse::delete(path.as_str()), legacy) {
                        tx.send(f).await.map_err(|_| SyncError::Cancelled)?;
                    }
                }
                PlannedAction::Keep => {
                    summary.kept += 1;
                    if let Some(f) = outbound(SyncResponse::keep(path.as_str()), legacy) {
                        tx.send(f).await.map_err(|_| SyncError::Cancelled)?;
                    }
                }
                PlannedAction::Transfer => {
                    tasks.spawn(send_file(
                        path.clone(),
                        self.root.join(path),
                        pool.clone(),
                        tx.clone(),
                        config.chunk_size,
                        legacy,
                    ));
                }
            }
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(bytes)) => {
                    summary.transferred += 1;
                    summary.bytes += bytes;
                }
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(_) => {
                    tasks.abort_all();
                    return Err(SyncError::Cancelled);
                }
            }
        }

        tracing::info!(
            session = %self.id,
            client = %self.client_id,
            kept = summary.kept,
            deleted = summary.deleted,
            transferred = summary.transferred,
            bytes = summary.bytes,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "response complete"
        );
        Ok(summary)
    }
}

/// Canonical message in the framing this server speaks. The legacy shape
/// has no DELETE or COMPLETE; those are dropped.
fn outbound(msg: SyncResponse, legacy: bool) -> Option<Frame> {
    use crate::wire::Action;

    if !legacy {
        return Some(Frame::Response(msg));
    }
    match msg.action {
        Action::Keep | Action::Transfer => Some(Frame::Legacy(LegacyResponse {
            path: msg.path,
            data: msg.data,
        })),
        Action::Delete | Action::Complete => None,
    }
}

async fn send_file(
    rel: String,
    path: PathBuf,
    pool: ResourcePool,
    tx: mpsc::Sender<Frame>,
    chunk_size: usize,
    legacy: bool,
) -> SyncResult<u64> {
    let lease = pool.acquire().await?;
    let total = stream_chunks(&rel, &path, &tx, chunk_size, legacy).await?;
    pool.release(lease);
    if let Some(f) = outbound(SyncResponse::complete(rel.as_str()), legacy) {
        tx.send(f).await.map_err(|_| SyncError::Cancelled)?;
    }
    Ok(total)
}

async fn stream_chunks(
    rel: &str,
    path: &Path,
    tx: &mpsc::Sender<Frame>,
    chunk_size: usize,
    legacy: bool,
) -> SyncResult<u64> {
    let mut file = tokio::fs::File::open(path).await.at_path(path)?;
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await.at_path(path)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if let Some(f) = outbound(SyncResponse::chunk(rel, buf[..n].to_vec()), legacy) {
            tx.send(f).await.map_err(|_| SyncError::Cancelled)?;
        }
    }
    Ok(total)
}
