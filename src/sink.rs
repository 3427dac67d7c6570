//! Client-side consumer of the action stream.
//!
//! Each path that receives data gets exactly one owner task. The owner is
//! created under the registry lock on the first TRANSFER (or COMPLETE) for
//! that path, so concurrent demand for the same path always lands on the
//! same task. Commands reach the owner through a bounded queue and are
//! applied in the order they were queued. The owner writes into a temporary
//! sibling of the destination and, on COMPLETE, renames it over the
//! destination. Dropping the task (abort) removes the temporary file
//! through `TempGuard`.
//!
//! A pool lease is held only while queued commands are being applied. An
//! owner waiting on the network for its next chunk holds no descriptor, so
//! a full queue always drains and the reader never waits on a writer that
//! is itself waiting on the reader.
//!
//! Handle lifecycle per path: absent -> pending (task spawned, waiting for
//! a lease / mkdir / open) -> open -> idle (closed, lease returned) -> open
//! ... -> closed.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::logger::{Logger, NoopLogger};
use crate::pool::ResourcePool;
use crate::protocol_core::{ensure_parent_exists, normalize_under_root};
use crate::wire::{Action, SyncResponse};

const TEMP_SUFFIX: &str = "hstmp";

// Commands buffered per path before the reader waits for the writer
const WRITE_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Kept,
    Deleted,
    Completed,
}

enum WriteCmd {
    Chunk(Vec<u8>),
    Finish,
}

struct WriterOutcome {
    rel: String,
    bytes: u64,
}

#[derive(Default)]
struct Registry {
    open: HashMap<String, mpsc::Sender<WriteCmd>>,
    settled: HashMap<String, Settled>,
}

/// What a finished session did to the destination tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub kept: u64,
    pub deleted: u64,
    pub written: u64,
    pub bytes_written: u64,
    pub stale_removed: u64,
    pub handles_opened: u64,
}

pub struct Sink {
    root: PathBuf,
    pool: ResourcePool,
    tag: String,
    pre_sync: HashSet<String>,
    registry: Mutex<Registry>,
    writers: Mutex<JoinSet<SyncResult<WriterOutcome>>>,
    handles_opened: Arc<AtomicUsize>,
    logger: Arc<dyn Logger>,
}

/// Removes a temporary write target unless it was promoted
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn temp_sibling(dest: &Path, tag: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.{}", name, tag, TEMP_SUFFIX))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Remove a regular file sitting where one of `dest`'s parent directories
/// must go. The server holds files below that name, so the file is a client
/// path the server does not have.
async fn clear_file_ancestors(root: &Path, dest: &Path) -> SyncResult<()> {
    let rel = match dest.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return Ok(()),
    };
    let mut parents: Vec<_> = rel.components().collect();
    parents.pop();

    let mut dir = root.to_path_buf();
    for component in parents {
        dir.push(component);
        match tokio::fs::symlink_metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                tracing::debug!(path = %dir.display(), "file replaced by directory");
                if let Err(e) = tokio::fs::remove_file(&dir).await {
                    // Another writer may have got here first and made the directory
                    if e.kind() != ErrorKind::NotFound && !is_dir(&dir).await {
                        return Err(SyncError::io(&dir, e));
                    }
                }
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::io(&dir, e)),
        }
    }
    Ok(())
}

/// Remove directories left empty below `root`, walking up from `path`
async fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if tokio::fs::remove_dir(d).await.is_err() {
            break;
        }
        tracing::debug!(dir = %d.display(), "removed empty directory");
        dir = d.parent();
    }
}

struct WriterJob {
    rel: String,
    root: PathBuf,
    dest: PathBuf,
    temp: PathBuf,
    pool: ResourcePool,
    opened: Arc<AtomicUsize>,
}

impl WriterJob {
    async fn create_temp(&self) -> SyncResult<File> {
        // A concurrent DELETE may prune the parent between mkdir and create
        let mut attempt = 0;
        loop {
            clear_file_ancestors(&self.root, &self.dest).await?;
            ensure_parent_exists(&self.dest).await?;
            match File::create(&self.temp).await {
                Ok(f) => {
                    self.opened.fetch_add(1, Ordering::SeqCst);
                    return Ok(f);
                }
                Err(e) if e.kind() == ErrorKind::NotFound && attempt < 2 => attempt += 1,
                Err(e) => return Err(SyncError::io(&self.temp, e)),
            }
        }
    }

    async fn reopen_temp(&self) -> SyncResult<File> {
        OpenOptions::new()
            .append(true)
            .open(&self.temp)
            .await
            .at_path(&self.temp)
    }

    /// Move the finished temp file over the destination. A directory at
    /// the destination only holds client paths the server does not have.
    async fn commit(&self) -> SyncResult<()> {
        if is_dir(&self.dest).await {
            tracing::debug!(path = %self.rel, "directory replaced by file");
            tokio::fs::remove_dir_all(&self.dest).await.at_path(&self.dest)?;
        }
        tokio::fs::rename(&self.temp, &self.dest).await.at_path(&self.dest)
    }
}

async fn run_writer(job: WriterJob, mut rx: mpsc::Receiver<WriteCmd>) -> SyncResult<WriterOutcome> {
    let mut guard: Option<TempGuard> = None;
    let mut bytes = 0u64;

    while let Some(first) = rx.recv().await {
        let lease = job.pool.acquire().await?;
        let mut file = if guard.is_none() {
            let f = job.create_temp().await?;
            guard = Some(TempGuard::new(job.temp.clone()));
            f
        } else {
            job.reopen_temp().await?
        };

        let mut next = Some(first);
        while let Some(cmd) = next {
            match cmd {
                WriteCmd::Chunk(data) => {
                    file.write_all(&data).await.at_path(&job.temp)?;
                    bytes += data.len() as u64;
                }
                WriteCmd::Finish => {
                    file.flush().await.at_path(&job.temp)?;
                    drop(file);
                    job.commit().await?;
                    if let Some(g) = guard.as_mut() {
                        g.disarm();
                    }
                    job.pool.release(lease);
                    tracing::debug!(path = %job.rel, bytes, "closed");
                    return Ok(WriterOutcome { rel: job.rel, bytes });
                }
            }
            next = rx.try_recv().ok();
        }

        // Queue drained: give the slot back until more data arrives
        file.flush().await.at_path(&job.temp)?;
        drop(file);
        job.pool.release(lease);
    }
    // Every sender went away without COMPLETE: the session is being torn down.
    Err(SyncError::Cancelled)
}

impl Sink {
    /// `pre_sync` is the client's own inventory sent with the request; any of
    /// its paths the session never mentions is removed by `finish`.
    pub fn new<I, S>(root: impl Into<PathBuf>, pool: ResourcePool, pre_sync: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            pool,
            tag: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            pre_sync: pre_sync.into_iter().map(Into::into).collect(),
            registry: Mutex::new(Registry::default()),
            writers: Mutex::new(JoinSet::new()),
            handles_opened: Arc::new(AtomicUsize::new(0)),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Destination handles created so far in this session
    pub fn handles_opened(&self) -> usize {
        self.handles_opened.load(Ordering::SeqCst)
    }

    /// Route one canonical message
    pub async fn apply(&self, msg: SyncResponse) -> SyncResult<()> {
        match msg.action {
            Action::Keep => self.keep(&msg.path),
            Action::Delete => self.delete(&msg.path).await,
            Action::Transfer => self.transfer(&msg.path, msg.data).await,
            Action::Complete => self.complete(&msg.path).await,
        }
    }

    fn check_unsettled(reg: &Registry, path: &str, what: &str) -> SyncResult<()> {
        if let Some(state) = reg.settled.get(path) {
            return Err(SyncError::protocol(format!(
                "{} for {:?} after it was already {:?}",
                what, path, state
            )));
        }
        Ok(())
    }

    // Caller holds the registry lock; this is the single-flight point.
    fn writer_for(&self, reg: &mut Registry, path: &str) -> SyncResult<mpsc::Sender<WriteCmd>> {
        if let Some(tx) = reg.open.get(path) {
            return Ok(tx.clone());
        }
        let dest = normalize_under_root(&self.root, path)?;
        let job = WriterJob {
            rel: path.to_string(),
            root: self.root.clone(),
            temp: temp_sibling(&dest, &self.tag),
            dest,
            pool: self.pool.clone(),
            opened: Arc::clone(&self.handles_opened),
        };
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        self.writers.lock().spawn(run_writer(job, rx));
        reg.open.insert(path.to_string(), tx.clone());
        Ok(tx)
    }

    fn writer_gone(&self, path: &str) -> SyncError {
        SyncError::io(
            self.root.join(path),
            std::io::Error::new(ErrorKind::BrokenPipe, "writer exited early"),
        )
    }

    /// Queue one chunk for `path`, creating its handle on first use. Waits
    /// while the path's queue is full.
    pub async fn transfer(&self, path: &str, chunk: Vec<u8>) -> SyncResult<()> {
        let tx = {
            let mut reg = self.registry.lock();
            Self::check_unsettled(&reg, path, "data")?;
            self.writer_for(&mut reg, path)?
        };
        tx.send(WriteCmd::Chunk(chunk)).await.map_err(|_| self.writer_gone(path))
    }

    /// Close `path`'s handle and move it into place. A path that never got a
    /// chunk becomes an empty file.
    pub async fn complete(&self, path: &str) -> SyncResult<()> {
        let tx = {
            let mut reg = self.registry.lock();
            Self::check_unsettled(&reg, path, "COMPLETE")?;
            let tx = self.writer_for(&mut reg, path)?;
            reg.open.remove(path);
            reg.settled.insert(path.to_string(), Settled::Completed);
            tx
        };
        tx.send(WriteCmd::Finish).await.map_err(|_| self.writer_gone(path))
    }

    pub fn keep(&self, path: &str) -> SyncResult<()> {
        let mut reg = self.registry.lock();
        Self::check_unsettled(&reg, path, "KEEP")?;
        if reg.open.contains_key(path) {
            return Err(SyncError::protocol(format!("KEEP for {:?} while data is in flight", path)));
        }
        reg.settled.insert(path.to_string(), Settled::Kept);
        Ok(())
    }

    /// Remove `path` from the destination. Missing paths are fine.
    pub async fn delete(&self, path: &str) -> SyncResult<()> {
        {
            let mut reg = self.registry.lock();
            Self::check_unsettled(&reg, path, "DELETE")?;
            if reg.open.contains_key(path) {
                return Err(SyncError::protocol(format!(
                    "DELETE for {:?} while data is in flight",
                    path
                )));
            }
            reg.settled.insert(path.to_string(), Settled::Deleted);
        }
        self.remove_path(path).await?;
        self.logger.delete(path);
        Ok(())
    }

    /// Remove the regular file at `path` and any directories it leaves empty.
    /// Returns false when there was no such file: it never existed, a writer
    /// already replaced it with a directory, or an ancestor became a file.
    async fn remove_path(&self, path: &str) -> SyncResult<bool> {
        let dest = normalize_under_root(&self.root, path)?;
        match tokio::fs::symlink_metadata(&dest).await {
            Ok(m) if m.is_dir() => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                let parent_is_dir = match dest.parent() {
                    Some(p) => is_dir(p).await,
                    None => false,
                };
                if parent_is_dir {
                    return Err(SyncError::io(dest, e));
                }
                return Ok(false);
            }
        }
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SyncError::io(dest, e)),
        }
        prune_empty_parents(&self.root, &dest).await;
        Ok(true)
    }

    /// End of a successful stream: close every pending handle, wait for all
    /// writers, then drop pre-sync paths the session never mentioned.
    pub async fn finish(&self) -> SyncResult<SinkStats> {
        let pending: Vec<(String, mpsc::Sender<WriteCmd>)> = {
            let mut reg = self.registry.lock();
            let pending: Vec<_> = reg.open.drain().collect();
            for (path, _) in &pending {
                reg.settled.insert(path.clone(), Settled::Completed);
            }
            pending
        };
        for (path, tx) in pending {
            if tx.send(WriteCmd::Finish).await.is_err() {
                tracing::debug!(path = %path, "writer already gone at finish");
            }
        }


        let mut writers = std::mem::take(&mut *self.writers.lock());
        let mut stats = SinkStats::default();
        while let Some(joined) = writers.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    stats.written += 1;
                    stats.bytes_written += outcome.bytes;
                    self.logger.transfer_done(&outcome.rel, outcome.bytes);
                }
                Ok(Err(e)) => {
                    writers.abort_all();
                    while writers.join_next().await.is_some() {}
                    return Err(e);
                }
                Err(_) => {
                    writers.abort_all();
                    while writers.join_next().await.is_some() {}
                    return Err(SyncError::Cancelled);
                }
            }
        }

        let (stale, kept, deleted) = {
            let reg = self.registry.lock();
            let mut stale: Vec<String> = self
                .pre_sync
                .iter()
                .filter(|p| !reg.settled.contains_key(p.as_str()))
                .cloned()
                .collect();
            stale.sort();
            let kept = reg.settled.values().filter(|s| **s == Settled::Kept).count() as u64;
            let deleted = reg.settled.values().filter(|s| **s == Settled::Deleted).count() as u64;
            (stale, kept, deleted)
        };
        for path in stale {
            if self.remove_path(&path).await? {
                tracing::debug!(path = %path, "removed stale path");
                self.logger.delete(&path);
                stats.stale_removed += 1;
            }
        }

        stats.kept = kept;
        stats.deleted = deleted;
        stats.handles_opened = self.handles_opened() as u64;
        Ok(stats)
    }

    /// Tear the session down after a failure. Pending handles are discarded
    /// and their temporary files removed. Returns the first writer error, if
    /// a writer failed on its own.
    pub async fn abort(&self) -> Option<SyncError> {
        self.registry.lock().open.clear();
        let mut writers = std::mem::take(&mut *self.writers.lock());
        // Writers that already failed have finished; collect them before aborting the rest.
        let mut first = None;
        while let Some(joined) = writers.try_join_next() {
            if let Ok(Err(e)) = joined {
                if first.is_none() && !matches!(e, SyncError::Cancelled) {
                    first = Some(e);
                }
            }
        }
        writers.abort_all();
        while let Some(joined) = writers.join_next().await {
            if let Ok(Err(e)) = joined {
                if first.is_none() && !matches!(e, SyncError::Cancelled) {
                    first = Some(e);
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn leftovers(root: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "X").unwrap();
        fs::write(dir.path().join("b.txt"), "old").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(4), ["a.txt", "b.txt"]);

        sink.apply(SyncResponse::delete("b.txt")).await.unwrap();
        sink.apply(SyncResponse::keep("a.txt")).await.unwrap();
        sink.apply(SyncResponse::chunk("c.txt", b"new".to_vec())).await.unwrap();
        sink.apply(SyncResponse::complete("c.txt")).await.unwrap();
        let stats = sink.finish().await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "X");
        assert_eq!(fs::read_to_string(dir.path().join("c.txt")).unwrap(), "new");
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.bytes_written, 3);
        assert_eq!(stats.stale_removed, 0);
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_chunks_keep_order_and_create_parents() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(2), Vec::<String>::new());
        for part in ["one ", "two ", "three"] {
            sink.transfer("x/y/z.txt", part.as_bytes().to_vec()).await.unwrap();
        }
        sink.complete("x/y/z.txt").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("x/y/z.txt")).unwrap(), "one two three");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_chunks_share_one_handle() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path(), ResourcePool::new(8), Vec::<String>::new()));

        let (a, b) = tokio::join!(
            sink.transfer("new.bin", b"hello ".to_vec()),
            sink.transfer("new.bin", b"world".to_vec())
        );
        a.unwrap();
        b.unwrap();
        sink.complete("new.bin").await.unwrap();
        let stats = sink.finish().await.unwrap();

        assert_eq!(fs::read(dir.path().join("new.bin")).unwrap(), b"hello world");
        assert_eq!(stats.handles_opened, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_tasks_never_duplicate_handles() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path(), ResourcePool::new(8), Vec::<String>::new()));
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let sink = Arc::clone(&sink);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                sink.transfer("race.bin", vec![b'a' + i; 4]).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        sink.complete("race.bin").await.unwrap();
        let stats = sink.finish().await.unwrap();

        assert_eq!(stats.handles_opened, 1);
        let data = fs::read(dir.path().join("race.bin")).unwrap();
        assert_eq!(data.len(), 32);
        // Every chunk landed whole
        let mut blocks: Vec<&[u8]> = data.chunks(4).collect();
        blocks.sort();
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(*block, &[b'a' + i as u8; 4][..]);
        }
    }

    #[tokio::test]
    async fn test_complete_without_data_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), Vec::<String>::new());
        sink.complete("empty.txt").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(fs::read(dir.path().join("empty.txt")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_writes_after_settlement_are_violations() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(2), Vec::<String>::new());

        sink.transfer("done.txt", b"1".to_vec()).await.unwrap();
        sink.complete("done.txt").await.unwrap();
        assert!(matches!(sink.transfer("done.txt", b"2".to_vec()).await, Err(SyncError::Protocol(_))));
        assert!(matches!(sink.complete("done.txt").await, Err(SyncError::Protocol(_))));

        sink.keep("same.txt").unwrap();
        assert!(matches!(sink.transfer("same.txt", b"x".to_vec()).await, Err(SyncError::Protocol(_))));

        sink.delete("gone.txt").await.unwrap();
        assert!(matches!(sink.transfer("gone.txt", b"x".to_vec()).await, Err(SyncError::Protocol(_))));

        sink.transfer("busy.txt", b"x".to_vec()).await.unwrap();
        assert!(matches!(sink.keep("busy.txt"), Err(SyncError::Protocol(_))));
        assert!(matches!(sink.delete("busy.txt").await, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), Vec::<String>::new());
        sink.delete("never-existed.txt").await.unwrap();
        sink.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmentioned_pre_sync_paths_are_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "k").unwrap();
        fs::write(dir.path().join("stale.txt"), "s").unwrap();
        fs::write(dir.path().join("untracked.txt"), "u").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), ["keep.txt", "stale.txt"]);

        sink.keep("keep.txt").unwrap();
        let stats = sink.finish().await.unwrap();
        assert_eq!(stats.stale_removed, 1);
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("stale.txt").exists());
        // Not part of the pre-sync inventory, so not ours to judge
        assert!(dir.path().join("untracked.txt").exists());
    }

    #[tokio::test]
    async fn test_pending_handles_are_closed_at_finish() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), Vec::<String>::new());
        sink.transfer("open.txt", b"tail".to_vec()).await.unwrap();
        let stats = sink.finish().await.unwrap();
        assert_eq!(stats.written, 1);
        assert_eq!(fs::read_to_string(dir.path().join("open.txt")).unwrap(), "tail");
    }

    #[tokio::test]
    async fn test_abort_discards_partial_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file.txt"), "previous").unwrap();
        let pool = ResourcePool::new(1);
        let sink = Sink::new(dir.path(), pool.clone(), ["file.txt"]);
        sink.transfer("file.txt", b"half of the new".to_vec()).await.unwrap();
        tokio::task::yield_now().await;

        assert!(sink.abort().await.is_none());
        assert_eq!(fs::read_to_string(dir.path().join("file.txt")).unwrap(), "previous");
        assert!(leftovers(dir.path()).is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_traversal_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), Vec::<String>::new());
        assert!(matches!(sink.transfer("../escape.txt", b"x".to_vec()).await, Err(SyncError::Protocol(_))));
        assert!(matches!(sink.delete("/etc/passwd").await, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_handles_respect_pool_bound() {
        let dir = TempDir::new().unwrap();
        let pool = ResourcePool::new(2);
        let sink = Sink::new(dir.path(), pool.clone(), Vec::<String>::new());
        for i in 0..10 {
            let p = format!("f{}.txt", i);
            sink.transfer(&p, vec![b'z'; 1024]).await.unwrap();
            sink.complete(&p).await.unwrap();
        }
        let stats = sink.finish().await.unwrap();
        assert_eq!(stats.written, 10);
        assert!(pool.peak() <= 2);
    }

    #[tokio::test]
    async fn test_delete_prunes_emptied_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/z.txt"), "z").unwrap();
        fs::write(dir.path().join("x/keep.txt"), "k").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(1), ["x/y/z.txt", "x/keep.txt"]);

        sink.delete("x/y/z.txt").await.unwrap();
        assert!(!dir.path().join("x/y").exists());
        assert!(dir.path().join("x/keep.txt").exists());

        sink.delete("x/keep.txt").await.unwrap();
        assert!(!dir.path().join("x").exists());
        assert!(dir.path().is_dir());
        sink.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_directory_contents_make_room_for_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/b"), "nested").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(2), ["a/b"]);

        sink.apply(SyncResponse::delete("a/b")).await.unwrap();
        sink.apply(SyncResponse::chunk("a", b"flat".to_vec())).await.unwrap();
        sink.apply(SyncResponse::complete("a")).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a")).unwrap(), "flat");
    }

    #[tokio::test]
    async fn test_directory_becomes_file_without_delete() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/deeper")).unwrap();
        fs::write(dir.path().join("a/b"), "nested").unwrap();
        fs::write(dir.path().join("a/deeper/c"), "more").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(2), ["a/b", "a/deeper/c"]);

        sink.transfer("a", b"flat".to_vec()).await.unwrap();
        sink.complete("a").await.unwrap();
        let stats = sink.finish().await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a")).unwrap(), "flat");
        assert_eq!(stats.written, 1);
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_file_becomes_directory_without_delete() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "flat").unwrap();
        let sink = Sink::new(dir.path(), ResourcePool::new(2), ["a"]);

        sink.transfer("a/b/c.txt", b"nested".to_vec()).await.unwrap();
        sink.complete("a/b/c.txt").await.unwrap();
        sink.transfer("a/d.txt", b"sibling".to_vec()).await.unwrap();
        sink.complete("a/d.txt").await.unwrap();
        sink.finish().await.unwrap();

        assert!(dir.path().join("a").is_dir());
        assert_eq!(fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(), "nested");
        assert_eq!(fs::read_to_string(dir.path().join("a/d.txt")).unwrap(), "sibling");
    }

    #[tokio::test]
    async fn test_interleaved_paths_beyond_pool_and_queue() {
        let dir = TempDir::new().unwrap();
        let pool = ResourcePool::new(1);
        let sink = Sink::new(dir.path(), pool.clone(), Vec::<String>::new());
        let paths = ["p/one.bin", "p/two.bin", "three.bin"];

        // More chunks per path than the queue holds, all paths open at once
        for round in 0..(WRITE_QUEUE * 3) {
            for (i, p) in paths.iter().enumerate() {
                sink.transfer(p, vec![(round + i) as u8; 512]).await.unwrap();
            }
        }
        for p in paths {
            sink.complete(p).await.unwrap();
        }
        let stats = sink.finish().await.unwrap();

        assert_eq!(stats.written, 3);
        assert_eq!(stats.handles_opened, 3);
        assert!(pool.peak() <= 1);
        for (i, p) in paths.iter().enumerate() {
            let data = fs::read(dir.path().join(p)).unwrap();
            assert_eq!(data.len(), WRITE_QUEUE * 3 * 512);
            for (round, block) in data.chunks(512).enumerate() {
                assert!(block.iter().all(|b| *b == (round + i) as u8));
            }
        }
    }
}
