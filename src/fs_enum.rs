//! Tree enumeration and content inventories.
//!
//! `index` walks a root with walkdir (symlinks are not followed and only
//! regular files are inventoried), then digests every file in its own task.
//! How many files are open at once is decided by the ResourcePool, not by
//! the walk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;

use crate::checksum::{digest_file, Digest};
use crate::error::{SyncError, SyncResult};
use crate::pool::ResourcePool;
use crate::protocol_core::relative_wire_path;
use crate::wire::FileInfo;

/// Regular file found under a root
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub rel: String,
    pub size: u64,
}

/// path -> digest for one root at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    entries: BTreeMap<String, Digest>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: Digest) -> Option<Digest> {
        self.entries.insert(path.into(), digest)
    }

    pub fn get(&self, path: &str) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.entries.iter().map(|(p, d)| (p.as_str(), d))
    }

    /// Wire form sent in the request
    pub fn to_wire(&self) -> Vec<FileInfo> {
        self.entries
            .iter()
            .map(|(path, digest)| FileInfo {
                path: path.clone(),
                hash: digest.to_hex(),
            })
            .collect()
    }

    /// Rebuild an inventory from a client report. Duplicate paths and
    /// malformed digests are rejected.
    pub fn from_wire(info: &[FileInfo]) -> SyncResult<Self> {
        let mut inv = Inventory::new();
        for fi in info {
            if fi.path.is_empty() {
                return Err(SyncError::Config("inventory entry with empty path".into()));
            }
            let digest: Digest = fi.hash.parse()?;
            if inv.insert(fi.path.clone(), digest).is_some() {
                return Err(SyncError::Config(format!("duplicate inventory path {:?}", fi.path)));
            }
        }
        Ok(inv)
    }
}

impl FromIterator<(String, Digest)> for Inventory {
    fn from_iter<I: IntoIterator<Item = (String, Digest)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn walk_error(root: &Path, e: walkdir::Error) -> SyncError {
    let path = e.path().unwrap_or(root).to_path_buf();
    let source = e
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
    SyncError::Io { path, source }
}

/// List regular files under `root`. Any unreadable entry fails the walk.
pub fn enumerate_files(root: &Path) -> SyncResult<Vec<FileEntry>> {
    use walkdir::WalkDir;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = match relative_wire_path(root, path) {
            Some(rel) => rel,
            None => {
                tracing::warn!(path = %path.display(), "skipping file with non UTF-8 name");
                continue;
            }
        };
        let size = entry.metadata().map_err(|e| walk_error(root, e))?.len();
        entries.push(FileEntry {
            path: path.to_path_buf(),
            rel,
            size,
        });
    }
    Ok(entries)
}

/// Build the inventory of `root`, digesting files concurrently through `pool`.
pub async fn index(root: &Path, pool: &ResourcePool) -> SyncResult<Inventory> {
    let walk_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || enumerate_files(&walk_root))
        .await
        .map_err(|_| SyncError::Cancelled)??;
    let total_bytes: u64 = files.iter().map(|fe| fe.size).sum();

    let mut tasks = JoinSet::new();
    for fe in files {
        let pool = pool.clone();
        tasks.spawn(async move {
            let digest = digest_file(&fe.path, &pool).await?;
            Ok::<_, SyncError>((fe.rel, digest))
        });
    }

    let mut inv = Inventory::new();
    while let Some(joined) = tasks.join_next().await {
        let (rel, digest) = match joined {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(_) => {
                tasks.abort_all();
                return Err(SyncError::Cancelled);
            }
        };
        inv.insert(rel, digest);
    }
    tracing::debug!(root = %root.display(), files = inv.len(), bytes = total_bytes, "indexed");
    Ok(inv)
}

/// Like `index`, but a root that does not exist yet is an empty inventory
pub async fn index_or_empty(root: &Path, pool: &ResourcePool) -> SyncResult<Inventory> {
    match tokio::fs::metadata(root).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Inventory::new()),
        _ => index(root, pool).await,
    }
}

/// Immediate subdirectory names of `root` (one per client storage root)
pub async fn list_subdirs(root: &Path) -> SyncResult<Vec<String>> {
    use crate::error::IoResultExt;

    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(root).await.at_path(root)?;
    while let Some(entry) = rd.next_entry().await.at_path(root)? {
        let ft = entry.file_type().await.at_path(entry.path())?;
        if ft.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[tokio::test]
    async fn test_index_nested_tree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "X");
        write(dir.path(), "sub/b.txt", "old");
        write(dir.path(), "sub/deeper/c.txt", "");
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let pool = ResourcePool::new(2);
        let inv = index(dir.path(), &pool).await.unwrap();
        assert_eq!(inv.paths().collect::<Vec<_>>(), vec!["a.txt", "sub/b.txt", "sub/deeper/c.txt"]);
        assert_eq!(inv.get("a.txt"), Some(&Digest::of_bytes(b"X")));
        assert_eq!(inv.get("sub/deeper/c.txt"), Some(&Digest::of_bytes(b"")));
        assert!(pool.peak() <= 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_enumerate_reports_sizes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "X");
        write(dir.path(), "sub/b.txt", "old");
        let mut files = enumerate_files(dir.path()).unwrap();
        files.sort_by(|x, y| x.rel.cmp(&y.rel));
        let sizes: Vec<(&str, u64)> = files.iter().map(|f| (f.rel.as_str(), f.size)).collect();
        assert_eq!(sizes, vec![("a.txt", 1), ("sub/b.txt", 3)]);
    }

    #[tokio::test]
    async fn test_index_is_stable_across_creation_order() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        let names = ["m.txt", "a/z.txt", "a/b.txt", "q/r/s.txt"];
        for n in names.iter() {
            write(one.path(), n, n);
        }
        for n in names.iter().rev() {
            write(two.path(), n, n);
        }

        let pool = ResourcePool::new(4);
        let first = index(one.path(), &pool).await.unwrap();
        let again = index(one.path(), &pool).await.unwrap();
        let other = index(two.path(), &pool).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first, other);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_inventoried() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "real.txt", "data");
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();

        let inv = index(dir.path(), &ResourcePool::new(1)).await.unwrap();
        assert_eq!(inv.paths().collect::<Vec<_>>(), vec!["real.txt"]);
    }

    #[tokio::test]
    async fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let pool = ResourcePool::new(1);
        assert!(matches!(index(&missing, &pool).await, Err(SyncError::Io { .. })));
        assert!(index_or_empty(&missing, &pool).await.unwrap().is_empty());
    }

    #[test]
    fn test_wire_conversion() {
        let inv: Inventory = vec![("a.txt".to_string(), Digest::of_bytes(b"X"))].into_iter().collect();
        let wire = inv.to_wire();
        assert_eq!(wire[0].hash, Digest::of_bytes(b"X").to_hex());
        assert_eq!(Inventory::from_wire(&wire).unwrap(), inv);

        let mut dup = wire.clone();
        dup.push(wire[0].clone());
        assert!(matches!(Inventory::from_wire(&dup), Err(SyncError::Config(_))));

        let bad = vec![FileInfo { path: "a.txt".into(), hash: "nothex".into() }];
        assert!(Inventory::from_wire(&bad).is_err());
    }

    #[tokio::test]
    async fn test_list_subdirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("client-b")).unwrap();
        fs::create_dir_all(dir.path().join("client-a")).unwrap();
        write(dir.path(), "stray.txt", "x");
        assert_eq!(list_subdirs(dir.path()).await.unwrap(), vec!["client-a", "client-b"]);
    }
}
