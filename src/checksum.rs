//! Content digests for inventory entries

use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::pool::ResourcePool;
use crate::protocol::DIGEST_CHUNK_SIZE;

/// SHA-256 of a file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of_bytes(data: &[u8]) -> Self {
        Digest(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl FromStr for Digest {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut out)
            .map_err(|e| SyncError::Config(format!("bad digest {:?}: {}", s, e)))?;
        Ok(Digest(out))
    }
}

/// Stream a file through SHA-256 while holding one pool lease.
/// Memory use is bounded by DIGEST_CHUNK_SIZE whatever the file size.
pub async fn digest_file(path: &Path, pool: &ResourcePool) -> SyncResult<Digest> {
    let lease = pool.acquire().await?;
    let mut file = tokio::fs::File::open(path).await.at_path(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    drop(file);
    pool.release(lease);
    Ok(Digest(hasher.finalize().into()))
}
