//! Shared protocol logic for the server and client sessions
//!
//! Frame header codec, async frame I/O over any tokio stream half, and the
//! path rules both sides apply to names that cross the wire.

use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::error::{IoResultExt, SyncError, SyncResult};
use crate::protocol::timeouts::write_deadline_ms;

/// Size of the frame header in bytes
pub const FRAME_HEADER_LEN: usize = 11;

/// Normalize a wire path to be safely under a root directory.
/// Rejects:
/// 1. empty paths and NUL bytes
/// 2. absolute paths, parent directory components, and root/prefix components
/// 3. on Windows, ':' in path components (ADS defense)
///
/// Existing paths are canonicalized so a symlinked directory cannot lead
/// outside the root.
pub fn normalize_under_root(root: &Path, rel: &str) -> SyncResult<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if rel.is_empty() {
        return Err(SyncError::protocol("empty path"));
    }
    if rel.contains('\0') {
        return Err(SyncError::protocol(format!("path contains NUL byte: {:?}", rel)));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(SyncError::protocol(format!(
                        "path component contains colon: {:?}",
                        rel
                    )));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(SyncError::protocol(format!(
                    "path contains disallowed component {:?}: {:?}",
                    component, rel
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(SyncError::protocol(format!("path names the root itself: {:?}", rel)));
    }

    let joined = root.join(&safe);

    // Only the deepest existing ancestor can be a symlink that escapes.
    let canon_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let mut probe = joined.parent();
    while let Some(dir) = probe {
        if dir.exists() {
            let canon = dir.canonicalize().at_path(dir)?;
            if !canon.starts_with(&canon_root) {
                return Err(SyncError::protocol(format!("path {:?} escapes root", rel)));
            }
            break;
        }
        probe = dir.parent();
    }

    Ok(joined)
}

/// Relative, slash-separated form of `path` under `root`
pub fn relative_wire_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A client id selects `storage_root/<client_id>` and must be one plain name
pub fn validate_client_id(client_id: Option<&str>) -> SyncResult<&str> {
    let id = client_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::Config("request missing required metadata field: clientId".into()))?;
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !id.contains('\0') && !id.contains('/') && !id.contains('\\') => Ok(id),
        _ => Err(SyncError::Config(format!("clientId is not a plain name: {:?}", id))),
    }
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> SyncResult<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        return Err(SyncError::protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size,
            crate::protocol::MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> SyncResult<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    if &header[0..4] != MAGIC {
        return Err(SyncError::protocol("invalid magic in frame header"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(SyncError::protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

fn stream_err(e: std::io::Error) -> SyncError {
    SyncError::io("<stream>", e)
}

/// Read one frame. Returns `None` on a clean EOF before the first header byte.
pub async fn read_frame<R>(r: &mut R) -> SyncResult<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let first = r.read(&mut hdr).await.map_err(stream_err)?;
    if first == 0 {
        return Ok(None);
    }
    if first < FRAME_HEADER_LEN {
        r.read_exact(&mut hdr[first..]).await.map_err(stream_err)?;
    }
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await.map_err(stream_err)?;
    }
    Ok(Some((typ, payload)))
}

/// Write one frame within a deadline scaled by the payload size
pub async fn write_frame<W>(w: &mut W, frame_type: u8, payload: &[u8]) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let ms = write_deadline_ms(payload.len());
    let hdr = build_frame_header(frame_type, payload.len() as u32);
    match timeout(Duration::from_millis(ms), async {
        w.write_all(&hdr).await?;
        if !payload.is_empty() {
            w.write_all(payload).await?;
        }
        w.flush().await
    })
    .await
    {
        Ok(res) => res.map_err(stream_err),
        Err(_) => Err(stream_err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("frame write timeout ({} ms)", ms),
        ))),
    }
}

/// Create parent directory if needed
pub async fn ensure_parent_exists(path: &Path) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.at_path(parent)?;
    }
    Ok(())
}
