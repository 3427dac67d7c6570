use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{IoResultExt, SyncResult};

/// Audit trail of what a sync did to a tree
pub trait Logger: Send + Sync {
    fn start(&self, _root: &Path, _client_id: &str) {}
    fn transfer_done(&self, _path: &str, _bytes: u64) {}
    fn delete(&self, _path: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .at_path(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, root: &Path, client_id: &str) {
        self.line(&format!("START root={} client={}", root.display(), client_id));
    }
    fn transfer_done(&self, path: &str, bytes: u64) {
        self.line(&format!("WRITE path={} bytes={}", path, bytes));
    }
    fn delete(&self, path: &str) {
        self.line(&format!("DELETE path={}", path));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_text_logger_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/sync.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.start(Path::new("/tmp/root"), "client-1");
        logger.transfer_done("c.txt", 3);
        logger.delete("b.txt");
        logger.done(1, 3, 0.25);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("START root=/tmp/root client=client-1"));
        assert!(lines[1].ends_with("WRITE path=c.txt bytes=3"));
        assert!(lines[2].ends_with("DELETE path=b.txt"));
        assert!(lines[3].ends_with("DONE files=1 bytes=3 seconds=0.250"));
    }
}
