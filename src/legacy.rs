//! Compatibility shim for the untagged response shape.
//!
//! Old servers send `(path, data)` pairs only: a zero-length first message
//! for a path means "unchanged", any other message is file data, and there
//! is neither DELETE nor COMPLETE. The adapter turns that into canonical
//! messages so the Sink only ever sees one protocol. Removals fall out of
//! the Sink's stale-path cleanup, and every transferred path is completed
//! when the stream ends.

use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::wire::{LegacyResponse, SyncResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyState {
    Unchanged,
    Receiving,
}

#[derive(Debug, Default)]
pub struct LegacyAdapter {
    seen: HashMap<String, LegacyState>,
}

impl LegacyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, msg: LegacyResponse) -> SyncResult<SyncResponse> {
        match self.seen.get(&msg.path).copied() {
            None if msg.data.is_empty() => {
                self.seen.insert(msg.path.clone(), LegacyState::Unchanged);
                Ok(SyncResponse::keep(msg.path))
            }
            None => {
                self.seen.insert(msg.path.clone(), LegacyState::Receiving);
                Ok(SyncResponse::chunk(msg.path, msg.data))
            }
            Some(LegacyState::Receiving) => Ok(SyncResponse::chunk(msg.path, msg.data)),
            Some(LegacyState::Unchanged) => Err(SyncError::protocol(format!(
                "data for {:?} after it was reported unchanged",
                msg.path
            ))),
        }
    }

    /// COMPLETE messages for every path that received data, in path order
    pub fn finish(self) -> Vec<SyncResponse> {
        let mut paths: Vec<String> = self
            .seen
            .into_iter()
            .filter(|(_, s)| *s == LegacyState::Receiving)
            .map(|(p, _)| p)
            .collect();
        paths.sort();
        paths.into_iter().map(SyncResponse::complete).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Action;

    fn legacy(path: &str, data: &[u8]) -> LegacyResponse {
        LegacyResponse {
            path: path.to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_translation() {
        let mut a = LegacyAdapter::new();
        assert_eq!(a.translate(legacy("a.txt", b"")).unwrap().action, Action::Keep);
        let first = a.translate(legacy("c.txt", b"ne")).unwrap();
        assert_eq!(first, SyncResponse::chunk("c.txt", b"ne".to_vec()));
        let second = a.translate(legacy("c.txt", b"w")).unwrap();
        assert_eq!(second, SyncResponse::chunk("c.txt", b"w".to_vec()));
        // A zero-length chunk in the middle of a file is just empty data
        assert_eq!(a.translate(legacy("c.txt", b"")).unwrap().action, Action::Transfer);

        assert_eq!(a.finish(), vec![SyncResponse::complete("c.txt")]);
    }

    #[test]
    fn test_data_after_unchanged_is_a_violation() {
        let mut a = LegacyAdapter::new();
        a.translate(legacy("a.txt", b"")).unwrap();
        assert!(matches!(a.translate(legacy("a.txt", b"X")), Err(SyncError::Protocol(_))));
    }
}
