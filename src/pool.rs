//! Bounded admission gate for open file descriptors.
//!
//! Every file the server reads and every destination the client writes holds
//! a [`Lease`] for as long as its descriptor is open. Waiters are served in
//! FIFO order: tokio's semaphore queues acquirers fairly and hands a released
//! permit straight to the head of the queue, so a slot is never granted twice
//! and the limit is never exceeded in between.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{SyncError, SyncResult};
use crate::protocol::DEFAULT_POOL_SIZE;

#[derive(Debug, Default)]
struct PoolStats {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    granted: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ResourcePool {
    limit: usize,
    permits: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

/// Permission to hold one descriptor open. Released on drop.
#[derive(Debug)]
pub struct Lease {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stats.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ResourcePool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Wait for a free slot. Suspends while `limit` leases are outstanding.
    pub async fn acquire(&self) -> SyncResult<Lease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        let now = self.stats.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        self.stats.granted.fetch_add(1, Ordering::SeqCst);
        Ok(Lease {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Give a lease back. Same as dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Leases currently held
    pub fn outstanding(&self) -> usize {
        self.stats.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of leases ever held at once
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Total leases handed out since creation
    pub fn granted(&self) -> usize {
        self.stats.granted.load(Ordering::SeqCst)
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
