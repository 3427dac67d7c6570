//! hashsync library
//!
//! Content-hash directory synchronization: a client reports its inventory,
//! the server streams back only what differs, and both sides bound their
//! open file descriptors with a shared-fairness pool.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod legacy;
pub mod logger;
pub mod planner;
pub mod pool;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod sink;
pub mod wire;

pub use error::{SyncError, SyncResult};
