//! Shared protocol constants for the hashsync framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"HSNC";
pub const VERSION: u16 = 2;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion.
// A request frame carries the whole client inventory, so this also caps
// the inventory size a client may report.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Bytes read per TRANSFER chunk on the server
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes read per digest update while indexing
pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Default bound on concurrently open file descriptors
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default daemon bind address
pub const DEFAULT_BIND: &str = "127.0.0.1:50051";

// Frame type IDs (keep numeric stable)
pub mod frame {
    // Client -> server: SyncRequest (metadata + inventory)
    pub const REQUEST: u8 = 1;
    // Server -> client: SyncResponse with explicit action tag
    pub const RESPONSE: u8 = 2;
    // Server -> client: LegacyResponse, zero-length first chunk means unchanged
    pub const LEGACY_RESPONSE: u8 = 3;
    // Server -> client: successful end of stream, carries EndSummary
    pub const END: u8 = 4;
    // Server -> client: terminal Status, the call failed
    pub const ERROR: u8 = 5;
}

// Call metadata keys
pub mod metadata {
    pub const CLIENT_ID: &str = "clientId";
    pub const AUTH_TOKEN: &str = "authToken";
}

// Centralized timeout constants
pub mod timeouts {
    // Server waits this long for the request frame after accept (ms)
    pub const REQUEST_MS: u64 = 5_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 30_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Calculate write deadline based on payload size (ms)
    // 30s base + 1ms per 1MB payload (ceil); a slow receiver stalls writes
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}
