//! Host-wide configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Batch memory ceiling for builds with a 32-bit address space.
const MAX_BATCH_MEMORY_32BIT: usize = 4 * 1024 * 1024;

/// Batch memory ceiling everywhere else.
const MAX_BATCH_MEMORY: usize = 32 * 1024 * 1024;

/// Server-side settings shared by every database and connection.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Longest silence before a connection sends a heartbeat.
    /// Default: 1s
    pub heartbeat_interval: Duration,

    /// Bounded wait for the subscription active lock per fetch cycle.
    /// Default: 300ms
    pub active_lock_timeout: Duration,

    /// Lease granted to the active-lock holder. A holder that stops renewing
    /// (its connection died) loses the lock once the lease runs out.
    /// Default: 30s
    pub active_lock_lease: Duration,

    /// Stop adding documents to a batch past this many bytes.
    /// Default: 4MB on 32-bit targets, 32MB otherwise
    pub max_batch_memory: usize,

    /// Documents read from storage per page while scanning.
    /// Default: 256
    pub fetch_page_size: usize,

    /// Entries kept in each connection's status history.
    /// Default: 50
    pub status_history_len: usize,

    /// Commands merged into one transaction by a shard's merger.
    /// Default: 1024
    pub merger_batch_limit: usize,

    /// Items removed per bucket-deletion command.
    /// Default: 1024
    pub delete_bucket_batch_size: usize,

    /// How long a new connection waits for the client's options.
    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Upper bound on how long a `WaitForFree` connection waits to register.
    /// Default: 30s
    pub wait_for_free_timeout: Duration,

    /// Document ids whose bucket a sharded database remembers.
    /// Default: 4096
    pub bucket_cache_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let max_batch_memory = if cfg!(target_pointer_width = "32") {
            MAX_BATCH_MEMORY_32BIT
        } else {
            MAX_BATCH_MEMORY
        };

        Self {
            heartbeat_interval: Duration::from_secs(1),
            active_lock_timeout: Duration::from_millis(300),
            active_lock_lease: Duration::from_secs(30),
            max_batch_memory,
            fetch_page_size: 256,
            status_history_len: 50,
            merger_batch_limit: 1024,
            delete_bucket_batch_size: 1024,
            handshake_timeout: Duration::from_secs(10),
            wait_for_free_timeout: Duration::from_secs(30),
            bucket_cache_size: 4096,
        }
    }
}

/// Where the cluster journal lives.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Directory holding the journal and its lock file.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./journal"),
            create_if_missing: true,
        }
    }
}
