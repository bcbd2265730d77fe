use std::path::PathBuf;
use std::time::Duration;

/// Garbage collection scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    /// Never reclaim anything automatically.
    Nothing,
    /// Run the collector on a dedicated thread at a fixed interval.
    Periodic,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub gc_type: GcType,
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_type: GcType::Periodic,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItemsConfig {
    /// When disabled, edges are adjacency entries only and setting a
    /// property on an edge fails with `PropertiesDisabled`.
    pub properties_on_edges: bool,
}

#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    pub snapshot_directory: PathBuf,
    pub wal_directory: PathBuf,
    /// Replay the snapshot + WAL chain found in the directories on startup.
    pub recover_on_startup: bool,
    /// Periodic snapshot writer interval; `None` disables the thread.
    pub snapshot_interval: Option<Duration>,
    /// How many finished snapshots to keep on disk.
    pub snapshot_retention_count: usize,
    /// Size threshold after which the current WAL segment is finalized.
    pub wal_file_size_kib: u64,
    /// Group WAL fsyncs across this many committed transactions.
    pub wal_file_flush_every_n_tx: u64,
}

impl DurabilityConfig {
    pub fn new(snapshot_directory: impl Into<PathBuf>, wal_directory: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_directory: snapshot_directory.into(),
            wal_directory: wal_directory.into(),
            recover_on_startup: true,
            snapshot_interval: None,
            snapshot_retention_count: 3,
            wal_file_size_kib: 20 * 1024,
            wal_file_flush_every_n_tx: 1,
        }
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gc: GcConfig,
    pub items: ItemsConfig,
    pub durability: Option<DurabilityConfig>,
}

impl Config {
    /// In-memory configuration with a fast collector, used across the test
    /// suite.
    pub fn in_memory(gc_interval: Duration) -> Self {
        Self {
            gc: GcConfig {
                gc_type: GcType::Periodic,
                interval: gc_interval,
            },
            items: ItemsConfig::default(),
            durability: None,
        }
    }

    /// Fully durable configuration: every transaction is flushed before the
    /// commit returns.
    pub fn durable(snapshot_directory: impl Into<PathBuf>, wal_directory: impl Into<PathBuf>) -> Self {
        Self {
            gc: GcConfig::default(),
            items: ItemsConfig::default(),
            durability: Some(DurabilityConfig::new(snapshot_directory, wal_directory)),
        }
    }
}

/// Replication mode of a single replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Commit waits for the replica acknowledgement.
    Sync,
    /// Replica is fed from a worker thread; commit never waits.
    Async,
}

/// TLS material handed to the transport when establishing the RPC channel.
#[derive(Debug, Clone)]
pub struct ReplicationSslConfig {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationClientConfig {
    /// Sync-mode acknowledgement timeout. Expiry demotes the replica to
    /// async for the rest of its life unless `restore_sync_on_recovery` is
    /// set.
    pub timeout: Option<Duration>,
    /// Promote a timed-out replica back to sync after a successful catch-up.
    pub restore_sync_on_recovery: bool,
    pub ssl: Option<ReplicationSslConfig>,
}
