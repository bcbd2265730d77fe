use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::durability::wal::WalEntry;

/// Transport-level failure of a replication RPC. The client never surfaces
/// this to callers; it is absorbed by the replica state machine.
#[derive(Debug, Clone, Error)]
#[error("rpc failed: {0}")]
pub struct RpcError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub main_commit_timestamp: u64,
    pub epoch_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub current_commit_timestamp: u64,
    pub epoch_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendDeltasResponse {
    pub success: bool,
    pub current_commit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub current_commit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFilesResponse {
    pub current_commit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentWalResponse {
    pub current_commit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlySnapshotResponse {
    pub success: bool,
    pub current_commit_timestamp: u64,
}

/// Open per-transaction stream of deltas toward one replica.
pub trait DeltaStream: Send {
    fn append(&mut self, entry: &WalEntry) -> Result<(), RpcError>;
    fn finalize(self: Box<Self>) -> Result<AppendDeltasResponse, RpcError>;
}

/// RPC surface the replication client drives. The network/TLS plumbing
/// behind it is supplied by the embedder.
pub trait ReplicationTransport: Send + Sync {
    fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, RpcError>;

    fn start_append_deltas(
        &self,
        previous_commit_timestamp: u64,
        wal_seq_num: u64,
        epoch_id: String,
    ) -> Result<Box<dyn DeltaStream>, RpcError>;

    fn transfer_snapshot(&self, path: &Path) -> Result<SnapshotResponse, RpcError>;

    fn transfer_wal_files(&self, paths: &[PathBuf]) -> Result<WalFilesResponse, RpcError>;

    fn transfer_current_wal(
        &self,
        filename: &str,
        total_size: u64,
        file_bytes: &[u8],
        buffer_bytes: &[u8],
    ) -> Result<CurrentWalResponse, RpcError>;

    fn transfer_only_snapshot(
        &self,
        snapshot_timestamp: u64,
        epoch_id: String,
    ) -> Result<OnlySnapshotResponse, RpcError>;

    /// Cancels whatever is in flight before a reconnect attempt.
    fn abort(&self) {}
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Single-worker task queue used by each replication client for finalize,
/// catch-up, and reconnect work. Tasks run in submission order. Dropping
/// the pool disconnects the queue; the worker exits after the task in
/// progress, and is deliberately not joined so a hung RPC cannot stall
/// shutdown.
pub(crate) struct TaskPool {
    sender: Option<Sender<Task>>,
    _worker: Option<JoinHandle<()>>,
}

impl TaskPool {
    pub(crate) fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name(format!("replication-{name}"))
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("failed to spawn replication worker");
        Self {
            sender: Some(sender),
            _worker: Some(worker),
        }
    }

    pub(crate) fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(task));
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool").finish()
    }
}
