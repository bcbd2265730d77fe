use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{ReplicationClientConfig, ReplicationMode};
use crate::durability::file_retainer::FileLocker;
use crate::durability::snapshot::SnapshotInfo;
use crate::durability::wal::WalInfo;
use crate::durability::{get_snapshot_files, get_wal_files};
use crate::replication::rpc::{
    DeltaStream, HeartbeatRequest, ReplicationTransport, RpcError, TaskPool,
};
use crate::storage::types::INITIAL_TIMESTAMP;
use crate::storage::Storage;

/// Replica lifecycle as seen from the main instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Up to date; the next transaction opens a stream.
    Ready,
    /// A transaction stream is open and drains toward the replica.
    Replicating,
    /// The replica is behind; a catch-up task is (or will be) running.
    Recovery,
    /// The RPC channel is broken; a reconnect task owns the next step.
    Invalid,
}

/// Observable status of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub name: String,
    pub state: ReplicaState,
    pub mode: ReplicationMode,
}

/// One step of the catch-up plan, ordered shortest-prefix-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecoveryStep {
    Snapshot(PathBuf),
    WalFiles(Vec<PathBuf>),
    CurrentWal { seq_num: u64 },
    FinalSnapshot { timestamp: u64 },
}

/// Per-replica state machine mirroring committed transactions over the
/// transport, with durable-file catch-up when the replica falls behind.
pub struct ReplicationClient {
    /// Weak handle to the `Arc` this client lives in, so `&self` methods
    /// can hand owning handles to worker tasks.
    self_ref: Weak<ReplicationClient>,
    name: String,
    storage: Weak<Storage>,
    transport: Arc<dyn ReplicationTransport>,
    config: ReplicationClientConfig,
    /// Mode the replica was registered with; `mode` below may be demoted.
    configured_mode: ReplicationMode,
    mode: Mutex<ReplicationMode>,
    timeout: Mutex<Option<std::time::Duration>>,
    /// The client lock: every state transition happens under it.
    state: Mutex<ReplicaState>,
    stream: Mutex<Option<Box<dyn DeltaStream>>>,
    pool: TaskPool,
    /// Set when a branching point makes this replica permanently unusable.
    unrecoverable: AtomicBool,
}

impl std::fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ReplicationClient {
    pub(crate) fn new(
        name: &str,
        storage: Weak<Storage>,
        transport: Arc<dyn ReplicationTransport>,
        mode: ReplicationMode,
        config: ReplicationClientConfig,
    ) -> Arc<Self> {
        // Only a sync replica can have an acknowledgement timeout.
        let timeout = match mode {
            ReplicationMode::Sync => config.timeout,
            ReplicationMode::Async => None,
        };
        let client = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            name: name.to_owned(),
            storage,
            transport,
            config,
            configured_mode: mode,
            mode: Mutex::new(mode),
            timeout: Mutex::new(timeout),
            state: Mutex::new(ReplicaState::Invalid),
            stream: Mutex::new(None),
            pool: TaskPool::new(name),
            unrecoverable: AtomicBool::new(false),
        });
        client.try_initialize();
        client
    }

    fn arc(&self) -> Arc<ReplicationClient> {
        self.self_ref
            .upgrade()
            .expect("client self reference is set at construction")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.lock()
    }

    pub fn mode(&self) -> ReplicationMode {
        *self.mode.lock()
    }

    pub fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            name: self.name.clone(),
            state: self.state(),
            mode: self.mode(),
        }
    }

    /// Heartbeat handshake: detect divergent epochs, then either declare the
    /// replica current or start catch-up.
    fn initialize(&self) -> Result<(), RpcError> {
        let Some(storage) = self.storage.upgrade() else {
            return Ok(());
        };
        if self.unrecoverable.load(Ordering::Relaxed) {
            return Ok(());
        }

        let epoch_id = {
            // The epoch id may not be read while the engine mutates it.
            let _engine_guard = storage.engine_lock.lock();
            storage.epoch_id.clone()
        };
        let response = self.transport.heartbeat(HeartbeatRequest {
            main_commit_timestamp: storage.last_commit_timestamp(),
            epoch_id,
        })?;

        let mut branching_point = None;
        if response.epoch_id != storage.epoch_id
            && response.current_commit_timestamp != INITIAL_TIMESTAMP
        {
            match storage
                .epoch_history
                .iter()
                .rev()
                .find(|(epoch, _)| epoch == &response.epoch_id)
            {
                None => branching_point = Some(0),
                Some((_, timestamp)) if *timestamp != response.current_commit_timestamp => {
                    branching_point = Some(*timestamp)
                }
                Some(_) => {}
            }
        }
        if let Some(branching_point) = branching_point {
            error!(
                replica = %self.name,
                branching_point,
                "replica diverged from this instance and cannot be used; start it from a clean data directory"
            );
            self.unrecoverable.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let replica_commit = response.current_commit_timestamp;
        debug!(
            replica = %self.name,
            replica_commit,
            main_commit = storage.last_commit_timestamp(),
            "heartbeat"
        );
        if replica_commit == storage.last_commit_timestamp() {
            *self.state.lock() = ReplicaState::Ready;
        } else {
            *self.state.lock() = ReplicaState::Recovery;
            let this = self.arc();
            self.pool
                .add_task(move || this.recover_replica(replica_commit));
        }
        Ok(())
    }

    pub(crate) fn try_initialize(&self) {
        if let Err(err) = self.initialize() {
            *self.state.lock() = ReplicaState::Invalid;
            error!(replica = %self.name, error = %err, "failed to connect to replica");
        }
    }

    fn handle_rpc_failure(&self) {
        error!(replica = %self.name, "couldn't replicate data to replica");
        let this = self.arc();
        self.pool.add_task(move || {
            this.transport.abort();
            this.try_initialize();
        });
    }

    /// Entry point of per-transaction replication, called under the engine
    /// lock as the commit starts writing its WAL entries.
    pub(crate) fn start_transaction_replication(&self, current_wal_seq_num: u64) {
        let mut state = self.state.lock();
        match *state {
            ReplicaState::Recovery => {
                debug!(replica = %self.name, "replica is behind, catch-up in progress");
            }
            ReplicaState::Replicating => {
                debug!(replica = %self.name, "replica missed a transaction");
                // The previous transaction is still draining. Catch-up is not
                // queued here: the drain may still fail and must drive the
                // client through Invalid first, so only the state is flipped
                // and the finalize (or its error) schedules what comes next.
                *state = ReplicaState::Recovery;
            }
            ReplicaState::Invalid => {
                drop(state);
                self.handle_rpc_failure();
            }
            ReplicaState::Ready => {
                let Some(storage) = self.storage.upgrade() else {
                    return;
                };
                match self.transport.start_append_deltas(
                    storage.last_commit_timestamp(),
                    current_wal_seq_num,
                    storage.epoch_id.clone(),
                ) {
                    Ok(stream) => {
                        *self.stream.lock() = Some(stream);
                        *state = ReplicaState::Replicating;
                    }
                    Err(_) => {
                        *state = ReplicaState::Invalid;
                        drop(state);
                        self.handle_rpc_failure();
                    }
                }
            }
        }
    }

    /// Runs `callback` against the open stream, if one is draining. An RPC
    /// failure demotes the replica to `Invalid` and fires the reconnect.
    pub(crate) fn if_streaming_transaction(
        &self,
        callback: impl FnOnce(&mut dyn DeltaStream) -> Result<(), RpcError>,
    ) {
        if *self.state.lock() != ReplicaState::Replicating {
            return;
        }
        let failed = {
            let mut stream_guard = self.stream.lock();
            match stream_guard.as_mut() {
                Some(stream) => callback(stream.as_mut()).is_err(),
                None => false,
            }
        };
        if failed {
            *self.state.lock() = ReplicaState::Invalid;
            self.handle_rpc_failure();
        }
    }

    /// Awaits the replica acknowledgement according to the replication
    /// mode. A sync replica with a timeout races the acknowledgement
    /// against the timer; losing the race demotes it to async.
    pub(crate) fn finalize_transaction_replication(&self) {
        if *self.state.lock() != ReplicaState::Replicating {
            return;
        }
        let mode = self.mode();
        let timeout = *self.timeout.lock();
        match (mode, timeout) {
            (ReplicationMode::Async, _) => {
                let this = self.arc();
                self.pool.add_task(move || this.finalize_internal());
            }
            (ReplicationMode::Sync, Some(timeout)) => {
                let finished = Arc::new((StdMutex::new(false), Condvar::new()));
                let this = self.arc();
                let task_finished = Arc::clone(&finished);
                self.pool.add_task(move || {
                    this.finalize_internal();
                    let (lock, cvar) = &*task_finished;
                    *lock.lock().expect("finalize flag poisoned") = true;
                    cvar.notify_one();
                });

                let (lock, cvar) = &*finished;
                let guard = lock.lock().expect("finalize flag poisoned");
                let (guard, wait_result) = cvar
                    .wait_timeout_while(guard, timeout, |done| !*done)
                    .expect("finalize flag poisoned");
                if wait_result.timed_out() && !*guard {
                    // Demoted for the rest of this replica's life; a
                    // successful catch-up may restore sync when configured.
                    warn!(
                        replica = %self.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "sync replica timed out, demoting to async"
                    );
                    *self.mode.lock() = ReplicationMode::Async;
                    *self.timeout.lock() = None;
                }
            }
            (ReplicationMode::Sync, None) => self.finalize_internal(),
        }
    }

    fn finalize_internal(&self) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };
        match stream.finalize() {
            Ok(response) => {
                let mut state = self.state.lock();
                if !response.success || *state == ReplicaState::Recovery {
                    *state = ReplicaState::Recovery;
                    drop(state);
                    let this = self.arc();
                    let replica_commit = response.current_commit_timestamp;
                    self.pool
                        .add_task(move || this.recover_replica(replica_commit));
                } else {
                    *state = ReplicaState::Ready;
                }
            }
            Err(_) => {
                *self.state.lock() = ReplicaState::Invalid;
                self.handle_rpc_failure();
            }
        }
    }

    /// Catch-up loop: plan the shortest sufficient durability prefix, run
    /// each step, and repeat until the replica reports the main's commit
    /// timestamp. Files referenced by the plan are pinned for its duration.
    fn recover_replica(&self, mut replica_commit: u64) {
        let Some(storage) = self.storage.upgrade() else {
            return;
        };
        loop {
            let mut locker = storage.file_retainer.add_locker();
            let steps = match self.get_recovery_steps(&storage, replica_commit, &mut locker) {
                Ok(steps) => steps,
                Err(err) => {
                    // Not an RPC failure: reconnecting cannot help, so no
                    // reconnect task is fired. The next commit retries.
                    warn!(replica = %self.name, error = %err, "catch-up planning failed");
                    *self.state.lock() = ReplicaState::Invalid;
                    return;
                }
            };

            for step in steps {
                let step_result: Result<(), RpcError> = match step {
                    RecoveryStep::Snapshot(path) => {
                        debug!(replica = %self.name, path = %path.display(), "sending snapshot");
                        self.transport.transfer_snapshot(&path).map(|response| {
                            replica_commit = response.current_commit_timestamp;
                        })
                    }
                    RecoveryStep::WalFiles(paths) => {
                        debug!(replica = %self.name, count = paths.len(), "sending WAL files");
                        self.transport.transfer_wal_files(&paths).map(|response| {
                            replica_commit = response.current_commit_timestamp;
                        })
                    }
                    RecoveryStep::CurrentWal { seq_num } => {
                        self.replicate_current_wal(&storage, seq_num, &mut replica_commit)
                    }
                    RecoveryStep::FinalSnapshot { timestamp } => {
                        debug!(replica = %self.name, timestamp, "snapshot timestamp is the latest");
                        self.transport
                            .transfer_only_snapshot(timestamp, storage.epoch_id.clone())
                            .map(|response| {
                                if response.success {
                                    replica_commit = response.current_commit_timestamp;
                                }
                            })
                    }
                };
                if step_result.is_err() {
                    *self.state.lock() = ReplicaState::Invalid;
                    self.handle_rpc_failure();
                    return;
                }
            }

            // Comparing under the client lock closes the race where another
            // thread commits between the timestamp check and the transition
            // to Ready; that commit would find Ready and stream normally.
            let mut state = self.state.lock();
            if storage.last_commit_timestamp() == replica_commit {
                *state = ReplicaState::Ready;
                if self.config.restore_sync_on_recovery
                    && self.configured_mode == ReplicationMode::Sync
                {
                    *self.mode.lock() = ReplicationMode::Sync;
                    *self.timeout.lock() = self.config.timeout;
                }
                debug!(replica = %self.name, replica_commit, "replica caught up");
                return;
            }
            drop(state);
        }
    }

    /// Ships the segment currently being written: flushing is frozen, the
    /// on-disk bytes and the pending buffer are captured, and flushing
    /// resumes after the transfer.
    fn replicate_current_wal(
        &self,
        storage: &Arc<Storage>,
        expected_seq_num: u64,
        replica_commit: &mut u64,
    ) -> Result<(), RpcError> {
        let captured = {
            let _engine_guard = storage.engine_lock.lock();
            let mut wal_guard = storage.wal_file.lock();
            match wal_guard.as_mut() {
                // Only the segment observed at plan time is shipped; a
                // rolled-over WAL is picked up by the next planning round.
                Some(wal) if wal.sequence_number() == expected_seq_num => {
                    wal.disable_flushing();
                    let filename = wal
                        .path()
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or_default()
                        .to_owned();
                    match std::fs::read(wal.path()) {
                        Ok(file_bytes) => {
                            let buffer_bytes = wal.current_buffer().to_vec();
                            Some((filename, file_bytes, buffer_bytes))
                        }
                        Err(err) => {
                            // Flushing must never stay frozen on an error.
                            let _ = wal.enable_flushing();
                            return Err(RpcError(format!("current WAL read failed: {err}")));
                        }
                    }
                }
                _ => None,
            }
        };

        let Some((filename, file_bytes, buffer_bytes)) = captured else {
            return Ok(());
        };
        debug!(replica = %self.name, filename = %filename, "sending current WAL file");
        let total_size = (file_bytes.len() + buffer_bytes.len()) as u64;
        let result = self
            .transport
            .transfer_current_wal(&filename, total_size, &file_bytes, &buffer_bytes);

        {
            let mut wal_guard = storage.wal_file.lock();
            if let Some(wal) = wal_guard.as_mut() {
                if wal.sequence_number() == expected_seq_num {
                    if let Err(err) = wal.enable_flushing() {
                        warn!(error = %err, "re-enabling WAL flushing failed");
                    }
                }
            }
        }

        result.map(|response| {
            *replica_commit = response.current_commit_timestamp;
        })
    }

    fn get_recovery_steps(
        &self,
        storage: &Arc<Storage>,
        replica_commit: u64,
        locker: &mut FileLocker,
    ) -> crate::error::Result<Vec<RecoveryStep>> {
        let Some(durability) = storage.config.durability.as_ref() else {
            return Err(crate::error::UmbraError::Replication(
                "replica catch-up requires durability to be configured".into(),
            ));
        };
        // Also forces the transaction the replica missed to finish its WAL
        // entries before the file listing happens.
        let current_wal_seq_num = {
            let _engine_guard = storage.engine_lock.lock();
            storage.current_wal_seq_num()
        };
        let wal_files = get_wal_files(
            &durability.wal_directory,
            Some(&storage.uuid),
            current_wal_seq_num,
        )?;
        let snapshot_files =
            get_snapshot_files(&durability.snapshot_directory, Some(&storage.uuid))?;
        compute_recovery_steps(
            replica_commit,
            &wal_files,
            snapshot_files.last(),
            current_wal_seq_num,
            locker,
        )
    }
}

/// Plans the catch-up for a replica at `replica_commit`, preferring the
/// longest chain of sequential finalized WALs ending at the newest one, and
/// falling back to the latest snapshot plus every WAL past it. The segment
/// currently being written is appended as its own step; when nothing else
/// exists, only the snapshot timestamp is sent.
pub(crate) fn compute_recovery_steps(
    replica_commit: u64,
    wal_files: &[WalInfo],
    latest_snapshot: Option<&SnapshotInfo>,
    current_wal_seq_num: Option<u64>,
    locker: &mut FileLocker,
) -> crate::error::Result<Vec<RecoveryStep>> {
    let mut steps = Vec::new();

    // No finalized WALs: the difference lives in the current WAL, or the
    // snapshot already carries the latest timestamp.
    let Some(newest) = wal_files.last() else {
        match current_wal_seq_num {
            Some(seq_num) => steps.push(RecoveryStep::CurrentWal { seq_num }),
            None => {
                let snapshot = require_snapshot(latest_snapshot)?;
                locker.add_file(snapshot.path.clone());
                steps.push(RecoveryStep::FinalSnapshot {
                    timestamp: snapshot.start_timestamp,
                });
            }
        }
        return Ok(steps);
    };

    // Every finalized WAL is already on the replica.
    if newest.to_timestamp <= replica_commit {
        match current_wal_seq_num {
            Some(seq_num) => steps.push(RecoveryStep::CurrentWal { seq_num }),
            None => {
                let snapshot = require_snapshot(latest_snapshot)?;
                locker.add_file(snapshot.path.clone());
                steps.push(RecoveryStep::FinalSnapshot {
                    timestamp: snapshot.start_timestamp,
                });
            }
        }
        return Ok(steps);
    }

    // Longest chain of sequential WALs ending at the newest one that still
    // reaches back to the replica's commit.
    let mut previous_seq_num = newest.seq_num;
    for (index, info) in wal_files.iter().enumerate().rev() {
        if previous_seq_num - info.seq_num > 1 {
            // Gap in the chain; the replica is too far behind for WAL-only
            // recovery.
            break;
        }
        if replica_commit >= info.from_timestamp || info.seq_num == 0 {
            // Skip a WAL the replica fully contains.
            let start = if replica_commit >= info.to_timestamp {
                index + 1
            } else {
                index
            };
            let mut chain = Vec::new();
            for covered in &wal_files[start..] {
                locker.add_file(covered.path.clone());
                chain.push(covered.path.clone());
            }
            if !chain.is_empty() {
                steps.push(RecoveryStep::WalFiles(chain));
            }
            if let Some(seq_num) = current_wal_seq_num {
                steps.push(RecoveryStep::CurrentWal { seq_num });
            }
            return Ok(steps);
        }
        previous_seq_num = info.seq_num;
    }

    // No chain: latest snapshot plus every WAL that extends past it.
    let snapshot = require_snapshot(latest_snapshot)?;
    locker.add_file(snapshot.path.clone());
    steps.push(RecoveryStep::Snapshot(snapshot.path.clone()));

    let mut first_needed = None;
    for (index, info) in wal_files.iter().enumerate() {
        if snapshot.start_timestamp < info.to_timestamp {
            // The previous WAL may still hold the boundary transaction.
            first_needed = Some(if snapshot.start_timestamp < info.from_timestamp && index > 0 {
                index - 1
            } else {
                index
            });
            break;
        }
    }
    let mut chain = Vec::new();
    if let Some(start) = first_needed {
        for info in &wal_files[start..] {
            locker.add_file(info.path.clone());
            chain.push(info.path.clone());
        }
    }
    if chain.is_empty() {
        // Only WALs from before the snapshot exist; ship the newest so the
        // replica can align its timestamp.
        locker.add_file(newest.path.clone());
        chain.push(newest.path.clone());
    }
    steps.push(RecoveryStep::WalFiles(chain));
    if let Some(seq_num) = current_wal_seq_num {
        steps.push(RecoveryStep::CurrentWal { seq_num });
    }
    Ok(steps)
}

fn require_snapshot<'a>(
    snapshot: Option<&'a SnapshotInfo>,
) -> crate::error::Result<&'a SnapshotInfo> {
    snapshot.ok_or_else(|| {
        crate::error::UmbraError::Replication(
            "invalid durability state: no snapshot available for catch-up".into(),
        )
    })
}
