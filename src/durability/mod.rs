pub mod encoder;
pub mod file_retainer;
pub mod recovery;
pub mod snapshot;
pub mod wal;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::DurabilityConfig;
use crate::error::{Result, UmbraError};
use crate::replication::client::ReplicationClient;
use crate::storage::delta::{DeltaAction, PreviousRef};
use crate::storage::property_value::PropertyValue;
use crate::storage::transaction::Transaction;
use crate::storage::Storage;

use self::snapshot::SnapshotInfo;
use self::wal::{WalEntry, WalFile, WalInfo, WalOp};

impl Storage {
    /// Translates the transaction's undo deltas into redo WAL entries.
    ///
    /// Each delta names the change to revert, so the redo record is the
    /// mirror image: a `DeleteObject` undo means the transaction created
    /// the object, a `RemoveLabel` undo means it added the label, and a
    /// property undo is paired with the value currently on the object.
    /// In-edge deltas are skipped; the out-edge delta of the opposite
    /// endpoint already encodes the edge.
    pub(crate) fn translate_deltas(&self, tx: &Transaction, final_ts: u64) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for delta_id in tx.delta_ids() {
            let Some(delta) = self.deltas.get(delta_id) else {
                continue;
            };
            let Some(owner) = self.deltas.find_owner(&delta) else {
                return Err(UmbraError::Corruption("delta chain lost its owner"));
            };
            let op = match owner {
                PreviousRef::Vertex(gid) => match &delta.action {
                    DeltaAction::DeleteObject => Some(WalOp::CreateVertex { gid }),
                    DeltaAction::RecreateObject => Some(WalOp::DeleteVertex { gid }),
                    DeltaAction::RemoveLabel(label) => Some(WalOp::AddLabel {
                        gid,
                        label: self.resolve_name(label.0)?,
                    }),
                    DeltaAction::AddLabel(label) => Some(WalOp::RemoveLabel {
                        gid,
                        label: self.resolve_name(label.0)?,
                    }),
                    DeltaAction::SetProperty { key, .. } => {
                        let value = self
                            .vertex(gid)
                            .and_then(|vertex| vertex.data.lock().properties.get(key).cloned())
                            .unwrap_or(PropertyValue::Null);
                        Some(WalOp::SetVertexProperty {
                            gid,
                            property: self.resolve_name(key.0)?,
                            value,
                        })
                    }
                    DeltaAction::RemoveOutEdge(link) => Some(WalOp::CreateEdge {
                        gid: link.edge,
                        edge_type: self.resolve_name(link.edge_type.0)?,
                        from_vertex: gid,
                        to_vertex: link.vertex,
                    }),
                    DeltaAction::AddOutEdge(link) => Some(WalOp::DeleteEdge {
                        gid: link.edge,
                        edge_type: self.resolve_name(link.edge_type.0)?,
                        from_vertex: gid,
                        to_vertex: link.vertex,
                    }),
                    DeltaAction::AddInEdge(_) | DeltaAction::RemoveInEdge(_) => None,
                },
                PreviousRef::Edge(gid) => match &delta.action {
                    DeltaAction::SetProperty { key, .. } => {
                        let value = self
                            .edge(gid)
                            .and_then(|edge| edge.data.lock().properties.get(key).cloned())
                            .unwrap_or(PropertyValue::Null);
                        Some(WalOp::SetEdgeProperty {
                            gid,
                            property: self.resolve_name(key.0)?,
                            value,
                        })
                    }
                    // Edge creation and deletion are encoded from the
                    // endpoint's adjacency deltas.
                    _ => None,
                },
                PreviousRef::Delta(_) => None,
            };
            if let Some(op) = op {
                entries.push(WalEntry {
                    timestamp: final_ts,
                    transaction_id: tx.id,
                    op,
                });
            }
        }
        entries.push(WalEntry {
            timestamp: final_ts,
            transaction_id: tx.id,
            op: WalOp::TransactionEnd,
        });
        Ok(entries)
    }

    fn resolve_name(&self, id: u32) -> Result<String> {
        self.dict
            .resolve(id)
            .ok_or(UmbraError::Corruption("name id missing from dictionary"))
    }

    /// Appends the committed transaction to the current WAL segment and
    /// streams it to every registered replica. Caller holds the engine lock.
    pub(crate) fn append_to_wal(&self, tx: &Transaction, final_ts: u64) -> Result<()> {
        let entries = self.translate_deltas(tx, final_ts)?;
        self.stream_entries(&entries)
    }

    /// Shared append path for transactions and global operations.
    fn stream_entries(&self, entries: &[WalEntry]) -> Result<()> {
        let clients: Vec<Arc<ReplicationClient>> =
            self.replication_clients.read().iter().cloned().collect();
        match &self.config.durability {
            Some(durability) => {
                let mut wal_guard = self.wal_file.lock();
                if wal_guard.is_none() {
                    let seq_num = self.wal_seq_num.fetch_add(1, Ordering::SeqCst);
                    *wal_guard = Some(WalFile::create(
                        &durability.wal_directory,
                        &self.uuid,
                        &self.epoch_id,
                        seq_num,
                    )?);
                }
                let wal = wal_guard.as_mut().expect("created above");
                let seq_num = wal.sequence_number();
                for client in &clients {
                    client.start_transaction_replication(seq_num);
                }
                for entry in entries {
                    wal.append_entry(entry);
                    for client in &clients {
                        client.if_streaming_transaction(|stream| stream.append(entry));
                    }
                }
                wal.finish_transaction(durability.wal_file_flush_every_n_tx)?;
                if wal.is_flushing_enabled() && wal.size() >= durability.wal_file_size_kib * 1024 {
                    let finished = wal_guard.take().expect("present above");
                    let path = finished.finalize()?;
                    debug!(path = %path.display(), seq_num, "WAL segment finalized");
                }
            }
            None => {
                for client in &clients {
                    client.start_transaction_replication(0);
                }
                for entry in entries {
                    for client in &clients {
                        client.if_streaming_transaction(|stream| stream.append(entry));
                    }
                }
            }
        }
        Ok(())
    }

    /// Logs and replicates a global operation (index create/drop) under its
    /// own commit timestamp.
    pub(crate) fn log_global_operation(&self, op: WalOp) -> Result<()> {
        {
            let _guard = self.engine_lock.lock();
            let timestamp = self.last_commit_timestamp.load(Ordering::SeqCst) + 1;
            let entry = WalEntry {
                timestamp,
                transaction_id: 0,
                op,
            };
            self.stream_entries(std::slice::from_ref(&entry))?;
            self.last_commit_timestamp.store(timestamp, Ordering::SeqCst);
        }
        let clients: Vec<Arc<ReplicationClient>> =
            self.replication_clients.read().iter().cloned().collect();
        for client in clients {
            client.finalize_transaction_replication();
        }
        Ok(())
    }

    /// Sequence number of the WAL segment currently accepting appends.
    pub(crate) fn current_wal_seq_num(&self) -> Option<u64> {
        self.wal_file.lock().as_ref().map(WalFile::sequence_number)
    }

    /// Writes a snapshot of the current committed state and prunes old
    /// snapshots past the retention count.
    pub fn create_snapshot(&self) -> Result<PathBuf> {
        let Some(durability) = self.config.durability.clone() else {
            return Err(UmbraError::InvalidArgument(
                "durability is not configured".into(),
            ));
        };
        let accessor = self.access();
        let path = snapshot::create_snapshot_file(&accessor, &durability.snapshot_directory)?;
        drop(accessor);
        info!(path = %path.display(), "snapshot created");
        self.clean_old_snapshots(&durability)?;
        Ok(path)
    }

    fn clean_old_snapshots(&self, durability: &DurabilityConfig) -> Result<()> {
        let mut snapshots = get_snapshot_files(&durability.snapshot_directory, Some(&self.uuid))?;
        while snapshots.len() > durability.snapshot_retention_count {
            let oldest = snapshots.remove(0);
            self.file_retainer.delete_or_defer(&oldest.path);
        }
        Ok(())
    }
}

/// Snapshots in a directory, sorted by start timestamp.
pub(crate) fn get_snapshot_files(
    directory: &Path,
    uuid: Option<&str>,
) -> Result<Vec<SnapshotInfo>> {
    let mut infos = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("snapshot") {
            continue;
        }
        match SnapshotInfo::read(&path) {
            Ok(info) => {
                if uuid.map_or(true, |uuid| info.uuid == uuid) {
                    infos.push(info);
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "unreadable snapshot skipped"),
        }
    }
    infos.sort_by_key(|info| info.start_timestamp);
    Ok(infos)
}

/// Finalized WAL segments in a directory, sorted by sequence number. The
/// segment currently being written is excluded via `exclude_seq`.
pub(crate) fn get_wal_files(
    directory: &Path,
    uuid: Option<&str>,
    exclude_seq: Option<u64>,
) -> Result<Vec<WalInfo>> {
    let mut infos = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("wal") {
            continue;
        }
        match WalInfo::read(&path) {
            Ok(info) => {
                if info.num_entries == 0 {
                    continue;
                }
                if uuid.map_or(true, |uuid| info.uuid == uuid)
                    && exclude_seq.map_or(true, |seq| info.seq_num != seq)
                {
                    infos.push(info);
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "unreadable WAL skipped"),
        }
    }
    infos.sort_by_key(|info| info.seq_num);
    Ok(infos)
}
