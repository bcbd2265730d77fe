pub mod delta;
pub mod dict;
pub mod edge;
pub mod gc;
pub mod indices;
pub mod mvcc;
pub mod property_value;
pub mod transaction;
pub mod types;
pub mod vertex;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{Config, GcType};
use crate::durability::file_retainer::FileRetainer;
use crate::durability::wal::WalFile;
use crate::error::{Result, UmbraError};
use crate::replication::client::ReplicationClient;

use self::delta::{Delta, DeltaAction, DeltaId, DeltaStore, EdgeLink, PreviousPtr, PreviousRef};
use self::dict::NameDict;
use self::edge::Edge;
use self::indices::Indices;
use self::mvcc::UndoTarget;
use self::property_value::PropertyValue;
use self::transaction::{Transaction, TxState};
use self::types::{EdgeTypeId, Gid, LabelId, PropertyId, View, INITIAL_TIMESTAMP, TRANSACTION_INITIAL_ID};
use self::vertex::Vertex;

/// A transaction whose deltas await garbage collection, queued in commit
/// order.
#[derive(Debug)]
pub(crate) struct CommittedTransaction {
    pub(crate) commit_timestamp: u64,
    pub(crate) deltas: Vec<DeltaId>,
}

/// The storage instance: owner of all vertices, edges, version chains, the
/// name dictionary, the indexes, the durability pipeline, and the
/// replication clients.
///
/// All coordination state (`last_commit_timestamp`, epoch id, active
/// transaction set) is instance-scoped; two instances in one process do not
/// interfere.
pub struct Storage {
    /// Weak handle to the `Arc` this instance lives in, set at open time;
    /// lets `&self` methods hand out owning handles (accessors, background
    /// threads, replication clients).
    self_ref: Weak<Storage>,
    pub(crate) config: Config,
    pub(crate) uuid: String,
    pub(crate) epoch_id: String,
    /// Past epochs and the last commit timestamp each one reached.
    pub(crate) epoch_history: Vec<(String, u64)>,

    pub(crate) vertices: RwLock<BTreeMap<Gid, Arc<Vertex>>>,
    pub(crate) edges: RwLock<BTreeMap<Gid, Arc<Edge>>>,
    pub(crate) deltas: DeltaStore,
    pub(crate) dict: NameDict,
    pub(crate) indices: Indices,

    /// Short critical section serializing commit-timestamp allocation,
    /// epoch reads, and WAL sequencing decisions.
    pub(crate) engine_lock: Mutex<()>,
    pub(crate) next_transaction_id: AtomicU64,
    pub(crate) next_vertex_gid: AtomicU64,
    pub(crate) next_edge_gid: AtomicU64,
    pub(crate) last_commit_timestamp: AtomicU64,

    /// Active transaction id → start timestamp. The minimum start timestamp
    /// is the GC watermark.
    pub(crate) active_transactions: Mutex<BTreeMap<u64, u64>>,
    pub(crate) committed_transactions: Mutex<VecDeque<CommittedTransaction>>,
    /// Unlinked deltas waiting until no reader can still hold a handle;
    /// tagged with the timestamp at which they became unreachable.
    pub(crate) garbage_deltas: Mutex<VecDeque<(u64, Vec<DeltaId>)>>,

    pub(crate) wal_file: Mutex<Option<WalFile>>,
    pub(crate) wal_seq_num: AtomicU64,
    pub(crate) file_retainer: Arc<FileRetainer>,

    pub(crate) replication_clients: RwLock<Vec<Arc<ReplicationClient>>>,

    gc_stop: Mutex<Option<mpsc::Sender<()>>>,
    _gc_thread: Mutex<Option<JoinHandle<()>>>,
    snapshot_stop: Mutex<Option<mpsc::Sender<()>>>,
    _snapshot_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("uuid", &self.uuid)
            .field("epoch_id", &self.epoch_id)
            .finish()
    }
}

impl Storage {
    /// Opens a storage instance, recovering from the durability directories
    /// when configured, and starts the background threads.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let mut storage = Self {
            self_ref: Weak::new(),
            config: config.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            epoch_id: uuid::Uuid::new_v4().to_string(),
            epoch_history: Vec::new(),
            vertices: RwLock::new(BTreeMap::new()),
            edges: RwLock::new(BTreeMap::new()),
            deltas: DeltaStore::new(),
            dict: NameDict::new(),
            indices: Indices::new(),
            engine_lock: Mutex::new(()),
            next_transaction_id: AtomicU64::new(TRANSACTION_INITIAL_ID),
            next_vertex_gid: AtomicU64::new(0),
            next_edge_gid: AtomicU64::new(0),
            last_commit_timestamp: AtomicU64::new(INITIAL_TIMESTAMP),
            active_transactions: Mutex::new(BTreeMap::new()),
            committed_transactions: Mutex::new(VecDeque::new()),
            garbage_deltas: Mutex::new(VecDeque::new()),
            wal_file: Mutex::new(None),
            wal_seq_num: AtomicU64::new(0),
            file_retainer: Arc::new(FileRetainer::new()),
            replication_clients: RwLock::new(Vec::new()),
            gc_stop: Mutex::new(None),
            _gc_thread: Mutex::new(None),
            snapshot_stop: Mutex::new(None),
            _snapshot_thread: Mutex::new(None),
        };

        if let Some(durability) = &config.durability {
            std::fs::create_dir_all(&durability.snapshot_directory)?;
            std::fs::create_dir_all(&durability.wal_directory)?;
            if durability.recover_on_startup {
                crate::durability::recovery::recover_data(&mut storage)?;
            }
        }

        let storage = Arc::new_cyclic(|weak| {
            storage.self_ref = weak.clone();
            storage
        });
        storage.start_background_threads();
        Ok(storage)
    }

    pub(crate) fn arc(&self) -> Arc<Storage> {
        self.self_ref
            .upgrade()
            .expect("storage self reference is set at open")
    }

    pub(crate) fn self_weak(&self) -> Weak<Storage> {
        self.self_ref.clone()
    }

    fn start_background_threads(&self) {
        if self.config.gc.gc_type == GcType::Periodic {
            let interval = self.config.gc.interval;
            let weak = self.self_ref.clone();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let handle = std::thread::spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let Some(storage) = weak.upgrade() else { break };
                        storage.collect_garbage();
                    }
                    _ => break,
                }
            });
            *self.gc_stop.lock() = Some(stop_tx);
            *self._gc_thread.lock() = Some(handle);
        }

        if let Some(durability) = &self.config.durability {
            if let Some(interval) = durability.snapshot_interval {
                let weak = self.self_ref.clone();
                let (stop_tx, stop_rx) = mpsc::channel::<()>();
                let handle = std::thread::spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let Some(storage) = weak.upgrade() else { break };
                            if let Err(err) = storage.create_snapshot() {
                                tracing::warn!(error = %err, "periodic snapshot failed");
                            }
                        }
                        _ => break,
                    }
                });
                *self.snapshot_stop.lock() = Some(stop_tx);
                *self._snapshot_thread.lock() = Some(handle);
            }
        }
    }

    /// Opens a per-transaction accessor.
    pub fn access(&self) -> Accessor {
        let _guard = self.engine_lock.lock();
        let id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        let start_timestamp = self.last_commit_timestamp.load(Ordering::SeqCst);
        self.active_transactions.lock().insert(id, start_timestamp);
        debug!(tx_id = id, start_timestamp, "transaction started");
        Accessor {
            storage: self.arc(),
            transaction: Transaction::new(id, start_timestamp),
        }
    }

    pub fn last_commit_timestamp(&self) -> u64 {
        self.last_commit_timestamp.load(Ordering::SeqCst)
    }

    /// GC watermark: minimum start timestamp across active transactions, or
    /// one past the newest commit when nothing is active.
    pub(crate) fn oldest_active_start_timestamp(&self) -> Option<u64> {
        self.active_transactions.lock().values().min().copied()
    }

    pub(crate) fn vertex(&self, gid: Gid) -> Option<Arc<Vertex>> {
        self.vertices.read().get(&gid).cloned()
    }

    pub(crate) fn edge(&self, gid: Gid) -> Option<Arc<Edge>> {
        self.edges.read().get(&gid).cloned()
    }

    /// Interns `name` and returns its label id.
    pub fn name_to_label(&self, name: &str) -> LabelId {
        LabelId(self.dict.intern(name))
    }

    pub fn name_to_property(&self, name: &str) -> PropertyId {
        PropertyId(self.dict.intern(name))
    }

    pub fn name_to_edge_type(&self, name: &str) -> EdgeTypeId {
        EdgeTypeId(self.dict.intern(name))
    }

    pub fn label_name(&self, label: LabelId) -> Option<String> {
        self.dict.resolve(label.0)
    }

    pub fn property_name(&self, property: PropertyId) -> Option<String> {
        self.dict.resolve(property.0)
    }

    pub fn edge_type_name(&self, edge_type: EdgeTypeId) -> Option<String> {
        self.dict.resolve(edge_type.0)
    }

    /// Creates a new delta, links it as the chain head of `vertex`, and
    /// records it in the transaction. The caller must hold the vertex data
    /// lock.
    pub(crate) fn create_and_link_delta_on_vertex(
        &self,
        tx: &Transaction,
        vertex: &Vertex,
        action: DeltaAction,
    ) -> Arc<Delta> {
        let delta = self
            .deltas
            .create(action, Arc::clone(&tx.commit_timestamp), tx.command_id());
        let old_head = vertex.load_head();
        delta.store_next(old_head);
        delta.store_prev(PreviousPtr::vertex(vertex.gid));
        if let Some(old) = self.deltas.get(old_head) {
            old.store_prev(PreviousPtr::delta(delta.id));
        }
        vertex.store_head(delta.id);
        tx.push_delta(delta.id);
        delta
    }

    /// Same as [`Self::create_and_link_delta_on_vertex`], for edge chains.
    pub(crate) fn create_and_link_delta_on_edge(
        &self,
        tx: &Transaction,
        edge: &Edge,
        action: DeltaAction,
    ) -> Arc<Delta> {
        let delta = self
            .deltas
            .create(action, Arc::clone(&tx.commit_timestamp), tx.command_id());
        let old_head = edge.load_head();
        delta.store_next(old_head);
        delta.store_prev(PreviousPtr::edge(edge.gid));
        if let Some(old) = self.deltas.get(old_head) {
            old.store_prev(PreviousPtr::delta(delta.id));
        }
        edge.store_head(delta.id);
        tx.push_delta(delta.id);
        delta
    }

    /// Registers a label index and backfills it from the current vertices.
    /// The operation is durably logged and replicated like a transaction.
    pub fn create_label_index(&self, name: &str) -> Result<bool> {
        let label = self.name_to_label(name);
        if !self.indices.create_label_index(label) {
            return Ok(false);
        }
        let vertices: Vec<Arc<Vertex>> = self.vertices.read().values().cloned().collect();
        for vertex in vertices {
            let data = vertex.data.lock().clone();
            if !data.deleted && data.labels.contains(&label) {
                self.indices.update_on_add_label(label, vertex.gid, &data);
            }
        }
        self.log_global_operation(crate::durability::wal::WalOp::LabelIndexCreate {
            label: name.to_owned(),
        })?;
        Ok(true)
    }

    pub fn drop_label_index(&self, name: &str) -> Result<bool> {
        let label = self.name_to_label(name);
        if !self.indices.drop_label_index(label) {
            return Ok(false);
        }
        self.log_global_operation(crate::durability::wal::WalOp::LabelIndexDrop {
            label: name.to_owned(),
        })?;
        Ok(true)
    }

    pub fn create_label_property_index(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let label = self.name_to_label(label_name);
        let property = self.name_to_property(property_name);
        if !self.indices.create_label_property_index(label, property) {
            return Ok(false);
        }
        let vertices: Vec<Arc<Vertex>> = self.vertices.read().values().cloned().collect();
        for vertex in vertices {
            let data = vertex.data.lock().clone();
            if !data.deleted
                && data.labels.contains(&label)
                && data.properties.contains_key(&property)
            {
                self.indices
                    .update_on_set_property(property, vertex.gid, &data);
            }
        }
        self.log_global_operation(crate::durability::wal::WalOp::LabelPropertyIndexCreate {
            label: label_name.to_owned(),
            property: property_name.to_owned(),
        })?;
        Ok(true)
    }

    pub fn drop_label_property_index(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let label = self.name_to_label(label_name);
        let property = self.name_to_property(property_name);
        if !self.indices.drop_label_property_index(label, property) {
            return Ok(false);
        }
        self.log_global_operation(crate::durability::wal::WalOp::LabelPropertyIndexDrop {
            label: label_name.to_owned(),
            property: property_name.to_owned(),
        })?;
        Ok(true)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // Disconnect the background threads; they exit on their own.
        self.gc_stop.lock().take();
        self.snapshot_stop.lock().take();
        if let Some(wal) = self.wal_file.lock().as_mut() {
            let _ = wal.flush_to_disk();
        }
    }
}

/// Per-transaction handle exposing all reads and writes.
///
/// Dropping an accessor without committing aborts the transaction.
pub struct Accessor {
    pub(crate) storage: Arc<Storage>,
    pub(crate) transaction: Transaction,
}

impl Accessor {
    pub fn transaction_id(&self) -> u64 {
        self.transaction.id
    }

    pub fn start_timestamp(&self) -> u64 {
        self.transaction.start_timestamp
    }

    /// Makes the writes of earlier commands visible to subsequent reads of
    /// this transaction.
    pub fn advance_command(&self) {
        self.transaction.advance_command();
    }

    /// Creates a vertex. The undo record is "the object never existed".
    pub fn create_vertex(&self) -> VertexAccessor<'_> {
        let gid = Gid::from_u64(self.storage.next_vertex_gid.fetch_add(1, Ordering::SeqCst));
        let vertex = Arc::new(Vertex::new(gid));
        {
            let _guard = vertex.data.lock();
            self.storage.create_and_link_delta_on_vertex(
                &self.transaction,
                &vertex,
                DeltaAction::DeleteObject,
            );
        }
        self.storage
            .vertices
            .write()
            .insert(gid, Arc::clone(&vertex));
        VertexAccessor {
            vertex,
            accessor: self,
        }
    }

    /// Looks a vertex up by gid under the requested view.
    pub fn find_vertex(&self, gid: Gid, view: View) -> Option<VertexAccessor<'_>> {
        let vertex = self.storage.vertex(gid)?;
        let state = mvcc::vertex_state(&self.storage.deltas, &vertex, &self.transaction, view);
        if state.deleted {
            return None;
        }
        Some(VertexAccessor {
            vertex,
            accessor: self,
        })
    }

    /// All vertices visible under `view`.
    pub fn vertices(&self, view: View) -> Vec<VertexAccessor<'_>> {
        let all: Vec<Arc<Vertex>> = self.storage.vertices.read().values().cloned().collect();
        all.into_iter()
            .filter(|vertex| {
                !mvcc::vertex_state(&self.storage.deltas, vertex, &self.transaction, view).deleted
            })
            .map(|vertex| VertexAccessor {
                vertex,
                accessor: self,
            })
            .collect()
    }

    /// Label index scan; candidates are re-validated against the snapshot.
    pub fn vertices_by_label(&self, label: LabelId, view: View) -> Vec<VertexAccessor<'_>> {
        self.storage
            .indices
            .label_entries(label)
            .into_iter()
            .filter_map(|gid| {
                let vertex = self.storage.vertex(gid)?;
                let state =
                    mvcc::vertex_state(&self.storage.deltas, &vertex, &self.transaction, view);
                (!state.deleted && state.labels.contains(&label)).then_some(VertexAccessor {
                    vertex,
                    accessor: self,
                })
            })
            .collect()
    }

    /// Label+property index scan, optionally constrained to an exact value.
    pub fn vertices_by_label_property(
        &self,
        label: LabelId,
        property: PropertyId,
        value: Option<&PropertyValue>,
        view: View,
    ) -> Vec<VertexAccessor<'_>> {
        self.storage
            .indices
            .label_property_entries(label, property)
            .into_iter()
            .filter_map(|gid| {
                let vertex = self.storage.vertex(gid)?;
                let state =
                    mvcc::vertex_state(&self.storage.deltas, &vertex, &self.transaction, view);
                if state.deleted || !state.labels.contains(&label) {
                    return None;
                }
                let stored = state.properties.get(&property)?;
                if let Some(expected) = value {
                    if stored != expected {
                        return None;
                    }
                }
                Some(VertexAccessor {
                    vertex,
                    accessor: self,
                })
            })
            .collect()
    }

    /// Deletes a vertex that has no adjacent edges.
    pub fn delete_vertex(&self, vertex: &VertexAccessor<'_>) -> Result<bool> {
        let target = Arc::clone(&vertex.vertex);
        let mut data = target.data.lock();
        if !mvcc::prepare_for_write(&self.storage.deltas, target.load_head(), &self.transaction) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Ok(false);
        }
        if !data.in_edges.is_empty() || !data.out_edges.is_empty() {
            return Err(UmbraError::VertexHasEdges);
        }
        self.storage.create_and_link_delta_on_vertex(
            &self.transaction,
            &target,
            DeltaAction::RecreateObject,
        );
        data.deleted = true;
        Ok(true)
    }

    /// Deletes a vertex together with every adjacent edge.
    pub fn detach_delete_vertex(&self, vertex: &VertexAccessor<'_>) -> Result<bool> {
        let target = Arc::clone(&vertex.vertex);
        let (in_links, out_links) = {
            let data = target.data.lock();
            if !mvcc::prepare_for_write(&self.storage.deltas, target.load_head(), &self.transaction)
            {
                return Err(UmbraError::Serialization);
            }
            if data.deleted {
                return Ok(false);
            }
            (data.in_edges.clone(), data.out_edges.clone())
        };

        for link in out_links {
            self.delete_edge_by_gid(link.edge)?;
        }
        for link in in_links {
            self.delete_edge_by_gid(link.edge)?;
        }

        let mut data = target.data.lock();
        if !mvcc::prepare_for_write(&self.storage.deltas, target.load_head(), &self.transaction) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Ok(false);
        }
        self.storage.create_and_link_delta_on_vertex(
            &self.transaction,
            &target,
            DeltaAction::RecreateObject,
        );
        data.deleted = true;
        Ok(true)
    }

    /// Creates an edge between two visible vertices.
    pub fn create_edge(
        &self,
        from: &VertexAccessor<'_>,
        to: &VertexAccessor<'_>,
        edge_type: EdgeTypeId,
    ) -> Result<EdgeAccessor<'_>> {
        let gid = Gid::from_u64(self.storage.next_edge_gid.fetch_add(1, Ordering::SeqCst));
        let edge = Arc::new(Edge::new(gid, edge_type, from.gid(), to.gid()));
        {
            let _guard = edge.data.lock();
            self.storage.create_and_link_delta_on_edge(
                &self.transaction,
                &edge,
                DeltaAction::DeleteObject,
            );
        }

        {
            let from_vertex = Arc::clone(&from.vertex);
            let mut data = from_vertex.data.lock();
            if !mvcc::prepare_for_write(
                &self.storage.deltas,
                from_vertex.load_head(),
                &self.transaction,
            ) {
                return Err(UmbraError::Serialization);
            }
            if data.deleted {
                return Err(UmbraError::DeletedObject);
            }
            let link = EdgeLink {
                edge_type,
                vertex: to.gid(),
                edge: gid,
            };
            self.storage.create_and_link_delta_on_vertex(
                &self.transaction,
                &from_vertex,
                DeltaAction::RemoveOutEdge(link),
            );
            data.out_edges.push(link);
        }
        {
            let to_vertex = Arc::clone(&to.vertex);
            let mut data = to_vertex.data.lock();
            if !mvcc::prepare_for_write(
                &self.storage.deltas,
                to_vertex.load_head(),
                &self.transaction,
            ) {
                return Err(UmbraError::Serialization);
            }
            if data.deleted {
                return Err(UmbraError::DeletedObject);
            }
            let link = EdgeLink {
                edge_type,
                vertex: from.gid(),
                edge: gid,
            };
            self.storage.create_and_link_delta_on_vertex(
                &self.transaction,
                &to_vertex,
                DeltaAction::RemoveInEdge(link),
            );
            data.in_edges.push(link);
        }

        self.storage.edges.write().insert(gid, Arc::clone(&edge));
        Ok(EdgeAccessor {
            edge,
            accessor: self,
        })
    }

    /// Deletes an edge, unlinking it from both endpoints.
    pub fn delete_edge(&self, edge: &EdgeAccessor<'_>) -> Result<bool> {
        self.delete_edge_by_gid(edge.gid())
    }

    fn delete_edge_by_gid(&self, gid: Gid) -> Result<bool> {
        let Some(edge) = self.storage.edge(gid) else {
            return Err(UmbraError::NonexistentObject);
        };
        {
            let mut data = edge.data.lock();
            if !mvcc::prepare_for_write(&self.storage.deltas, edge.load_head(), &self.transaction) {
                return Err(UmbraError::Serialization);
            }
            if data.deleted {
                return Ok(false);
            }
            self.storage.create_and_link_delta_on_edge(
                &self.transaction,
                &edge,
                DeltaAction::RecreateObject,
            );
            data.deleted = true;
        }

        if let Some(from_vertex) = self.storage.vertex(edge.from_vertex) {
            let mut data = from_vertex.data.lock();
            if !mvcc::prepare_for_write(
                &self.storage.deltas,
                from_vertex.load_head(),
                &self.transaction,
            ) {
                return Err(UmbraError::Serialization);
            }
            let link = EdgeLink {
                edge_type: edge.edge_type,
                vertex: edge.to_vertex,
                edge: gid,
            };
            self.storage.create_and_link_delta_on_vertex(
                &self.transaction,
                &from_vertex,
                DeltaAction::AddOutEdge(link),
            );
            data.out_edges.retain(|existing| existing != &link);
        }
        if let Some(to_vertex) = self.storage.vertex(edge.to_vertex) {
            let mut data = to_vertex.data.lock();
            if !mvcc::prepare_for_write(
                &self.storage.deltas,
                to_vertex.load_head(),
                &self.transaction,
            ) {
                return Err(UmbraError::Serialization);
            }
            let link = EdgeLink {
                edge_type: edge.edge_type,
                vertex: edge.from_vertex,
                edge: gid,
            };
            self.storage.create_and_link_delta_on_vertex(
                &self.transaction,
                &to_vertex,
                DeltaAction::AddInEdge(link),
            );
            data.in_edges.retain(|existing| existing != &link);
        }
        Ok(true)
    }

    /// Commits the transaction: WAL append, replication, then the atomic
    /// commit-timestamp flip that publishes every delta at once.
    pub fn commit(self) -> Result<()> {
        debug_assert_eq!(self.transaction.state(), TxState::Active);
        let storage = Arc::clone(&self.storage);
        let tx = &self.transaction;

        if !tx.has_deltas() {
            tx.set_state(TxState::Committed);
            storage.active_transactions.lock().remove(&tx.id);
            return Ok(());
        }

        {
            let _guard = storage.engine_lock.lock();
            let commit_timestamp = storage.last_commit_timestamp.load(Ordering::SeqCst) + 1;
            if let Err(err) = storage.append_to_wal(tx, commit_timestamp) {
                drop(_guard);
                self.do_abort();
                return Err(err);
            }
            tx.commit_timestamp.store(commit_timestamp, Ordering::SeqCst);
            storage
                .last_commit_timestamp
                .store(commit_timestamp, Ordering::SeqCst);
            storage
                .committed_transactions
                .lock()
                .push_back(CommittedTransaction {
                    commit_timestamp,
                    deltas: tx.delta_ids(),
                });
            storage.active_transactions.lock().remove(&tx.id);
            debug!(tx_id = tx.id, commit_timestamp, "transaction committed");
        }

        // Replica acknowledgements are awaited outside the engine lock so a
        // slow or hung replica cannot stall unrelated commits.
        let clients: Vec<Arc<ReplicationClient>> =
            storage.replication_clients.read().iter().cloned().collect();
        for client in clients {
            client.finalize_transaction_replication();
        }

        self.transaction.set_state(TxState::Committed);
        Ok(())
    }

    /// Aborts the transaction, undoing every delta against its object and
    /// unlinking the chain heads.
    pub fn abort(self) {
        self.do_abort();
    }

    fn do_abort(&self) {
        let tx = &self.transaction;
        if tx.state() != TxState::Active {
            return;
        }
        let storage = &self.storage;
        let mut delta_ids = tx.delta_ids();
        // Undo newest-first so each delta is the chain head when processed.
        delta_ids.reverse();
        for delta_id in &delta_ids {
            let Some(delta) = storage.deltas.get(*delta_id) else {
                continue;
            };
            match storage.deltas.find_owner(&delta) {
                Some(PreviousRef::Vertex(gid)) => {
                    if let Some(vertex) = storage.vertex(gid) {
                        let mut data = vertex.data.lock();
                        data.apply(&delta.action);
                        storage.unlink_delta_locked(&delta, |next| {
                            if vertex.load_head() == delta.id {
                                vertex.store_head(next);
                            }
                        });
                    }
                }
                Some(PreviousRef::Edge(gid)) => {
                    if let Some(edge) = storage.edge(gid) {
                        let mut data = edge.data.lock();
                        data.apply(&delta.action);
                        storage.unlink_delta_locked(&delta, |next| {
                            if edge.load_head() == delta.id {
                                edge.store_head(next);
                            }
                        });
                    }
                }
                _ => {}
            }
        }
        delta_ids.reverse();
        if !delta_ids.is_empty() {
            let mark = storage.last_commit_timestamp.load(Ordering::SeqCst) + 1;
            storage.garbage_deltas.lock().push_back((mark, delta_ids));
        }
        storage.active_transactions.lock().remove(&tx.id);
        tx.set_state(TxState::Aborted);
        debug!(tx_id = tx.id, "transaction aborted");
    }
}

impl Drop for Accessor {
    fn drop(&mut self) {
        if self.transaction.state() == TxState::Active {
            self.do_abort();
        }
    }
}

/// Read/write handle of one vertex, scoped to an accessor.
pub struct VertexAccessor<'a> {
    pub(crate) vertex: Arc<Vertex>,
    accessor: &'a Accessor,
}

impl<'a> VertexAccessor<'a> {
    pub fn gid(&self) -> Gid {
        self.vertex.gid
    }

    fn storage(&self) -> &Storage {
        &self.accessor.storage
    }

    fn tx(&self) -> &Transaction {
        &self.accessor.transaction
    }

    /// Whether the vertex exists under `view`.
    pub fn is_visible(&self, view: View) -> bool {
        !mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view).deleted
    }

    /// Adds a label; `Ok(false)` when it was already present.
    pub fn add_label(&self, label: LabelId) -> Result<bool> {
        let storage = self.storage();
        let mut data = self.vertex.data.lock();
        if !mvcc::prepare_for_write(&storage.deltas, self.vertex.load_head(), self.tx()) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Err(UmbraError::DeletedObject);
        }
        if data.labels.contains(&label) {
            return Ok(false);
        }
        storage.create_and_link_delta_on_vertex(
            self.tx(),
            &self.vertex,
            DeltaAction::RemoveLabel(label),
        );
        data.labels.push(label);
        storage
            .indices
            .update_on_add_label(label, self.vertex.gid, &data);
        Ok(true)
    }

    /// Removes a label; `Ok(false)` when it was not present.
    pub fn remove_label(&self, label: LabelId) -> Result<bool> {
        let storage = self.storage();
        let mut data = self.vertex.data.lock();
        if !mvcc::prepare_for_write(&storage.deltas, self.vertex.load_head(), self.tx()) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Err(UmbraError::DeletedObject);
        }
        if !data.labels.contains(&label) {
            return Ok(false);
        }
        storage.create_and_link_delta_on_vertex(
            self.tx(),
            &self.vertex,
            DeltaAction::AddLabel(label),
        );
        data.labels.retain(|existing| existing != &label);
        Ok(true)
    }

    /// Sets (or clears, with `Null`) a property, returning the old value.
    /// Writing the value already stored is a no-op that produces no delta.
    pub fn set_property(&self, property: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        let storage = self.storage();
        let mut data = self.vertex.data.lock();
        if !mvcc::prepare_for_write(&storage.deltas, self.vertex.load_head(), self.tx()) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Err(UmbraError::DeletedObject);
        }
        let old = data
            .properties
            .get(&property)
            .cloned()
            .unwrap_or(PropertyValue::Null);
        if old == value {
            return Ok(old);
        }
        storage.create_and_link_delta_on_vertex(
            self.tx(),
            &self.vertex,
            DeltaAction::SetProperty {
                key: property,
                value: old.clone(),
            },
        );
        if value.is_null() {
            data.properties.remove(&property);
        } else {
            data.properties.insert(property, value);
            storage
                .indices
                .update_on_set_property(property, self.vertex.gid, &data);
        }
        Ok(old)
    }

    pub fn labels(&self, view: View) -> Result<Vec<LabelId>> {
        let state = mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(state.labels.to_vec())
    }

    pub fn has_label(&self, label: LabelId, view: View) -> Result<bool> {
        Ok(self.labels(view)?.contains(&label))
    }

    pub fn property(&self, property: PropertyId, view: View) -> Result<PropertyValue> {
        let state = mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(state
            .properties
            .get(&property)
            .cloned()
            .unwrap_or(PropertyValue::Null))
    }

    pub fn properties(
        &self,
        view: View,
    ) -> Result<std::collections::HashMap<PropertyId, PropertyValue>> {
        let state = mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(state.properties)
    }

    /// Incoming edges, optionally filtered by type.
    pub fn in_edges(&self, view: View, edge_types: &[EdgeTypeId]) -> Result<Vec<EdgeAccessor<'a>>> {
        let state = mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(self.link_accessors(&state.in_edges, edge_types))
    }

    /// Outgoing edges, optionally filtered by type.
    pub fn out_edges(&self, view: View, edge_types: &[EdgeTypeId]) -> Result<Vec<EdgeAccessor<'a>>> {
        let state = mvcc::vertex_state(&self.storage().deltas, &self.vertex, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(self.link_accessors(&state.out_edges, edge_types))
    }

    fn link_accessors(&self, links: &[EdgeLink], edge_types: &[EdgeTypeId]) -> Vec<EdgeAccessor<'a>> {
        links
            .iter()
            .filter(|link| edge_types.is_empty() || edge_types.contains(&link.edge_type))
            .filter_map(|link| {
                let edge = self.accessor.storage.edge(link.edge)?;
                Some(EdgeAccessor {
                    edge,
                    accessor: self.accessor,
                })
            })
            .collect()
    }
}

/// Read/write handle of one edge, scoped to an accessor.
pub struct EdgeAccessor<'a> {
    pub(crate) edge: Arc<Edge>,
    accessor: &'a Accessor,
}

impl<'a> EdgeAccessor<'a> {
    pub fn gid(&self) -> Gid {
        self.edge.gid
    }

    pub fn edge_type(&self) -> EdgeTypeId {
        self.edge.edge_type
    }

    pub fn from_vertex(&self) -> Gid {
        self.edge.from_vertex
    }

    pub fn to_vertex(&self) -> Gid {
        self.edge.to_vertex
    }

    fn storage(&self) -> &Storage {
        &self.accessor.storage
    }

    fn tx(&self) -> &Transaction {
        &self.accessor.transaction
    }

    pub fn is_visible(&self, view: View) -> bool {
        !mvcc::edge_state(&self.storage().deltas, &self.edge, self.tx(), view).deleted
    }

    /// Sets a property on the edge; fails when edge properties are disabled
    /// by configuration.
    pub fn set_property(&self, property: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        let storage = self.storage();
        if !storage.config.items.properties_on_edges {
            return Err(UmbraError::PropertiesDisabled);
        }
        let mut data = self.edge.data.lock();
        if !mvcc::prepare_for_write(&storage.deltas, self.edge.load_head(), self.tx()) {
            return Err(UmbraError::Serialization);
        }
        if data.deleted {
            return Err(UmbraError::DeletedObject);
        }
        let old = data
            .properties
            .get(&property)
            .cloned()
            .unwrap_or(PropertyValue::Null);
        if old == value {
            return Ok(old);
        }
        storage.create_and_link_delta_on_edge(
            self.tx(),
            &self.edge,
            DeltaAction::SetProperty {
                key: property,
                value: old.clone(),
            },
        );
        if value.is_null() {
            data.properties.remove(&property);
        } else {
            data.properties.insert(property, value);
        }
        Ok(old)
    }

    pub fn property(&self, property: PropertyId, view: View) -> Result<PropertyValue> {
        let state = mvcc::edge_state(&self.storage().deltas, &self.edge, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(state
            .properties
            .get(&property)
            .cloned()
            .unwrap_or(PropertyValue::Null))
    }

    pub fn properties(
        &self,
        view: View,
    ) -> Result<std::collections::HashMap<PropertyId, PropertyValue>> {
        let state = mvcc::edge_state(&self.storage().deltas, &self.edge, self.tx(), view);
        if state.deleted {
            return Err(UmbraError::NonexistentObject);
        }
        Ok(state.properties)
    }
}
