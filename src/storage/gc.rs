use std::sync::atomic::Ordering;

use tracing::debug;

use crate::storage::delta::{Delta, DeltaId, PreviousRef};
use crate::storage::types::Gid;
use crate::storage::Storage;

impl Storage {
    /// One collection pass.
    ///
    /// Committed transactions are drained in commit order while their commit
    /// timestamp is at or below the watermark (the oldest start timestamp of
    /// any active transaction): no active reader can walk past such a delta,
    /// so the chain can be cut there. Unlinked deltas are parked with a mark
    /// timestamp and freed only once every transaction that was active at
    /// unlink time has finished, so an in-flight walk never dangles.
    pub fn collect_garbage(&self) {
        let watermark = self
            .oldest_active_start_timestamp()
            .unwrap_or_else(|| self.last_commit_timestamp.load(Ordering::SeqCst) + 1);

        let mut unlinked: Vec<DeltaId> = Vec::new();
        {
            let mut committed = self.committed_transactions.lock();
            while let Some(front) = committed.front() {
                if front.commit_timestamp > watermark {
                    break;
                }
                let transaction = committed.pop_front().expect("front checked");
                for delta_id in transaction.deltas {
                    self.unlink_delta(delta_id);
                    unlinked.push(delta_id);
                }
            }
        }
        if !unlinked.is_empty() {
            let mark = self.last_commit_timestamp.load(Ordering::SeqCst) + 1;
            debug!(count = unlinked.len(), mark, "deltas unlinked");
            self.garbage_deltas.lock().push_back((mark, unlinked));
        }

        let mut freed = 0usize;
        {
            let mut garbage = self.garbage_deltas.lock();
            while let Some((mark, _)) = garbage.front() {
                if *mark > watermark {
                    break;
                }
                let (_, delta_ids) = garbage.pop_front().expect("front checked");
                for delta_id in delta_ids {
                    self.deltas.remove(delta_id);
                    freed += 1;
                }
            }
        }
        if freed > 0 {
            debug!(count = freed, "deltas freed");
        }

        self.sweep_deleted_objects();
    }

    /// Detaches a delta from its chain. The object data lock is taken while
    /// the links around the delta are rewired so writers prepending a new
    /// head cannot race the rewiring.
    fn unlink_delta(&self, delta_id: DeltaId) {
        let Some(delta) = self.deltas.get(delta_id) else {
            return;
        };
        match self.deltas.find_owner(&delta) {
            Some(PreviousRef::Vertex(gid)) => {
                if let Some(vertex) = self.vertex(gid) {
                    let _guard = vertex.data.lock();
                    self.unlink_delta_locked(&delta, |next| {
                        if vertex.load_head() == delta.id {
                            vertex.store_head(next);
                        }
                    });
                }
            }
            Some(PreviousRef::Edge(gid)) => {
                if let Some(edge) = self.edge(gid) {
                    let _guard = edge.data.lock();
                    self.unlink_delta_locked(&delta, |next| {
                        if edge.load_head() == delta.id {
                            edge.store_head(next);
                        }
                    });
                }
            }
            _ => {}
        }
    }

    /// Rewires the links around `delta`. Caller holds the owner's data lock.
    pub(crate) fn unlink_delta_locked(&self, delta: &Delta, set_head: impl FnOnce(DeltaId)) {
        let next = delta.load_next();
        let prev = delta.load_prev();
        match prev.get() {
            Some(PreviousRef::Delta(newer)) => {
                if let Some(newer_delta) = self.deltas.get(newer) {
                    newer_delta.store_next(next);
                }
            }
            Some(PreviousRef::Vertex(_)) | Some(PreviousRef::Edge(_)) => set_head(next),
            None => {}
        }
        if let Some(older) = self.deltas.get(next) {
            older.store_prev(prev);
        }
    }

    /// Removes tombstoned objects whose chains have been fully truncated.
    /// An empty chain proves the deletion is older than every active
    /// snapshot (or was aborted), so no reader can still materialize the
    /// object.
    fn sweep_deleted_objects(&self) {
        let mut dead_vertices: Vec<Gid> = Vec::new();
        for (gid, vertex) in self.vertices.read().iter() {
            let data = vertex.data.lock();
            if data.deleted && vertex.load_head().is_null() {
                dead_vertices.push(*gid);
            }
        }
        let mut dead_edges: Vec<Gid> = Vec::new();
        for (gid, edge) in self.edges.read().iter() {
            let data = edge.data.lock();
            if data.deleted && edge.load_head().is_null() {
                dead_edges.push(*gid);
            }
        }

        if !dead_vertices.is_empty() {
            let mut vertices = self.vertices.write();
            for gid in &dead_vertices {
                vertices.remove(gid);
            }
        }
        if !dead_edges.is_empty() {
            let mut edges = self.edges.write();
            for gid in &dead_edges {
                edges.remove(gid);
            }
        }
        if !dead_vertices.is_empty() {
            let vertices = self.vertices.read();
            self.indices.prune(|gid| vertices.contains_key(&gid));
        }
        if !dead_vertices.is_empty() || !dead_edges.is_empty() {
            debug!(
                vertices = dead_vertices.len(),
                edges = dead_edges.len(),
                "tombstoned objects reclaimed"
            );
        }
    }
}
