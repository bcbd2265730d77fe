use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::durability::snapshot::{self, SnapshotContents};
use crate::durability::wal::{self, WalEntry, WalOp};
use crate::durability::{get_snapshot_files, get_wal_files};
use crate::error::{Result, UmbraError};
use crate::storage::delta::EdgeLink;
use crate::storage::edge::Edge;
use crate::storage::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::storage::vertex::Vertex;
use crate::storage::Storage;

/// Rebuilds the storage from the latest snapshot plus the sequential WAL
/// chain that follows it.
///
/// Entries with a timestamp at or below the snapshot's start timestamp are
/// skipped; a sequence-number gap between the snapshot and the newest
/// segment aborts recovery.
pub(crate) fn recover_data(storage: &mut Storage) -> Result<()> {
    let durability = storage
        .config
        .durability
        .clone()
        .expect("caller verified durability is configured");

    let snapshots = get_snapshot_files(&durability.snapshot_directory, None)?;
    let mut recovered_uuid: Option<String> = None;
    // Every epoch the durability files span, closed at the timestamp it
    // reached. The replication handshake walks this to tell a replica from
    // an older epoch apart from one with a diverged history.
    let mut epoch_history: Vec<(String, u64)> = Vec::new();
    let mut current_epoch: Option<String> = None;
    let mut last_applied = 0u64;
    let mut recovered_anything = false;
    // Gids are never recycled, so the counters must clear every gid ever
    // allocated, deleted objects included.
    let mut next_vertex_gid = 0u64;
    let mut next_edge_gid = 0u64;

    if let Some(latest) = snapshots.last() {
        let contents = snapshot::load_snapshot(&latest.path)?;
        apply_snapshot(storage, &contents);
        for vertex in &contents.vertices {
            next_vertex_gid = next_vertex_gid.max(vertex.gid.as_u64() + 1);
        }
        for edge in &contents.edges {
            next_edge_gid = next_edge_gid.max(edge.gid.as_u64() + 1);
        }
        info!(
            path = %latest.path.display(),
            start_timestamp = contents.start_timestamp,
            vertices = contents.vertices.len(),
            edges = contents.edges.len(),
            "snapshot recovered"
        );
        recovered_uuid = Some(contents.uuid);
        current_epoch = Some(contents.epoch_id);
        last_applied = contents.start_timestamp;
        recovered_anything = true;
    }

    let wal_files = get_wal_files(&durability.wal_directory, recovered_uuid.as_deref(), None)?;
    let needed: Vec<_> = wal_files
        .iter()
        .filter(|info| info.to_timestamp > last_applied)
        .collect();
    for pair in needed.windows(2) {
        if pair[1].seq_num - pair[0].seq_num > 1 {
            return Err(UmbraError::Recovery(format!(
                "WAL chain has a gap between sequence numbers {} and {}",
                pair[0].seq_num, pair[1].seq_num
            )));
        }
    }
    if let Some(first) = needed.first() {
        // The chain must reach back to the snapshot it extends, or to the
        // beginning of history when no snapshot exists; commit timestamps
        // are dense, so the first needed segment starts at most one past
        // the last recovered timestamp. A missing leading segment fails
        // here instead of silently losing its transactions.
        if first.from_timestamp > last_applied + 1 {
            return Err(UmbraError::Recovery(format!(
                "WAL chain starting at timestamp {} does not reach back to {}",
                first.from_timestamp, last_applied
            )));
        }
    }

    for info in &needed {
        if current_epoch.as_deref() != Some(info.epoch_id.as_str()) {
            // The segment opens a new epoch; close the previous one at the
            // timestamp it reached.
            if let Some(previous) = current_epoch.take() {
                epoch_history.push((previous, last_applied));
            }
            current_epoch = Some(info.epoch_id.clone());
        }
        let entries = wal::read_wal_entries(&info.path)?;
        let mut applied = 0usize;
        for entry in &entries {
            if entry.timestamp <= last_applied {
                continue;
            }
            apply_wal_entry(storage, entry)?;
            match &entry.op {
                WalOp::CreateVertex { gid } => {
                    next_vertex_gid = next_vertex_gid.max(gid.as_u64() + 1);
                }
                WalOp::CreateEdge { gid, .. } => {
                    next_edge_gid = next_edge_gid.max(gid.as_u64() + 1);
                }
                _ => {}
            }
            applied += 1;
        }
        // Advanced only after the whole segment: entries of one transaction
        // share a timestamp and must not skip each other.
        for entry in &entries {
            last_applied = last_applied.max(entry.timestamp);
        }
        recovered_anything = true;
        info!(
            path = %info.path.display(),
            seq_num = info.seq_num,
            applied,
            "WAL segment recovered"
        );
    }

    if !recovered_anything {
        return Ok(());
    }

    if let Some(uuid) = recovered_uuid.or_else(|| wal_files.first().map(|info| info.uuid.clone())) {
        storage.uuid = uuid;
    }
    if let Some(epoch) = current_epoch {
        epoch_history.push((epoch, last_applied));
    }
    storage.epoch_history = epoch_history;
    storage
        .last_commit_timestamp
        .store(last_applied, Ordering::SeqCst);
    if let Some(info) = wal_files.last() {
        storage.wal_seq_num.store(info.seq_num + 1, Ordering::SeqCst);
    }

    storage.next_vertex_gid.store(next_vertex_gid, Ordering::SeqCst);
    storage.next_edge_gid.store(next_edge_gid, Ordering::SeqCst);

    info!(last_commit_timestamp = last_applied, "recovery finished");
    Ok(())
}

fn apply_snapshot(storage: &Storage, contents: &SnapshotContents) {
    for (id, name) in &contents.name_mappings {
        storage.dict.insert_with_id(*id, name);
    }
    for label in &contents.label_indices {
        storage.indices.create_label_index(LabelId(*label));
    }
    for (label, property) in &contents.label_property_indices {
        storage
            .indices
            .create_label_property_index(LabelId(*label), PropertyId(*property));
    }

    for snapshot_vertex in &contents.vertices {
        let vertex = Arc::new(Vertex::new(snapshot_vertex.gid));
        {
            let mut data = vertex.data.lock();
            data.labels = snapshot_vertex.labels.iter().map(|&id| LabelId(id)).collect();
            for (key, value) in &snapshot_vertex.properties {
                data.properties.insert(PropertyId(*key), value.clone());
            }
        }
        storage
            .vertices
            .write()
            .insert(snapshot_vertex.gid, vertex);
    }

    for snapshot_edge in &contents.edges {
        let edge = Arc::new(Edge::new(
            snapshot_edge.gid,
            EdgeTypeId(snapshot_edge.edge_type),
            snapshot_edge.from_vertex,
            snapshot_edge.to_vertex,
        ));
        {
            let mut data = edge.data.lock();
            for (key, value) in &snapshot_edge.properties {
                data.properties.insert(PropertyId(*key), value.clone());
            }
        }
        storage.edges.write().insert(snapshot_edge.gid, edge);

        let link_out = EdgeLink {
            edge_type: EdgeTypeId(snapshot_edge.edge_type),
            vertex: snapshot_edge.to_vertex,
            edge: snapshot_edge.gid,
        };
        let link_in = EdgeLink {
            edge_type: EdgeTypeId(snapshot_edge.edge_type),
            vertex: snapshot_edge.from_vertex,
            edge: snapshot_edge.gid,
        };
        if let Some(from) = storage.vertex(snapshot_edge.from_vertex) {
            from.data.lock().out_edges.push(link_out);
        }
        if let Some(to) = storage.vertex(snapshot_edge.to_vertex) {
            to.data.lock().in_edges.push(link_in);
        }
    }

    // Backfill the index entry sets from the restored data.
    for vertex in storage.vertices.read().values() {
        let data = vertex.data.lock().clone();
        for label in &data.labels {
            storage.indices.update_on_add_label(*label, vertex.gid, &data);
        }
        for property in data.properties.keys() {
            storage
                .indices
                .update_on_set_property(*property, vertex.gid, &data);
        }
    }
}

fn apply_wal_entry(storage: &Storage, entry: &WalEntry) -> Result<()> {
    match &entry.op {
        WalOp::CreateVertex { gid } => {
            storage
                .vertices
                .write()
                .insert(*gid, Arc::new(Vertex::new(*gid)));
        }
        WalOp::DeleteVertex { gid } => {
            storage.vertices.write().remove(gid);
        }
        WalOp::AddLabel { gid, label } => {
            let label = LabelId(storage.dict.intern(label));
            let vertex = recovered_vertex(storage, *gid)?;
            let mut data = vertex.data.lock();
            if !data.labels.contains(&label) {
                data.labels.push(label);
            }
            let snapshot = data.clone();
            drop(data);
            storage.indices.update_on_add_label(label, *gid, &snapshot);
        }
        WalOp::RemoveLabel { gid, label } => {
            let label = LabelId(storage.dict.intern(label));
            let vertex = recovered_vertex(storage, *gid)?;
            vertex
                .data
                .lock()
                .labels
                .retain(|existing| existing != &label);
        }
        WalOp::SetVertexProperty {
            gid,
            property,
            value,
        } => {
            let property = PropertyId(storage.dict.intern(property));
            let vertex = recovered_vertex(storage, *gid)?;
            let mut data = vertex.data.lock();
            if value.is_null() {
                data.properties.remove(&property);
            } else {
                data.properties.insert(property, value.clone());
            }
            let snapshot = data.clone();
            drop(data);
            storage
                .indices
                .update_on_set_property(property, *gid, &snapshot);
        }
        WalOp::CreateEdge {
            gid,
            edge_type,
            from_vertex,
            to_vertex,
        } => {
            let edge_type = EdgeTypeId(storage.dict.intern(edge_type));
            storage.edges.write().insert(
                *gid,
                Arc::new(Edge::new(*gid, edge_type, *from_vertex, *to_vertex)),
            );
            recovered_vertex(storage, *from_vertex)?
                .data
                .lock()
                .out_edges
                .push(EdgeLink {
                    edge_type,
                    vertex: *to_vertex,
                    edge: *gid,
                });
            recovered_vertex(storage, *to_vertex)?
                .data
                .lock()
                .in_edges
                .push(EdgeLink {
                    edge_type,
                    vertex: *from_vertex,
                    edge: *gid,
                });
        }
        WalOp::DeleteEdge {
            gid,
            edge_type,
            from_vertex,
            to_vertex,
        } => {
            let edge_type = EdgeTypeId(storage.dict.intern(edge_type));
            storage.edges.write().remove(gid);
            if let Some(from) = storage.vertex(*from_vertex) {
                let link = EdgeLink {
                    edge_type,
                    vertex: *to_vertex,
                    edge: *gid,
                };
                from.data.lock().out_edges.retain(|existing| existing != &link);
            }
            if let Some(to) = storage.vertex(*to_vertex) {
                let link = EdgeLink {
                    edge_type,
                    vertex: *from_vertex,
                    edge: *gid,
                };
                to.data.lock().in_edges.retain(|existing| existing != &link);
            }
        }
        WalOp::SetEdgeProperty {
            gid,
            property,
            value,
        } => {
            let property = PropertyId(storage.dict.intern(property));
            let edge = storage
                .edge(*gid)
                .ok_or_else(|| UmbraError::Recovery(format!("edge {gid} missing during replay")))?;
            let mut data = edge.data.lock();
            if value.is_null() {
                data.properties.remove(&property);
            } else {
                data.properties.insert(property, value.clone());
            }
        }
        WalOp::TransactionEnd => {}
        WalOp::LabelIndexCreate { label } => {
            let label = LabelId(storage.dict.intern(label));
            storage.indices.create_label_index(label);
            backfill_label_index(storage, label);
        }
        WalOp::LabelIndexDrop { label } => {
            let label = LabelId(storage.dict.intern(label));
            storage.indices.drop_label_index(label);
        }
        WalOp::LabelPropertyIndexCreate { label, property } => {
            let label = LabelId(storage.dict.intern(label));
            let property = PropertyId(storage.dict.intern(property));
            storage.indices.create_label_property_index(label, property);
            backfill_label_property_index(storage, label, property);
        }
        WalOp::LabelPropertyIndexDrop { label, property } => {
            let label = LabelId(storage.dict.intern(label));
            let property = PropertyId(storage.dict.intern(property));
            storage.indices.drop_label_property_index(label, property);
        }
    }
    Ok(())
}

fn recovered_vertex(storage: &Storage, gid: Gid) -> Result<Arc<Vertex>> {
    storage
        .vertex(gid)
        .ok_or_else(|| UmbraError::Recovery(format!("vertex {gid} missing during replay")))
}

fn backfill_label_index(storage: &Storage, label: LabelId) {
    for vertex in storage.vertices.read().values() {
        let data = vertex.data.lock().clone();
        if data.labels.contains(&label) {
            storage.indices.update_on_add_label(label, vertex.gid, &data);
        }
    }
}

fn backfill_label_property_index(storage: &Storage, label: LabelId, property: PropertyId) {
    for vertex in storage.vertices.read().values() {
        let data = vertex.data.lock().clone();
        if data.labels.contains(&label) && data.properties.contains_key(&property) {
            storage
                .indices
                .update_on_set_property(property, vertex.gid, &data);
        }
    }
}
