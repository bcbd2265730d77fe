use std::sync::atomic::Ordering;

use crate::storage::delta::{DeltaAction, DeltaId, DeltaStore};
use crate::storage::edge::{Edge, EdgeData};
use crate::storage::transaction::Transaction;
use crate::storage::types::{is_commit_timestamp, View};
use crate::storage::vertex::{Vertex, VertexData};

/// State that deltas can be undone against.
pub(crate) trait UndoTarget {
    fn apply(&mut self, action: &DeltaAction);
}

impl UndoTarget for VertexData {
    fn apply(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::DeleteObject => self.deleted = true,
            DeltaAction::RecreateObject => self.deleted = false,
            DeltaAction::SetProperty { key, value } => {
                if value.is_null() {
                    self.properties.remove(key);
                } else {
                    self.properties.insert(*key, value.clone());
                }
            }
            DeltaAction::AddLabel(label) => {
                if !self.labels.contains(label) {
                    self.labels.push(*label);
                }
            }
            DeltaAction::RemoveLabel(label) => {
                self.labels.retain(|existing| existing != label);
            }
            DeltaAction::AddInEdge(link) => {
                if !self.in_edges.contains(link) {
                    self.in_edges.push(*link);
                }
            }
            DeltaAction::AddOutEdge(link) => {
                if !self.out_edges.contains(link) {
                    self.out_edges.push(*link);
                }
            }
            DeltaAction::RemoveInEdge(link) => {
                self.in_edges.retain(|existing| existing != link);
            }
            DeltaAction::RemoveOutEdge(link) => {
                self.out_edges.retain(|existing| existing != link);
            }
        }
    }
}

impl UndoTarget for EdgeData {
    fn apply(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::DeleteObject => self.deleted = true,
            DeltaAction::RecreateObject => self.deleted = false,
            DeltaAction::SetProperty { key, value } => {
                if value.is_null() {
                    self.properties.remove(key);
                } else {
                    self.properties.insert(*key, value.clone());
                }
            }
            // Adjacency actions never land on edge chains.
            _ => debug_assert!(false, "adjacency delta on an edge chain"),
        }
    }
}

/// Decides whether a delta's change is already part of the state the reader
/// wants, in which case the walk stops in front of it.
fn delta_visible(ts: u64, command_id: u64, tx: &Transaction, view: View) -> bool {
    if ts == tx.id {
        // Own write: visible once the producing command is in the past
        // (`Old`) or the present (`New`).
        return match view {
            View::Old => command_id < tx.command_id(),
            View::New => command_id <= tx.command_id(),
        };
    }
    is_commit_timestamp(ts) && ts <= tx.start_timestamp
}

/// Rewinds `state` from the newest version to the one visible at the
/// transaction's snapshot by undoing every delta committed after it.
///
/// The walk never blocks: each step is an atomic load of the shared
/// commit-timestamp plus a handle lookup, so a reader sees either the
/// pre-commit or the post-commit value of a concurrent transaction,
/// atomically for all of its deltas.
pub(crate) fn apply_deltas_for_read<T: UndoTarget>(
    store: &DeltaStore,
    head: DeltaId,
    tx: &Transaction,
    view: View,
    state: &mut T,
) {
    let mut current = head;
    while let Some(delta) = store.get(current) {
        let ts = delta.timestamp.load(Ordering::Acquire);
        if delta_visible(ts, delta.command_id, tx, view) {
            break;
        }
        state.apply(&delta.action);
        current = delta.load_next();
    }
}

/// Materializes the vertex state visible to `tx` under `view`.
pub(crate) fn vertex_state(
    store: &DeltaStore,
    vertex: &Vertex,
    tx: &Transaction,
    view: View,
) -> VertexData {
    let (mut data, head) = {
        let guard = vertex.data.lock();
        (guard.clone(), vertex.load_head())
    };
    apply_deltas_for_read(store, head, tx, view, &mut data);
    data
}

/// Materializes the edge state visible to `tx` under `view`.
pub(crate) fn edge_state(store: &DeltaStore, edge: &Edge, tx: &Transaction, view: View) -> EdgeData {
    let (mut data, head) = {
        let guard = edge.data.lock();
        (guard.clone(), edge.load_head())
    };
    apply_deltas_for_read(store, head, tx, view, &mut data);
    data
}

/// Write-write conflict check: the chain head must belong to this
/// transaction, or to a transaction that committed at or before this
/// transaction's snapshot. First writer wins; everyone else retries.
pub(crate) fn prepare_for_write(store: &DeltaStore, head: DeltaId, tx: &Transaction) -> bool {
    let Some(delta) = store.get(head) else {
        return true;
    };
    let ts = delta.timestamp.load(Ordering::Acquire);
    if ts == tx.id {
        return true;
    }
    is_commit_timestamp(ts) && ts <= tx.start_timestamp
}
