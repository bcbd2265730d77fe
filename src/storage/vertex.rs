use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::storage::delta::{DeltaId, EdgeLink};
use crate::storage::property_value::PropertyValue;
use crate::storage::types::{Gid, LabelId, PropertyId};

/// Mutable portion of a vertex, guarded by the per-object lock.
///
/// The fields always hold the newest state; older versions are materialized
/// by undoing deltas from the chain head.
#[derive(Debug, Default, Clone)]
pub struct VertexData {
    pub labels: SmallVec<[LabelId; 4]>,
    pub properties: HashMap<PropertyId, PropertyValue>,
    pub in_edges: Vec<EdgeLink>,
    pub out_edges: Vec<EdgeLink>,
    pub deleted: bool,
}

#[derive(Debug)]
pub struct Vertex {
    pub gid: Gid,
    pub data: Mutex<VertexData>,
    /// Raw [`DeltaId`] of the chain head; zero when the chain is empty.
    pub delta: AtomicU64,
}

impl Vertex {
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            data: Mutex::new(VertexData::default()),
            delta: AtomicU64::new(DeltaId::null().raw()),
        }
    }

    pub fn load_head(&self) -> DeltaId {
        DeltaId::from_raw(self.delta.load(Ordering::Acquire))
    }

    pub fn store_head(&self, id: DeltaId) {
        self.delta.store(id.raw(), Ordering::Release);
    }
}
