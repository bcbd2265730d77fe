use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::delta::DeltaId;
use crate::storage::property_value::PropertyValue;
use crate::storage::types::{EdgeTypeId, Gid, PropertyId};

#[derive(Debug, Default, Clone)]
pub struct EdgeData {
    pub properties: HashMap<PropertyId, PropertyValue>,
    pub deleted: bool,
}

/// Edge object. The adjacency entries live on the endpoint vertices; the
/// object itself carries the property map and its own version chain.
#[derive(Debug)]
pub struct Edge {
    pub gid: Gid,
    pub edge_type: EdgeTypeId,
    pub from_vertex: Gid,
    pub to_vertex: Gid,
    pub data: Mutex<EdgeData>,
    /// Raw [`DeltaId`] of the chain head; zero when the chain is empty.
    pub delta: AtomicU64,
}

impl Edge {
    pub fn new(gid: Gid, edge_type: EdgeTypeId, from_vertex: Gid, to_vertex: Gid) -> Self {
        Self {
            gid,
            edge_type,
            from_vertex,
            to_vertex,
            data: Mutex::new(EdgeData::default()),
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
