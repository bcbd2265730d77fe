use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::property_value::PropertyValue;
use crate::storage::types::{EdgeTypeId, Gid, LabelId, PropertyId};

/// Arena handle of a [`Delta`]; zero means "null".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeltaId(u64);

impl DeltaId {
    pub const fn null() -> Self {
        Self(0)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

const TAG_DELTA: u64 = 0b01;
const TAG_VERTEX: u64 = 0b10;
const TAG_EDGE: u64 = 0b11;
const TAG_MASK: u64 = 0b11;
const PAYLOAD_SHIFT: u32 = 3;

/// Referent of a [`PreviousPtr`], decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviousRef {
    Delta(DeltaId),
    Vertex(Gid),
    Edge(Gid),
}

/// Back-reference of a delta, reaching either the next-newer delta or the
/// head object that owns the chain.
///
/// One of three referent kinds is stored without spending extra memory on
/// the discriminant: all referents are handles into 8-byte-aligned arenas,
/// so the low three bits of a shifted handle are always zero and two of them
/// hold the tag. Readers must mask the tag off before resolving the handle;
/// the tag round-trips exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreviousPtr(u64);

impl PreviousPtr {
    pub const fn null() -> Self {
        Self(0)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn delta(id: DeltaId) -> Self {
        Self::pack(id.raw(), TAG_DELTA)
    }

    pub fn vertex(gid: Gid) -> Self {
        Self::pack(gid.as_u64(), TAG_VERTEX)
    }

    pub fn edge(gid: Gid) -> Self {
        Self::pack(gid.as_u64(), TAG_EDGE)
    }

    fn pack(payload: u64, tag: u64) -> Self {
        debug_assert!(
            payload < (1 << (64 - PAYLOAD_SHIFT)),
            "pointer payload overflows tag space"
        );
        Self((payload << PAYLOAD_SHIFT) | tag)
    }

    /// Decodes the referent. `None` for a null pointer.
    pub fn get(self) -> Option<PreviousRef> {
        if self.is_null() {
            return None;
        }
        let payload = self.0 >> PAYLOAD_SHIFT;
        match self.0 & TAG_MASK {
            TAG_DELTA => Some(PreviousRef::Delta(DeltaId::from_raw(payload))),
            TAG_VERTEX => Some(PreviousRef::Vertex(Gid::from_u64(payload))),
            TAG_EDGE => Some(PreviousRef::Edge(Gid::from_u64(payload))),
            _ => unreachable!("invalid pointer tag"),
        }
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Adjacency payload of the edge-flavored delta actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeLink {
    pub edge_type: EdgeTypeId,
    /// The vertex on the other side of the edge.
    pub vertex: Gid,
    pub edge: Gid,
}

/// Undo record for a single change. Applying the action to the current
/// object state reverts the change the owning transaction made.
#[derive(Clone, Debug)]
pub enum DeltaAction {
    /// Undo of object creation.
    DeleteObject,
    /// Undo of object deletion.
    RecreateObject,
    /// Undo of a property write; `value` is the previous value.
    SetProperty {
        key: PropertyId,
        value: PropertyValue,
    },
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    AddInEdge(EdgeLink),
    AddOutEdge(EdgeLink),
    RemoveInEdge(EdgeLink),
    RemoveOutEdge(EdgeLink),
}

/// One link of a version chain.
///
/// `timestamp` aliases the owning transaction's commit-timestamp atomic: it
/// holds the transaction id until the transaction commits and the assigned
/// commit timestamp afterwards, which is what lets readers observe the
/// commit of a whole transaction in a single atomic load.
#[derive(Debug)]
pub struct Delta {
    pub id: DeltaId,
    pub action: DeltaAction,
    pub timestamp: Arc<AtomicU64>,
    pub command_id: u64,
    /// Packed [`PreviousPtr`].
    pub prev: AtomicU64,
    /// Raw [`DeltaId`] of the next-older delta; zero terminates the chain.
    pub next: AtomicU64,
}

impl Delta {
    pub fn load_prev(&self) -> PreviousPtr {
        PreviousPtr::from_raw(self.prev.load(Ordering::Acquire))
    }

    pub fn store_prev(&self, ptr: PreviousPtr) {
        self.prev.store(ptr.raw(), Ordering::Release);
    }

    pub fn load_next(&self) -> DeltaId {
        DeltaId::from_raw(self.next.load(Ordering::Acquire))
    }

    pub fn store_next(&self, id: DeltaId) {
        self.next.store(id.raw(), Ordering::Release);
    }
}

/// Arena owning every live delta, addressed by [`DeltaId`].
///
/// Entries are shared as `Arc` so an in-flight reader that already resolved
/// a handle keeps its delta alive even if the collector frees the slot
/// concurrently.
#[derive(Debug, Default)]
pub struct DeltaStore {
    entries: RwLock<HashMap<u64, Arc<Delta>>>,
    next_id: AtomicU64,
}

impl DeltaStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            // Slot zero is the null handle.
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create(
        &self,
        action: DeltaAction,
        timestamp: Arc<AtomicU64>,
        command_id: u64,
    ) -> Arc<Delta> {
        let id = DeltaId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let delta = Arc::new(Delta {
            id,
            action,
            timestamp,
            command_id,
            prev: AtomicU64::new(PreviousPtr::null().raw()),
            next: AtomicU64::new(DeltaId::null().raw()),
        });
        self.entries.write().insert(id.raw(), Arc::clone(&delta));
        delta
    }

    pub fn get(&self, id: DeltaId) -> Option<Arc<Delta>> {
        if id.is_null() {
            return None;
        }
        self.entries.read().get(&id.raw()).cloned()
    }

    pub fn remove(&self, id: DeltaId) -> Option<Arc<Delta>> {
        self.entries.write().remove(&id.raw())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Resolves the object owning the chain a delta sits on by following the
    /// back-references toward the head.
    pub fn find_owner(&self, delta: &Delta) -> Option<PreviousRef> {
        let mut current = delta.load_prev();
        loop {
            match current.get()? {
                PreviousRef::Delta(id) => {
                    let newer = self.get(id)?;
                    current = newer.load_prev();
                }
                owner => return Some(owner),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::TRANSACTION_INITIAL_ID;

    #[test]
    fn previous_ptr_tag_roundtrip() {
        let cases = [
            PreviousPtr::delta(DeltaId::from_raw(1)),
            PreviousPtr::delta(DeltaId::from_raw(0xfeed)),
            PreviousPtr::vertex(Gid::from_u64(0)),
            PreviousPtr::vertex(Gid::from_u64(42)),
            PreviousPtr::edge(Gid::from_u64(7)),
        ];
        let expected = [
            PreviousRef::Delta(DeltaId::from_raw(1)),
            PreviousRef::Delta(DeltaId::from_raw(0xfeed)),
            PreviousRef::Vertex(Gid::from_u64(0)),
            PreviousRef::Vertex(Gid::from_u64(42)),
            PreviousRef::Edge(Gid::from_u64(7)),
        ];
        for (ptr, want) in cases.iter().zip(expected.iter()) {
            assert_eq!(ptr.get(), Some(*want));
            // Raw representation survives a store/load cycle unchanged.
            assert_eq!(PreviousPtr::from_raw(ptr.raw()).get(), Some(*want));
        }
        assert_eq!(PreviousPtr::null().get(), None);
    }

    #[test]
    fn store_allocates_monotonic_handles() {
        let store = DeltaStore::new();
        let ts = Arc::new(AtomicU64::new(TRANSACTION_INITIAL_ID));
        let a = store.create(DeltaAction::DeleteObject, Arc::clone(&ts), 0);
        let b = store.create(DeltaAction::RecreateObject, ts, 0);
        assert!(a.id.raw() < b.id.raw());
        assert!(store.get(a.id).is_some());
        assert!(store.remove(a.id).is_some());
        assert!(store.get(a.id).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.get(DeltaId::null()).is_none());
    }

    #[test]
    fn find_owner_walks_to_the_head() {
        let store = DeltaStore::new();
        let ts = Arc::new(AtomicU64::new(TRANSACTION_INITIAL_ID));
        let owner = Gid::from_u64(9);
        let head = store.create(DeltaAction::DeleteObject, Arc::clone(&ts), 0);
        head.store_prev(PreviousPtr::vertex(owner));
        let tail = store.create(DeltaAction::AddLabel(LabelId(1)), ts, 1);
        tail.store_prev(PreviousPtr::delta(head.id));
        head.store_next(tail.id);
        assert_eq!(store.find_owner(&tail), Some(PreviousRef::Vertex(owner)));
        assert_eq!(store.find_owner(&head), Some(PreviousRef::Vertex(owner)));
    }
}
