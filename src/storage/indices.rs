use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::storage::types::{Gid, LabelId, PropertyId};
use crate::storage::vertex::VertexData;

/// Label and label+property indexes.
///
/// Entries are inserted eagerly when a write touches an indexed label or
/// property and are never removed on the write path; readers re-validate
/// every candidate against their own snapshot, and the collector prunes
/// entries whose objects vanished. This keeps the write path free of
/// index-wide locking decisions.
#[derive(Debug, Default)]
pub struct Indices {
    label_defs: RwLock<BTreeSet<LabelId>>,
    label_property_defs: RwLock<BTreeSet<(LabelId, PropertyId)>>,
    label: RwLock<HashMap<LabelId, BTreeSet<Gid>>>,
    label_property: RwLock<HashMap<(LabelId, PropertyId), BTreeSet<Gid>>>,
}

impl Indices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a label index. Returns `false` when it already exists.
    pub fn create_label_index(&self, label: LabelId) -> bool {
        let inserted = self.label_defs.write().insert(label);
        if inserted {
            self.label.write().entry(label).or_default();
        }
        inserted
    }

    pub fn drop_label_index(&self, label: LabelId) -> bool {
        let removed = self.label_defs.write().remove(&label);
        if removed {
            self.label.write().remove(&label);
        }
        removed
    }

    pub fn create_label_property_index(&self, label: LabelId, property: PropertyId) -> bool {
        let inserted = self.label_property_defs.write().insert((label, property));
        if inserted {
            self.label_property.write().entry((label, property)).or_default();
        }
        inserted
    }

    pub fn drop_label_property_index(&self, label: LabelId, property: PropertyId) -> bool {
        let removed = self.label_property_defs.write().remove(&(label, property));
        if removed {
            self.label_property.write().remove(&(label, property));
        }
        removed
    }

    pub fn has_label_index(&self, label: LabelId) -> bool {
        self.label_defs.read().contains(&label)
    }

    pub fn has_label_property_index(&self, label: LabelId, property: PropertyId) -> bool {
        self.label_property_defs.read().contains(&(label, property))
    }

    pub fn label_definitions(&self) -> Vec<LabelId> {
        self.label_defs.read().iter().copied().collect()
    }

    pub fn label_property_definitions(&self) -> Vec<(LabelId, PropertyId)> {
        self.label_property_defs.read().iter().copied().collect()
    }

    /// Called after a label lands on a vertex.
    pub fn update_on_add_label(&self, label: LabelId, gid: Gid, data: &VertexData) {
        if self.has_label_index(label) {
            self.label.write().entry(label).or_default().insert(gid);
        }
        let defs = self.label_property_defs.read().clone();
        for (index_label, property) in defs {
            if index_label == label && data.properties.contains_key(&property) {
                self.label_property
                    .write()
                    .entry((index_label, property))
                    .or_default()
                    .insert(gid);
            }
        }
    }

    /// Called after a property lands on a vertex.
    pub fn update_on_set_property(&self, property: PropertyId, gid: Gid, data: &VertexData) {
        let defs = self.label_property_defs.read().clone();
        for (label, index_property) in defs {
            if index_property == property && data.labels.contains(&label) {
                self.label_property
                    .write()
                    .entry((label, index_property))
                    .or_default()
                    .insert(gid);
            }
        }
    }

    /// Candidate gids for a label scan; the caller filters by snapshot.
    pub fn label_entries(&self, label: LabelId) -> Vec<Gid> {
        self.label
            .read()
            .get(&label)
            .map(|entries| entries.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Candidate gids for a label+property scan; the caller filters.
    pub fn label_property_entries(&self, label: LabelId, property: PropertyId) -> Vec<Gid> {
        self.label_property
            .read()
            .get(&(label, property))
            .map(|entries| entries.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops entries whose object is gone, as decided by `live`.
    pub fn prune(&self, live: impl Fn(Gid) -> bool) {
        for entries in self.label.write().values_mut() {
            entries.retain(|&gid| live(gid));
        }
        for entries in self.label_property.write().values_mut() {
            entries.retain(|&gid| live(gid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    use crate::storage::property_value::PropertyValue;

    #[test]
    fn create_and_drop_are_idempotent() {
        let indices = Indices::new();
        assert!(indices.create_label_index(LabelId(1)));
        assert!(!indices.create_label_index(LabelId(1)));
        assert!(indices.drop_label_index(LabelId(1)));
        assert!(!indices.drop_label_index(LabelId(1)));
    }

    #[test]
    fn label_property_entries_track_both_sides() {
        let indices = Indices::new();
        indices.create_label_property_index(LabelId(1), PropertyId(2));
        let mut data = VertexData {
            labels: smallvec![LabelId(1)],
            ..VertexData::default()
        };
        data.properties.insert(PropertyId(2), PropertyValue::Int(5));

        // Arrival order should not matter: label first or property first.
        indices.update_on_add_label(LabelId(1), Gid::from_u64(1), &data);
        indices.update_on_set_property(PropertyId(2), Gid::from_u64(2), &data);
        let mut entries = indices.label_property_entries(LabelId(1), PropertyId(2));
        entries.sort();
        assert_eq!(entries, vec![Gid::from_u64(1), Gid::from_u64(2)]);

        indices.prune(|gid| gid == Gid::from_u64(2));
        assert_eq!(
            indices.label_property_entries(LabelId(1), PropertyId(2)),
            vec![Gid::from_u64(2)]
        );
    }
}
