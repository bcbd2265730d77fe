use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

/// Append-only name ↔ id dictionary shared by labels, property keys, and
/// edge types. Ids are dense `u32`s; a name, once interned, keeps its id for
/// the life of the storage instance.
#[derive(Debug, Default)]
pub struct NameDict {
    name_to_id: RwLock<HashMap<String, u32>>,
    id_to_name: RwLock<HashMap<u32, String>>,
    next_id: AtomicU32,
}

impl NameDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, allocating one if it was never seen.
    pub fn intern(&self, name: &str) -> u32 {
        if let Some(&id) = self.name_to_id.read().get(name) {
            return id;
        }
        let mut names = self.name_to_id.write();
        if let Some(&id) = names.get(name) {
            return id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        names.insert(name.to_owned(), id);
        self.id_to_name.write().insert(id, name.to_owned());
        id
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.name_to_id.read().get(name).copied()
    }

    pub fn resolve(&self, id: u32) -> Option<String> {
        self.id_to_name.read().get(&id).cloned()
    }

    /// Restores a mapping read back from a snapshot. Keeps the allocator
    /// ahead of every restored id.
    pub fn insert_with_id(&self, id: u32, name: &str) {
        self.name_to_id.write().insert(name.to_owned(), id);
        self.id_to_name.write().insert(id, name.to_owned());
        self.next_id.fetch_max(id + 1, Ordering::Relaxed);
    }

    /// All mappings ordered by id, the order the snapshot writer fixes.
    pub fn entries(&self) -> Vec<(u32, String)> {
        let mut entries: Vec<(u32, String)> = self
            .id_to_name
            .read()
            .iter()
            .map(|(&id, name)| (id, name.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.id_to_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let dict = NameDict::new();
        let a = dict.intern("Person");
        let b = dict.intern("Person");
        assert_eq!(a, b);
        assert_eq!(dict.resolve(a).as_deref(), Some("Person"));
        assert_eq!(dict.lookup("Person"), Some(a));
        assert_eq!(dict.lookup("Animal"), None);
    }

    #[test]
    fn restored_ids_do_not_collide_with_new_ones() {
        let dict = NameDict::new();
        dict.insert_with_id(7, "name");
        let fresh = dict.intern("age");
        assert!(fresh > 7);
        assert_eq!(dict.resolve(7).as_deref(), Some("name"));
        assert_eq!(
            dict.entries(),
            vec![(7, "name".to_string()), (fresh, "age".to_string())]
        );
    }
}
