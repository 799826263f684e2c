//! Per-tunnel connection table.
//!
//! Maps logical connection ids to their local transport handle. Removal is
//! atomic: of all the tasks racing to tear a connection down, exactly one
//! gets the entry back, and that task owns the teardown (closing the
//! transport and emitting CLOSE).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub struct ConnectionTable<T> {
    entries: DashMap<String, Arc<T>>,
    opened: AtomicU64,
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            opened: AtomicU64::new(0),
        }
    }

    /// Mint a fresh connection id and register `value` under it
    pub fn open(&self, value: T) -> (String, Arc<T>) {
        let value = Arc::new(value);
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.entries.entry(id.clone()) {
                slot.insert(value.clone());
                self.opened.fetch_add(1, Ordering::Relaxed);
                return (id, value);
            }
        }
    }

    /// Register `value` under a caller-chosen id. Refuses an id that is live.
    pub fn insert(&self, id: impl Into<String>, value: T) -> bool {
        match self.entries.entry(id.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(value));
                self.opened.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Return the live entry for `id`, registering `make()` if there is none.
    /// The flag is true when a new entry was created.
    pub fn insert_or_get(&self, id: &str, make: impl FnOnce() -> T) -> (Arc<T>, bool) {
        if let Some(existing) = self.entries.get(id) {
            return (existing.value().clone(), false);
        }
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(slot) => {
                let value = Arc::new(make());
                slot.insert(value.clone());
                self.opened.fetch_add(1, Ordering::Relaxed);
                (value, true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove `id`; only one caller ever receives the entry
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.entries.remove(id).map(|(_, v)| v)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove every live entry. Entries removed concurrently elsewhere are skipped.
    pub fn drain(&self) -> Vec<(String, Arc<T>)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id).map(|v| (id, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of entries ever registered
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ConnectionTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("live", &self.entries.len())
            .field("opened", &self.opened())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_open_mints_unique_ids() {
        let table = ConnectionTable::new();
        let mut seen = HashSet::new();
        for i in 0..500 {
            let (id, _) = table.open(i);
            assert!(seen.insert(id.clone()));
            if i % 2 == 0 {
                table.remove(&id);
            }
        }
        assert_eq!(table.opened(), 500);
        assert_eq!(table.len(), 250);
    }

    #[test]
    fn test_insert_refuses_live_id() {
        let table = ConnectionTable::new();
        assert!(table.insert("a", 1));
        assert!(!table.insert("a", 2));
        assert_eq!(*table.get("a").unwrap(), 1);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let table = ConnectionTable::new();
        table.insert("a", ());
        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
    }

    #[test]
    fn test_insert_or_get() {
        let table = ConnectionTable::new();
        let (first, created) = table.insert_or_get("1.2.3.4:9", || 7);
        assert!(created);
        let (second, created) = table.insert_or_get("1.2.3.4:9", || 8);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_drain_races_with_removal() {
        let table = Arc::new(ConnectionTable::new());
        let ids: Vec<String> = (0..1000).map(|i| table.open(i).0).collect();

        let remover = {
            let table = table.clone();
            let ids = ids.clone();
            std::thread::spawn(move || ids.iter().filter(|id| table.remove(id).is_some()).count())
        };
        let drained = table.drain().len();
        let removed = remover.join().unwrap();

        assert_eq!(drained + removed, 1000);
        assert!(table.is_empty());
    }
}
