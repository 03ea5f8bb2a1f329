//! Named browser sessions kept alive between requests

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

struct Entry<T> {
    value: Arc<T>,
    created_at: Instant,
}

/// Result of a TTL-aware lookup
pub enum Lookup<T> {
    Fresh(Arc<T>),
    /// Still stored; the caller decides how to dispose of it.
    Expired,
    Missing,
}

/// Session id → browser handle, shared by both backends.
pub struct SessionStore<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T> Default for SessionStore<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SessionStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves the map itself consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Store `value` under `id`, replacing anything already there.
    pub fn insert(&self, id: impl Into<String>, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.lock().insert(
            id.into(),
            Entry {
                value: value.clone(),
                created_at: Instant::now(),
            },
        );
        value
    }

    /// Look up `id`, treating entries older than `ttl` as expired.
    pub fn get_fresh(&self, id: &str, ttl: Option<Duration>) -> Lookup<T> {
        match self.lock().get(id) {
            None => Lookup::Missing,
            Some(entry) => match ttl {
                Some(ttl) if entry.created_at.elapsed() > ttl => Lookup::Expired,
                _ => Lookup::Fresh(entry.value.clone()),
            },
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.lock().remove(id).map(|entry| entry.value)
    }

    /// Stored ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take every session out of the store.
    pub fn drain(&self) -> Vec<(String, Arc<T>)> {
        self.lock()
            .drain()
            .map(|(id, entry)| (id, entry.value))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let store = SessionStore::new();
        assert!(store.is_empty());

        store.insert("b", 2);
        store.insert("a", 1);
        assert!(store.contains("a"));
        assert!(matches!(store.get_fresh("b", None), Lookup::Fresh(v) if *v == 2));
        assert_eq!(store.ids(), vec!["a", "b"]);

        assert_eq!(*store.remove("a").unwrap(), 1);
        assert!(store.remove("a").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ttl_lookup() {
        let store = SessionStore::new();
        store.insert("s", "browser");

        assert!(matches!(store.get_fresh("s", None), Lookup::Fresh(_)));
        assert!(matches!(store.get_fresh("s", Some(Duration::from_secs(600))), Lookup::Fresh(_)));
        assert!(matches!(store.get_fresh("missing", None), Lookup::Missing));

        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(store.get_fresh("s", Some(Duration::from_millis(5))), Lookup::Expired));
        // an expired entry stays until removed
        assert!(store.contains("s"));
    }

    #[test]
    fn test_drain_empties_store() {
        let store = SessionStore::new();
        store.insert("x", 1);
        store.insert("y", 2);

        let mut drained: Vec<String> = store.drain().into_iter().map(|(id, _)| id).collect();
        drained.sort();
        assert_eq!(drained, vec!["x", "y"]);
        assert!(store.is_empty());
    }
}
