//! Small bounded caches for values that outlive individual archives.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Namespaced key/value cache with a hard entry cap.
///
/// Keys are `(namespace, name)`; a whole namespace can be dropped when the
/// archive it belongs to is evicted. When full, the oldest fifth of the
/// entries by last access is pruned.
pub struct BoundedCache<V> {
    max_entries: usize,
    entries: Mutex<HashMap<(String, String), (V, Instant)>>,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("bounded cache lock poisoned");
        let entry = entries.get_mut(&(namespace.to_string(), name.to_string()))?;
        entry.1 = Instant::now();
        Some(entry.0.clone())
    }

    pub fn insert(&self, namespace: &str, name: &str, value: V) {
        let mut entries = self.entries.lock().expect("bounded cache lock poisoned");
        if entries.len() >= self.max_entries {
            Self::prune(&mut entries, self.max_entries / 5 + 1);
        }
        entries.insert(
            (namespace.to_string(), name.to_string()),
            (value, Instant::now()),
        );
    }

    pub fn drop_namespace(&self, namespace: &str) {
        let mut entries = self.entries.lock().expect("bounded cache lock poisoned");
        entries.retain(|(ns, _), _| ns != namespace);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("bounded cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(entries: &mut HashMap<(String, String), (V, Instant)>, count: usize) {
        let mut by_age: Vec<((String, String), Instant)> = entries
            .iter()
            .map(|(k, (_, at))| (k.clone(), *at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age.into_iter().take(count) {
            entries.remove(&key);
        }
    }
}
