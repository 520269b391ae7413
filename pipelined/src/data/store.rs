use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;

/// Key-value storage behind the trackers.  Each call is atomic for its key, so read-modify-write
/// through `upsert` cannot interleave with another writer of the same key.  Deployments that
/// need state to outlive the process plug in a persistent implementation.
pub trait Store<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Store `f(current)` under `key` and return it.
    fn upsert(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> V) -> V;

    fn remove(&self, key: &K) -> Option<V>;

    /// Remove the entry only if `f` accepts its current value.
    fn remove_if(&self, key: &K, f: &dyn Fn(&V) -> bool) -> Option<V>;

    fn entries(&self) -> Vec<(K, V)>;

    fn clear(&self);
}

pub struct MemoryStore<K: Eq + Hash, V>(DashMap<K, V>);

impl<K: Eq + Hash, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        MemoryStore(DashMap::new())
    }
}

impl<K: Eq + Hash, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.0.get(key).map(|v| v.clone())
    }

    fn upsert(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> V) -> V {
        match self.0.entry(key) {
            Entry::Occupied(mut e) => {
                let value = f(Some(e.get()));
                e.insert(value.clone());
                value
            }
            Entry::Vacant(e) => {
                let value = f(None);
                e.insert(value.clone());
                value
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.0.remove(key).map(|(_, v)| v)
    }

    fn remove_if(&self, key: &K, f: &dyn Fn(&V) -> bool) -> Option<V> {
        self.0.remove_if(key, |_, v| f(v)).map(|(_, v)| v)
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.0
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn clear(&self) {
        self.0.clear()
    }
}
