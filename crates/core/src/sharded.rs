//! Lock-striped hash map.
//!
//! Keys hash to one of a fixed number of shards, each behind its own `RwLock`, so writers to
//! different keys rarely contend and readers never block each other.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;

const SHARDS: usize = 32;

pub(crate) struct Sharded<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> Sharded<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Runs `f` against the value for `key` under a read lock.
    pub(crate) fn read<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.shard(key).read().get(key))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Inserts `value` unless `key` is present. Returns whether it was inserted.
    pub(crate) fn insert_new(&self, key: K, value: V) -> bool {
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        true
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        self.shard(&key).write().insert(key, value);
    }

    /// Mutates an existing value. Returns `None` if `key` is absent.
    pub(crate) fn modify<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).write().get_mut(key).map(f)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

impl<K: Hash + Eq, V: Default> Sharded<K, V> {
    /// Mutates the value for `key`, creating a default one first if absent.
    pub(crate) fn upsert<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R {
        let mut shard = self.shard(&key).write();
        f(shard.entry(key).or_default())
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Sharded<K, V> {
    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.read(key, |v| v.cloned())
    }

    /// Point-in-time copy of every entry, shard by shard.
    pub(crate) fn entries(&self) -> Vec<(K, V)> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
