use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::CacheValue;

/// The concurrent map holding all materialized entries of a cache.
///
/// Entries are stored behind an [`Arc`] and never mutated in place. An upsert replaces the whole
/// entry, so readers always observe a fully constructed value.
///
/// Values may expose additional lookup keys through [`CacheValue::aliases`]. The alias index maps
/// every alias to the primary key, so a lookup by alias resolves to exactly the entry a lookup by
/// primary key returns.
#[derive(Debug)]
pub struct CacheStore<V: CacheValue> {
    entries: DashMap<V::Key, Arc<V>>,
    aliases: DashMap<V::Key, V::Key>,
    /// Keys which were counted as requested but are not materialized yet.
    outstanding: DashSet<V::Key>,
}

impl<V: CacheValue> Default for CacheStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            aliases: DashMap::new(),
            outstanding: DashSet::new(),
        }
    }
}

impl<V: CacheValue> CacheStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entry by primary key, falling back to the alias index.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        V::Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.entries.get(key) {
            return Some(Arc::clone(entry.value()));
        }
        // the alias guard is released before the primary map is touched again
        let primary = self.aliases.get(key)?.value().clone();
        self.entries.get::<V::Key>(&primary).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves `key` to the primary key of the entry it refers to.
    pub fn primary_key<Q>(&self, key: &Q) -> Option<V::Key>
    where
        V::Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.entries.get(key) {
            return Some(entry.key().clone());
        }
        Some(self.aliases.get(key)?.value().clone())
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        V::Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key) || self.aliases.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point in time copy of all entries.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Inserts or replaces the entry for the key of `value`.
    ///
    /// Returns `true` if the key was not materialized before.
    pub(crate) fn upsert(&self, mut value: V) -> bool {
        let key = value.key().clone();
        let (previous, aliases) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                value.merge_previous(occupied.get());
                let aliases = value.aliases();
                let previous = occupied.insert(Arc::new(value));
                self.link_aliases(&key, &aliases);
                (Some(previous), aliases)
            }
            Entry::Vacant(vacant) => {
                let aliases = value.aliases();
                vacant.insert(Arc::new(value));
                self.link_aliases(&key, &aliases);
                (None, aliases)
            }
        };

        let Some(previous) = previous else {
            return true;
        };
        for stale in previous.aliases() {
            if !aliases.contains(&stale) {
                self.aliases.remove_if(&stale, |_, primary| *primary == key);
            }
        }
        false
    }

    fn link_aliases(&self, key: &V::Key, aliases: &[V::Key]) {
        for alias in aliases {
            if alias != key {
                self.aliases.insert(alias.clone(), key.clone());
            }
        }
    }

    /// Removes the entry with the given primary key together with its aliases.
    pub(crate) fn remove(&self, key: &V::Key) -> Option<Arc<V>> {
        let (_, removed) = self.entries.remove(key)?;
        for alias in removed.aliases() {
            self.aliases.remove_if(&alias, |_, primary| primary == key);
        }
        Some(removed)
    }

    /// Marks `key` as requested unless it is already materialized or outstanding.
    ///
    /// Returns `true` if the key was newly marked.
    pub(crate) fn begin_request(&self, key: &V::Key) -> bool {
        !self.contains(key) && self.outstanding.insert(key.clone())
    }

    /// Clears the outstanding mark of `key`, returning whether it was set.
    pub(crate) fn settle(&self, key: &V::Key) -> bool {
        self.outstanding.remove(key).is_some()
    }

    pub(crate) fn is_outstanding(&self, key: &V::Key) -> bool {
        self.outstanding.contains(key)
    }

    /// Keys which were requested but never materialized.
    pub(crate) fn outstanding(&self) -> Vec<V::Key> {
        self.outstanding.iter().map(|key| key.key().clone()).collect()
    }

    /// Marks `key` as outstanding again, used when a key leaves the missing set.
    pub(crate) fn reopen(&self, key: &V::Key) {
        self.outstanding.insert(key.clone());
    }

    /// Inserts entries loaded from a snapshot, returning how many keys were new.
    pub(crate) fn restore(&self, values: Vec<V>) -> usize {
        let mut restored = 0;
        for value in values {
            if self.upsert(value) {
                restored += 1;
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        alias: Option<String>,
        weight: u32,
    }

    impl CacheValue for Item {
        type Key = String;

        fn key(&self) -> &String {
            &self.name
        }

        fn aliases(&self) -> Vec<String> {
            self.alias.iter().cloned().collect()
        }

        fn merge_previous(&mut self, previous: &Self) {
            if self.weight == 0 {
                self.weight = previous.weight;
            }
        }
    }

    fn entry(name: &str, alias: Option<&str>, weight: u32) -> Item {
        Item {
            name: name.into(),
            alias: alias.map(Into::into),
            weight,
        }
    }

    #[test]
    fn test_alias_resolves_to_primary() {
        let store = CacheStore::new();
        assert!(store.upsert(entry("a", Some("alpha"), 1)));

        let by_key = store.get("a").unwrap();
        let by_alias = store.get("alpha").unwrap();
        assert!(Arc::ptr_eq(&by_key, &by_alias));
        assert_eq!(store.primary_key("alpha").as_deref(), Some("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_and_merges() {
        let store = CacheStore::new();
        assert!(store.upsert(entry("a", Some("alpha"), 7)));
        assert!(!store.upsert(entry("a", Some("aleph"), 0)));

        let current = store.get("a").unwrap();
        assert_eq!(current.weight, 7);
        assert_eq!(current.alias.as_deref(), Some("aleph"));
        assert!(store.get("alpha").is_none());
        assert!(Arc::ptr_eq(&store.get("aleph").unwrap(), &current));
    }

    #[test]
    fn test_remove_drops_aliases() {
        let store = CacheStore::new();
        store.upsert(entry("a", Some("alpha"), 1));
        store.upsert(entry("b", None, 2));

        assert!(store.remove(&"a".to_owned()).is_some());
        assert!(store.remove(&"a".to_owned()).is_none());
        assert!(store.get("alpha").is_none());
        assert!(!store.contains("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_outstanding_marks() {
        let store: CacheStore<Item> = CacheStore::new();
        let key = "a".to_owned();

        assert!(store.begin_request(&key));
        assert!(!store.begin_request(&key));
        assert!(store.is_outstanding(&key));
        assert!(store.settle(&key));
        assert!(!store.settle(&key));
        assert!(!store.is_outstanding(&key));

        store.upsert(entry("a", None, 1));
        assert!(!store.begin_request(&key));
    }
}
