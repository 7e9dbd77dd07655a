//! Two-generation cache.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// A bounded cache that ages entries by generation instead of per-entry LRU.
///
/// New entries go into the young generation. When it reaches half the
/// capacity, the old generation is dropped and the young one takes its place.
/// A hit in the old generation promotes the entry back into the young one,
/// so frequently used entries survive rotation.
#[derive(Debug)]
pub struct CacheMap<K, V> {
    inner: Mutex<Generations<K, V>>,
    threshold: usize,
}

#[derive(Debug)]
struct Generations<K, V> {
    young: HashMap<K, V>,
    old: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> CacheMap<K, V> {
    /// Create a cache holding roughly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Generations {
                young: HashMap::new(),
                old: HashMap::new(),
            }),
            threshold: (capacity / 2).max(1),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.young.get(key) {
            return Some(value.clone());
        }
        let (key, value) = inner.old.remove_entry(key)?;
        inner.young.insert(key, value.clone());
        self.rotate_if_full(&mut inner);
        Some(value)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();
        let previous_old = inner.old.remove(&key);
        let previous = inner.young.insert(key, value).or(previous_old);
        self.rotate_if_full(&mut inner);
        previous
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.lock();
        let young = inner.young.remove(key);
        let old = inner.old.remove(key);
        young.or(old)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = self.inner.lock();
        inner.young.contains_key(key) || inner.old.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.young.len() + inner.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.young.clear();
        inner.old.clear();
    }

    fn rotate_if_full(&self, inner: &mut Generations<K, V>) {
        if inner.young.len() >= self.threshold {
            inner.old = std::mem::take(&mut inner.young);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache: CacheMap<String, u32> = CacheMap::new(10);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_rotation_drops_oldest_generation() {
        let cache: CacheMap<u32, u32> = CacheMap::new(4);
        // threshold is 2: inserting 0,1 rotates them into the old generation
        cache.insert(0, 0);
        cache.insert(1, 1);
        // 2,3 rotate again, dropping 0 and 1
        cache.insert(2, 2);
        cache.insert(3, 3);

        assert!(!cache.contains_key(&0));
        assert!(!cache.contains_key(&1));
        assert!(cache.contains_key(&2));
        assert!(cache.contains_key(&3));
    }

    #[test]
    fn test_hit_in_old_generation_promotes() {
        let cache: CacheMap<u32, u32> = CacheMap::new(6);
        for i in 0..3 {
            cache.insert(i, i);
        }
        // 0..3 now old; touching 0 moves it to young
        assert_eq!(cache.get(&0), Some(0));
        cache.insert(10, 10);
        cache.insert(11, 11);
        // rotation: young {0,10,11} became old, previous old {1,2} dropped
        assert!(cache.contains_key(&0));
        assert!(!cache.contains_key(&1));
    }

    #[test]
    fn test_remove() {
        let cache: CacheMap<&'static str, u32> = CacheMap::new(10);
        cache.insert("k", 5);
        assert_eq!(cache.remove("k"), Some(5));
        assert!(cache.is_empty());
    }
}
