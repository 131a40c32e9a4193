use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Map that remembers at most `capacity` keys, forgetting the oldest insert first.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts or replaces `key`. Returns `true` when the key was not present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.entries.insert(key.clone(), value).is_some() {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_key_evicted_past_capacity() {
        let mut map = BoundedMap::new(3);
        for i in 0..5 {
            assert!(map.insert(i, i * 10));
        }
        assert_eq!(map.len(), 3);
        assert!(!map.contains_key(&0));
        assert!(!map.contains_key(&1));
        assert_eq!(map.get(&4), Some(&40));
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut map = BoundedMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert!(!map.insert("a", 3));
        map.insert("c", 4);
        assert!(!map.contains_key(&"a"));
        assert_eq!(map.get(&"b"), Some(&2));
    }

    #[test]
    fn test_removed_key_can_return() {
        let mut map = BoundedMap::new(2);
        map.insert("a", ());
        assert_eq!(map.remove(&"a"), Some(()));
        assert!(map.insert("a", ()));
        map.insert("b", ());
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&"a"));
    }
}
