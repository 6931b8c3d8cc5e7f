use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Set with FIFO eviction: once more than `capacity` keys have been inserted,
/// the oldest ones are forgotten. Size never exceeds `capacity`.
///
/// Removal is lazy: the eviction queue keeps a stamped entry per insert and
/// entries whose stamp no longer matches the live member are skipped.
#[derive(Debug, Clone)]
pub struct BoundedWindow<K> {
    members: HashMap<K, u64>,
    order: VecDeque<(K, u64)>,
    capacity: usize,
    next_stamp: u64,
}

impl<K: Hash + Eq + Clone> BoundedWindow<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            members: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            next_stamp: 0,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains_key(key)
    }

    /// Returns `false` when the key is already in the window.
    pub fn insert(&mut self, key: K) -> bool {
        if self.members.contains_key(&key) {
            return false;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.members.insert(key.clone(), stamp);
        self.order.push_back((key, stamp));
        while self.members.len() > self.capacity {
            let Some((oldest, stamp)) = self.order.pop_front() else {
                break;
            };
            if self.members.get(&oldest) == Some(&stamp) {
                self.members.remove(&oldest);
            }
        }
        true
    }

    /// Forget `key`. Returns `true` when it was in the window.
    pub fn remove(&mut self, key: &K) -> bool {
        if self.members.remove(key).is_none() {
            return false;
        }
        if self.order.len() > self.capacity * 2 {
            let members = &self.members;
            self.order
                .retain(|(key, stamp)| members.get(key) == Some(stamp));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }

    /// Replace the contents with `keys`, oldest first.
    pub fn rebuild<I: IntoIterator<Item = K>>(&mut self, keys: I) {
        self.clear();
        for key in keys {
            self.insert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedWindow;

    #[test]
    fn rejects_keys_still_in_window() {
        let mut window = BoundedWindow::new(3);
        assert!(window.insert(1));
        assert!(!window.insert(1));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut window = BoundedWindow::new(3);
        for key in 1..=4 {
            assert!(window.insert(key));
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains(&1));
        assert!(window.contains(&2));
        assert!(window.contains(&4));
        // 2 is still within the window, so it stays a duplicate.
        assert!(!window.insert(2));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut window = BoundedWindow::new(16);
        for key in 0..1000_u64 {
            window.insert(key);
            assert!(window.len() <= 16);
        }
    }

    #[test]
    fn rebuild_replaces_contents() {
        let mut window = BoundedWindow::new(4);
        window.rebuild([1, 2, 3]);
        window.rebuild([7, 8]);
        assert_eq!(window.len(), 2);
        assert!(!window.contains(&1));
        assert!(window.contains(&8));
    }

    #[test]
    fn removed_key_can_return_without_early_eviction() {
        let mut window = BoundedWindow::new(3);
        window.rebuild([1, 2, 3]);
        assert!(window.remove(&1));
        assert!(!window.remove(&1));
        assert!(window.insert(1));
        // The stale queue entry for the first 1 must not evict the new one.
        assert!(window.insert(4));
        assert!(!window.contains(&2));
        assert!(window.contains(&1));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn churn_keeps_the_queue_bounded() {
        let mut window = BoundedWindow::new(4);
        for _ in 0..1000 {
            window.insert(7_u64);
            window.remove(&7);
        }
        assert!(window.is_empty());
        assert!(window.order.len() <= 9);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut window = BoundedWindow::new(0);
        assert_eq!(window.capacity(), 1);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.contains(&"a"));
    }
}
