//! Insertion-ordered index of live connections, oldest first.
//!
//! Reaping walks from the front, so the connections that have been around
//! longest go first regardless of what state they are in.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// FIFO of keys with O(1) membership checks.
#[derive(Debug, Clone)]
pub struct AgingQueue<K> {
    order: VecDeque<K>,
    members: HashSet<K>,
}

impl<K> Default for AgingQueue<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> AgingQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key` as the youngest entry.  Re-pushing a member is a no-op.
    pub fn push(&mut self, key: K) {
        if self.members.insert(key) {
            self.order.push_back(key);
        }
    }

    /// Remove and return the entry that has been queued longest.
    pub fn pop_oldest(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    /// Remove `key` wherever it sits.  Returns false if it was not queued.
    pub fn erase(&mut self, key: K) -> bool {
        if !self.members.remove(&key) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        true
    }

    pub fn contains(&self, key: K) -> bool {
        self.members.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Oldest to youngest.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_insertion_order() {
        let mut q = AgingQueue::new();
        for k in [3u32, 1, 2] {
            q.push(k);
        }
        assert_eq!(q.pop_oldest(), Some(3));
        assert_eq!(q.pop_oldest(), Some(1));
        assert_eq!(q.pop_oldest(), Some(2));
        assert_eq!(q.pop_oldest(), None);
    }

    #[test]
    fn erase_from_the_middle_keeps_order() {
        let mut q = AgingQueue::new();
        for k in 0u32..5 {
            q.push(k);
        }
        assert!(q.erase(2));
        assert!(!q.erase(2));
        assert!(!q.contains(2));
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn duplicate_push_is_ignored() {
        let mut q = AgingQueue::new();
        q.push(7u32);
        q.push(8);
        q.push(7);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_oldest(), Some(7));
    }
}
