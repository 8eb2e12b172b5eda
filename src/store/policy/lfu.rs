//! Least Frequently Used eviction.
//!
//! An ordered set of `(frequency, key)` pairs doubles as a min-heap with
//! O(log n) removal by key, backed by a key-to-frequency index so updates can
//! locate the pair to re-insert. The victim is the smallest pair (a peek, not
//! a pop; the store removes it and notifies `on_remove` afterwards). Among
//! keys with equal frequency the ordering is an internal detail.

use std::collections::{BTreeSet, HashMap};

use super::EvictionPolicy;

#[derive(Debug, Default)]
pub struct LfuPolicy {
    /// Min-ordered (frequency, key) pairs.
    queue: BTreeSet<(u64, String)>,
    /// Current frequency per tracked key.
    freqs: HashMap<String, u64>,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, key: &str) {
        if let Some(freq) = self.freqs.get_mut(key) {
            self.queue.remove(&(*freq, key.to_string()));
            *freq += 1;
            self.queue.insert((*freq, key.to_string()));
        }
    }
}

impl EvictionPolicy for LfuPolicy {
    fn on_access(&mut self, key: &str) {
        self.bump(key);
    }

    fn on_add(&mut self, key: &str) {
        if self.freqs.contains_key(key) {
            self.bump(key);
            return;
        }
        self.freqs.insert(key.to_string(), 1);
        self.queue.insert((1, key.to_string()));
    }

    fn on_remove(&mut self, key: &str) {
        if let Some(freq) = self.freqs.remove(key) {
            self.queue.remove(&(freq, key.to_string()));
        }
    }

    fn select_victim(&mut self) -> Option<String> {
        self.queue.iter().next().map(|(_, key)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_has_minimum_frequency() {
        let mut lfu = LfuPolicy::new();
        lfu.on_add("a");
        lfu.on_add("b");
        lfu.on_add("c");

        // a=3, b=2, c=1.
        lfu.on_access("a");
        lfu.on_access("a");
        lfu.on_access("b");

        assert_eq!(lfu.select_victim(), Some("c".to_string()));

        lfu.on_remove("c");
        assert_eq!(lfu.select_victim(), Some("b".to_string()));
    }

    #[test]
    fn add_on_tracked_key_counts_as_access() {
        let mut lfu = LfuPolicy::new();
        lfu.on_add("a");
        lfu.on_add("b");
        lfu.on_add("a"); // a=2, b=1
        assert_eq!(lfu.select_victim(), Some("b".to_string()));
    }

    #[test]
    fn tie_victim_is_one_of_the_tracked_keys() {
        let mut lfu = LfuPolicy::new();
        lfu.on_add("x");
        lfu.on_add("y");

        // Equal frequencies: the tie order is unspecified, only membership
        // is guaranteed.
        let victim = lfu.select_victim().unwrap();
        assert!(victim == "x" || victim == "y");
    }

    #[test]
    fn removed_key_never_selected() {
        let mut lfu = LfuPolicy::new();
        lfu.on_add("a");
        lfu.on_remove("a");
        assert_eq!(lfu.select_victim(), None);
    }
}
