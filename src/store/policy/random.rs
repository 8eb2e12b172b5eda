//! Random eviction.
//!
//! Tracked keys live in a flat vector with a key-to-slot index; removal swaps
//! the victim slot with the last element and truncates, so every operation is
//! O(1). Victim selection samples uniformly. The random source is injectable
//! so tests can pin a seed.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::EvictionPolicy;

pub struct RandomPolicy {
    items: Vec<String>,
    slots: HashMap<String, usize>,
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            items: Vec::new(),
            slots: HashMap::new(),
            rng,
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for RandomPolicy {
    fn on_access(&mut self, _key: &str) {
        // Access patterns do not influence eviction probability.
    }

    fn on_add(&mut self, key: &str) {
        if self.slots.contains_key(key) {
            return;
        }
        self.slots.insert(key.to_string(), self.items.len());
        self.items.push(key.to_string());
    }

    fn on_remove(&mut self, key: &str) {
        if let Some(slot) = self.slots.remove(key) {
            self.items.swap_remove(slot);
            if slot < self.items.len() {
                self.slots.insert(self.items[slot].clone(), slot);
            }
        }
    }

    fn select_victim(&mut self) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.items.len());
        Some(self.items[idx].clone())
    }
}
