//! Eviction Policies
//!
//! Pluggable order-tracking structures that advise the store which key to
//! evict when it is at capacity. The store invokes the callbacks under its
//! own lock, so implementations hold no locks of their own.
//!
//! ## Contract
//! - `select_victim` returns a currently tracked key, or `None` when empty.
//! - After `on_remove(k)`, `k` is never returned as a victim.
//! - `on_add` on an already-tracked key behaves like `on_access`.

mod fifo;
mod lfu;
mod lru;
mod random;

pub use fifo::FifoPolicy;
pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use random::RandomPolicy;

/// Interface for eviction algorithms.
///
/// The store owns the policy and drives every callback, which keeps policy
/// state consistent with the set of resident keys.
pub trait EvictionPolicy: Send + Sync {
    /// Signals a hit on an existing key.
    fn on_access(&mut self, key: &str);

    /// Signals a fresh insertion.
    fn on_add(&mut self, key: &str);

    /// Signals an external deletion (manual delete, sweep or eviction).
    fn on_remove(&mut self, key: &str);

    /// Names a candidate for eviction without removing it.
    fn select_victim(&mut self) -> Option<String>;
}

/// Builds a policy from its configuration name.
///
/// `none` disables eviction entirely. Unknown names fall back to LRU.
pub fn build(name: &str) -> Option<Box<dyn EvictionPolicy>> {
    match name.to_lowercase().as_str() {
        "lru" => Some(Box::new(LruPolicy::new())),
        "fifo" => Some(Box::new(FifoPolicy::new())),
        "lfu" => Some(Box::new(LfuPolicy::new())),
        "random" => Some(Box::new(RandomPolicy::new())),
        "none" => None,
        other => {
            tracing::warn!("Unknown eviction policy '{}', defaulting to LRU", other);
            Some(Box::new(LruPolicy::new()))
        }
    }
}
