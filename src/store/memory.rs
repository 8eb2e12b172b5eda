//! The store itself: a locked map of items plus the eviction policy.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::store::policy::EvictionPolicy;

const SNAPSHOT_MAGIC: [u8; 4] = *b"DCSS";
const SNAPSHOT_VERSION: u8 = 1;

/// A single cached value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: String,
    /// Unix timestamp in nanoseconds when this item expires. 0 means never.
    pub expiration: u64,
}

impl Item {
    fn expired_at(&self, now: u64) -> bool {
        self.expiration > 0 && now > self.expiration
    }
}

/// Snapshot header carrying a version tag so the on-disk format can evolve
/// across releases.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: [u8; 4],
    version: u8,
    count: u64,
}

struct Inner {
    items: HashMap<String, Item>,
    policy: Option<Box<dyn EvictionPolicy>>,
}

/// Thread-safe in-memory key-value cache with TTL-based expiration.
///
/// Capacity 0 means unbounded; with a positive capacity and a policy, the
/// resident item count never exceeds capacity after a completed mutation.
pub struct Store {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Store {
    /// Creates an unbounded store with no eviction policy.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                policy: None,
            }),
            capacity: 0,
        }
    }

    /// Sets the maximum number of resident items. Immutable after
    /// construction.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the eviction policy consulted when the store is full.
    pub fn with_policy(self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .policy = Some(policy);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retrieves the value for `key` if present and unexpired.
    ///
    /// Takes the exclusive lock because a hit updates the policy. Expired
    /// entries are reported absent without touching storage; the sweeper
    /// reclaims them.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_nanos();
        let mut guard = self.write();
        let inner = &mut *guard;

        let value = match inner.items.get(key) {
            Some(item) if !item.expired_at(now) => item.value.clone(),
            _ => return None,
        };

        if let Some(policy) = inner.policy.as_mut() {
            policy.on_access(key);
        }
        Some(value)
    }

    /// Inserts or overwrites `key` with the given TTL. A zero TTL means the
    /// item never expires.
    ///
    /// A set on an expired-but-resident key counts as a fresh insertion,
    /// because the old item is already logically absent.
    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let now = now_nanos();
        let mut guard = self.write();
        let inner = &mut *guard;

        let live = inner
            .items
            .get(key)
            .map(|item| !item.expired_at(now))
            .unwrap_or(false);

        if live {
            if let Some(policy) = inner.policy.as_mut() {
                policy.on_access(key);
            }
        } else {
            if inner.items.remove(key).is_some() {
                if let Some(policy) = inner.policy.as_mut() {
                    policy.on_remove(key);
                }
            }

            // Evict before inserting so the bound holds after the mutation.
            if self.capacity > 0 && inner.items.len() >= self.capacity {
                let victim = inner
                    .policy
                    .as_mut()
                    .and_then(|policy| policy.select_victim());
                if let Some(victim) = victim {
                    inner.items.remove(&victim);
                    if let Some(policy) = inner.policy.as_mut() {
                        policy.on_remove(&victim);
                    }
                    tracing::debug!("Evicted '{}' to make room for '{}'", victim, key);
                }
            }

            if let Some(policy) = inner.policy.as_mut() {
                policy.on_add(key);
            }
        }

        let expiration = if ttl.is_zero() {
            0
        } else {
            now + ttl.as_nanos() as u64
        };

        inner.items.insert(
            key.to_string(),
            Item {
                value: value.to_string(),
                expiration,
            },
        );
    }

    /// Removes `key` if present; a no-op otherwise.
    pub fn delete(&self, key: &str) {
        let mut guard = self.write();
        let inner = &mut *guard;
        if inner.items.remove(key).is_some() {
            if let Some(policy) = inner.policy.as_mut() {
                policy.on_remove(key);
            }
        }
    }

    /// Removes every expired item, returning how many were reclaimed.
    ///
    /// The policy is notified for each removal so its candidate set stays in
    /// step with the resident keys.
    pub fn sweep(&self) -> usize {
        let now = now_nanos();
        let mut guard = self.write();
        let inner = &mut *guard;

        let expired: Vec<String> = inner
            .items
            .iter()
            .filter(|(_, item)| item.expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.items.remove(key);
            if let Some(policy) = inner.policy.as_mut() {
                policy.on_remove(key);
            }
        }
        expired.len()
    }

    /// Number of resident items, expired or not.
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    /// Serializes the full store state to `w`.
    ///
    /// Layout: a versioned header followed by `(key, value, expiration)`
    /// triples. Used by the consensus layer to take state machine snapshots.
    pub fn snapshot<W: Write>(&self, w: &mut W) -> Result<()> {
        let guard = self.read();
        let header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            count: guard.items.len() as u64,
        };
        bincode::serialize_into(&mut *w, &header)?;
        for (key, item) in &guard.items {
            bincode::serialize_into(&mut *w, &(key, &item.value, item.expiration))?;
        }
        Ok(())
    }

    /// Replaces the store contents with the state read from `r`.
    pub fn restore<R: Read>(&self, r: &mut R) -> Result<()> {
        let header: SnapshotHeader = bincode::deserialize_from(&mut *r)?;
        if header.magic != SNAPSHOT_MAGIC {
            return Err(CacheError::Codec("bad snapshot magic".to_string()));
        }
        if header.version != SNAPSHOT_VERSION {
            return Err(CacheError::Codec(format!(
                "unsupported snapshot version {}",
                header.version
            )));
        }

        let mut items = HashMap::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let (key, value, expiration): (String, String, u64) =
                bincode::deserialize_from(&mut *r)?;
            items.insert(key, Item { value, expiration });
        }

        let mut guard = self.write();
        let inner = &mut *guard;
        if let Some(policy) = inner.policy.as_mut() {
            for key in inner.items.keys() {
                policy.on_remove(key);
            }
            for key in items.keys() {
                policy.on_add(key);
            }
        }
        inner.items = items;
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Current Unix timestamp in nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
