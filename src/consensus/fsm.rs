//! Finite state machine adapter.
//!
//! Translates committed log entries into store mutations. The FSM caches no
//! state of its own: all state lives in the store, which also serves as the
//! snapshot source.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::consensus::command::Command;
use crate::consensus::snapshots::SnapshotSink;
use crate::error::{CacheError, Result};
use crate::store::Store;

/// Applies committed commands to the local store.
#[derive(Clone)]
pub struct CacheFsm {
    store: Arc<Store>,
}

impl CacheFsm {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Applies a single committed entry.
    ///
    /// Deterministic and idempotent under replay of the same entry. A decode
    /// failure is returned (and recorded in the log result), never panicked
    /// on: a malformed command must not take the node down or corrupt state.
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        let command = Command::decode(data)
            .map_err(|e| CacheError::Codec(format!("undecodable log entry: {}", e)))?;

        match command {
            Command::Set {
                key,
                value,
                ttl_nanos,
            } => {
                self.store.set(&key, &value, Duration::from_nanos(ttl_nanos));
            }
            Command::Delete { key } => {
                self.store.delete(&key);
            }
        }
        Ok(())
    }

    /// Returns a snapshot handle over the live store.
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            store: self.store.clone(),
        }
    }

    /// Replaces the store contents from a serialized snapshot.
    pub fn restore<R: Read>(&self, reader: &mut R) -> Result<()> {
        self.store.restore(reader)
    }
}

/// A point-in-time snapshot request.
///
/// Invoked once with a sink; on success the sink is closed (publishing the
/// snapshot), on failure it is cancelled so the partial file is discarded.
/// Dropping the handle without persisting is a no-op; the store stays live.
pub struct FsmSnapshot {
    store: Arc<Store>,
}

impl FsmSnapshot {
    pub fn persist(self, mut sink: SnapshotSink) -> Result<()> {
        match self.store.snapshot(&mut sink) {
            Ok(()) => sink.close(),
            Err(e) => {
                sink.cancel();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_set_and_delete() {
        let store = Arc::new(Store::new());
        let fsm = CacheFsm::new(store.clone());

        let set = Command::set("k", "v", Duration::ZERO).encode().unwrap();
        fsm.apply(&set).unwrap();
        assert_eq!(store.get("k"), Some("v".to_string()));

        let del = Command::delete("k").encode().unwrap();
        fsm.apply(&del).unwrap();
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn apply_is_idempotent() {
        let store = Arc::new(Store::new());
        let fsm = CacheFsm::new(store.clone());

        let set = Command::set("k", "v", Duration::ZERO).encode().unwrap();
        fsm.apply(&set).unwrap();
        fsm.apply(&set).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k"), Some("v".to_string()));
    }

    #[test]
    fn malformed_entry_returns_error_without_corrupting_state() {
        let store = Arc::new(Store::new());
        let fsm = CacheFsm::new(store.clone());
        store.set("existing", "v", Duration::ZERO);

        let result = fsm.apply(&[0x00, 0x01, 0x02, 0xff]);
        assert!(matches!(result, Err(CacheError::Codec(_))));
        assert_eq!(store.get("existing"), Some("v".to_string()));
    }
}
