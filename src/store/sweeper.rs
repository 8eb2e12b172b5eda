//! Background task that periodically removes expired items.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::Store;

/// Spawns the expiration sweep loop.
///
/// Each pass takes the store's exclusive lock, drops every expired item and
/// releases the lock before sleeping again. The returned handle can be
/// aborted during shutdown.
pub fn spawn_sweeper(store: Arc<Store>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting expiration sweeper (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                info!("Sweep reclaimed {} expired item(s)", removed);
            } else {
                debug!("Sweep found nothing to reclaim");
            }
        }
    })
}
