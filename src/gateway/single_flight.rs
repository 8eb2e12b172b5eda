//! Single-flight request coalescing.
//!
//! Duplicate concurrent requests for the same key share one execution: the
//! first caller in a group runs the closure, everyone else waits on the
//! shared cell and receives a clone of the result. The map lock is released
//! before the closure runs, so coalesced work never serializes unrelated
//! keys.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` for `key`, coalescing with any concurrent call for the same
    /// key. Both values and not-found sentinels are legitimate shared
    /// outcomes; the closure must be pure with respect to the state it reads.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(f).await.clone();

        // Retire the flight so later requests observe fresh state. Every
        // caller attempts this; only the matching cell is removed.
        {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = flights.get(key) {
                if Arc::ptr_eq(current, &cell) {
                    flights.remove(key);
                }
            }
        }

        value
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("hot", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Some("value".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some("value".to_string()));
        }

        let calls = executions.load(Ordering::SeqCst);
        assert!(calls <= 20, "expected coalescing, saw {} executions", calls);
        assert_eq!(flight.in_flight(), 0, "flight map should drain");
    }

    #[tokio::test]
    async fn not_found_is_shared_like_a_hit() {
        let flight: SingleFlight<Option<String>> = SingleFlight::new();
        let result = flight.run("missing", || async { None }).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(&format!("key{}", i), || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        i
                    })
                    .await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn sequential_calls_rerun() {
        let flight: SingleFlight<i32> = SingleFlight::new();
        let a = flight.run("k", || async { 1 }).await;
        let b = flight.run("k", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }
}
