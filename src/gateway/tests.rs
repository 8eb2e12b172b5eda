#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::consensus::Command;
    use crate::error::{CacheError, Result};
    use crate::gateway::{Consensus, ConsistencyMode, Gateway, Storage};
    use crate::metrics::Metrics;
    use crate::ring::HashRing;

    /// Storage stub with an artificial lookup delay and a call counter.
    struct MockStorage {
        data: Mutex<HashMap<String, String>>,
        calls: AtomicUsize,
    }

    impl MockStorage {
        fn with(data: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Storage for MockStorage {
        fn get(&self, key: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulate slow storage so concurrent readers pile up.
            std::thread::sleep(Duration::from_millis(10));
            self.data.lock().unwrap().get(key).cloned()
        }

        fn set(&self, key: &str, value: &str, _ttl: Duration) {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        fn delete(&self, key: &str) {
            self.data.lock().unwrap().remove(key);
        }
    }

    /// Consensus stub recording submissions; behavior switches per test.
    #[derive(Default)]
    struct MockConsensus {
        submitted: Mutex<Vec<Vec<u8>>>,
        fail_verify: bool,
        not_leader: bool,
        voters: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Consensus for MockConsensus {
        async fn submit(&self, data: Vec<u8>) -> Result<()> {
            if self.not_leader {
                return Err(CacheError::NotLeader);
            }
            self.submitted.lock().unwrap().push(data);
            Ok(())
        }

        async fn verify_leader(&self) -> Result<()> {
            if self.fail_verify {
                Err(CacheError::NotLeader)
            } else {
                Ok(())
            }
        }

        async fn add_voter(&self, node_id: &str, addr: &str) -> Result<()> {
            self.voters
                .lock()
                .unwrap()
                .push((node_id.to_string(), addr.to_string()));
            Ok(())
        }

        async fn is_leader(&self) -> bool {
            !self.not_leader
        }
    }

    fn gateway(
        storage: Arc<MockStorage>,
        consensus: Arc<MockConsensus>,
        mode: ConsistencyMode,
    ) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            storage,
            consensus,
            Arc::new(HashRing::new(10)),
            Arc::new(Metrics::new()),
            mode,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_coalesce() {
        let storage = MockStorage::with(&[("key1", "value1")]);
        let consensus = Arc::new(MockConsensus::default());
        let gw = gateway(storage.clone(), consensus, ConsistencyMode::Eventual);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let gw = gw.clone();
            handles.push(tokio::spawn(async move { gw.get("key1").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "value1");
        }

        let calls = storage.calls.load(Ordering::SeqCst);
        assert!(
            calls <= 20,
            "expected coalesced lookups, saw {} store calls",
            calls
        );
    }

    #[tokio::test]
    async fn set_submits_an_encoded_command() {
        let storage = MockStorage::with(&[]);
        let consensus = Arc::new(MockConsensus::default());
        let gw = gateway(storage, consensus.clone(), ConsistencyMode::Eventual);

        gw.set("k", "v", Duration::from_secs(9)).await.unwrap();

        let submitted = consensus.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let cmd = Command::decode(&submitted[0]).unwrap();
        assert_eq!(cmd, Command::set("k", "v", Duration::from_secs(9)));
    }

    #[tokio::test]
    async fn delete_submits_an_encoded_command() {
        let storage = MockStorage::with(&[]);
        let consensus = Arc::new(MockConsensus::default());
        let gw = gateway(storage, consensus.clone(), ConsistencyMode::Eventual);

        gw.delete("k").await.unwrap();

        let submitted = consensus.submitted.lock().unwrap();
        assert_eq!(Command::decode(&submitted[0]).unwrap(), Command::delete("k"));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let storage = MockStorage::with(&[]);
        let consensus = Arc::new(MockConsensus::default());
        let gw = gateway(storage, consensus, ConsistencyMode::Eventual);

        assert!(matches!(gw.get("ghost").await, Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn strong_read_fails_without_leadership() {
        // A leader cut off from the majority must refuse to serve rather
        // than return a possibly stale value.
        let storage = MockStorage::with(&[("k", "stale")]);
        let consensus = Arc::new(MockConsensus {
            fail_verify: true,
            ..Default::default()
        });
        let gw = gateway(storage.clone(), consensus, ConsistencyMode::Strong);

        assert!(matches!(
            gw.get("k").await,
            Err(CacheError::Consistency(_))
        ));
        // The store must not even have been consulted.
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn eventual_read_skips_verification() {
        let storage = MockStorage::with(&[("k", "v")]);
        let consensus = Arc::new(MockConsensus {
            fail_verify: true,
            ..Default::default()
        });
        let gw = gateway(storage, consensus, ConsistencyMode::Eventual);

        assert_eq!(gw.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn submit_errors_propagate_unchanged() {
        let storage = MockStorage::with(&[]);
        let consensus = Arc::new(MockConsensus {
            not_leader: true,
            ..Default::default()
        });
        let gw = gateway(storage, consensus, ConsistencyMode::Eventual);

        assert!(matches!(
            gw.set("k", "v", Duration::ZERO).await,
            Err(CacheError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn join_registers_voter_and_ring_member() {
        let storage = MockStorage::with(&[]);
        let consensus = Arc::new(MockConsensus::default());
        let gw = gateway(storage, consensus.clone(), ConsistencyMode::Eventual);

        gw.join("node2", "127.0.0.1:11002").await.unwrap();

        let voters = consensus.voters.lock().unwrap();
        assert_eq!(voters[0], ("node2".to_string(), "127.0.0.1:11002".to_string()));
        assert_eq!(gw.locate("anything"), Some("node2".to_string()));
    }

    #[test]
    fn consistency_mode_parsing() {
        assert_eq!(ConsistencyMode::parse("strong"), ConsistencyMode::Strong);
        assert_eq!(ConsistencyMode::parse("EVENTUAL"), ConsistencyMode::Eventual);
        assert_eq!(ConsistencyMode::parse("bogus"), ConsistencyMode::Strong);
    }
}
