//! HTTP API
//!
//! Thin translator between HTTP and the gateway. Handlers validate query
//! parameters, delegate, and map errors onto status codes (400 validation,
//! 404 not-found, 500 everything else). `/set` is exposed via GET as a
//! demonstration convenience; production deployments should front it with
//! POST.

pub mod handlers;

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::get;
use axum::Router;

use crate::gateway::Gateway;
use crate::metrics::Metrics;

/// Builds the router with all cache endpoints.
pub fn router(gateway: Arc<Gateway>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/set", get(handlers::handle_set))
        .route("/get", get(handlers::handle_get))
        .route("/delete", get(handlers::handle_delete))
        .route("/join", get(handlers::handle_join))
        .route("/locate", get(handlers::handle_locate))
        .route("/health", get(handlers::handle_health))
        .route("/metrics", get(handlers::handle_metrics))
        .layer(Extension(gateway))
        .layer(Extension(metrics))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use super::*;
    use crate::consensus::CacheFsm;
    use crate::error::Result;
    use crate::gateway::{Consensus, ConsistencyMode};
    use crate::ring::HashRing;
    use crate::store::Store;

    /// Applies submitted commands straight to the store, standing in for a
    /// single-node committed log.
    struct LoopbackConsensus {
        fsm: CacheFsm,
    }

    #[async_trait]
    impl Consensus for LoopbackConsensus {
        async fn submit(&self, data: Vec<u8>) -> Result<()> {
            self.fsm.apply(&data)
        }

        async fn verify_leader(&self) -> Result<()> {
            Ok(())
        }

        async fn add_voter(&self, _node_id: &str, _addr: &str) -> Result<()> {
            Ok(())
        }

        async fn is_leader(&self) -> bool {
            true
        }
    }

    fn test_app() -> Router {
        let store = Arc::new(Store::new());
        let consensus = Arc::new(LoopbackConsensus {
            fsm: CacheFsm::new(store.clone()),
        });
        let metrics = Arc::new(Metrics::new());
        let gateway = Arc::new(Gateway::new(
            store,
            consensus,
            Arc::new(HashRing::new(10)),
            metrics.clone(),
            ConsistencyMode::Strong,
        ));
        router(gateway, metrics)
    }

    async fn request(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_app();
        let (status, body) = request(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let app = test_app();

        let (status, body) = request(&app, "/set?key=k&value=v").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = request(&app, "/get?key=k").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "v");
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let app = test_app();
        request(&app, "/set?key=t&value=x&ttl=1").await;

        let (status, _) = request(&app, "/get?key=t").await;
        assert_eq!(status, StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let (status, _) = request(&app, "/get?key=t").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_key_param_is_bad_request() {
        let app = test_app();
        let (status, _) = request(&app, "/set?value=v").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = request(&app, "/get").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn absent_key_is_not_found() {
        let app = test_app();
        let (status, _) = request(&app, "/get?key=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_a_key() {
        let app = test_app();
        request(&app, "/set?key=k&value=v").await;

        let (status, body) = request(&app, "/delete?key=k").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        let (status, _) = request(&app, "/get?key=k").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn join_requires_both_params() {
        let app = test_app();
        let (status, _) = request(&app, "/join?node_id=n2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = request(&app, "/join?node_id=n2&addr=127.0.0.1:1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "joined");
    }

    #[tokio::test]
    async fn metrics_export_in_prometheus_format() {
        let app = test_app();
        request(&app, "/set?key=k&value=v").await;
        request(&app, "/get?key=k").await;

        let (status, body) = request(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("cache_operations_total"));
        assert!(body.contains("cache_hits_total 1"));
        assert!(body.contains("cache_duration_seconds_bucket"));
    }
}
