//! HTTP endpoint handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Query};
use serde::Deserialize;

use crate::error::{CacheError, Result};
use crate::gateway::Gateway;
use crate::metrics::Metrics;

#[derive(Debug, Deserialize)]
pub struct SetParams {
    key: Option<String>,
    value: Option<String>,
    /// TTL in seconds; absent or 0 means the item never expires.
    ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct KeyParams {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    node_id: Option<String>,
    addr: Option<String>,
}

fn required(value: Option<String>, name: &'static str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(CacheError::MissingParam(name))
}

/// `GET /set?key=K&value=V[&ttl=S]`
pub async fn handle_set(
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<SetParams>,
) -> Result<&'static str> {
    let key = required(params.key, "key")?;
    let value = params.value.unwrap_or_default();
    let ttl = Duration::from_secs(params.ttl.unwrap_or(0));

    gateway.set(&key, &value, ttl).await?;
    Ok("ok")
}

/// `GET /get?key=K`. The body is the raw value; 404 when absent or expired.
pub async fn handle_get(
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<KeyParams>,
) -> Result<String> {
    let key = required(params.key, "key")?;
    gateway.get(&key).await
}

/// `GET /delete?key=K`
pub async fn handle_delete(
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<KeyParams>,
) -> Result<&'static str> {
    let key = required(params.key, "key")?;
    gateway.delete(&key).await?;
    Ok("ok")
}

/// `GET /join?node_id=N&addr=A` admits a new cluster member.
pub async fn handle_join(
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<JoinParams>,
) -> Result<&'static str> {
    let node_id = required(params.node_id, "node_id")?;
    let addr = required(params.addr, "addr")?;

    gateway.join(&node_id, &addr).await?;
    Ok("joined")
}

/// `GET /locate?key=K` returns the consistent-hash routing hint.
pub async fn handle_locate(
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<KeyParams>,
) -> Result<String> {
    let key = required(params.key, "key")?;
    gateway.locate(&key).ok_or(CacheError::NotFound)
}

/// `GET /health`
pub async fn handle_health() -> &'static str {
    "ok"
}

/// `GET /metrics` in Prometheus text format.
pub async fn handle_metrics(Extension(metrics): Extension<Arc<Metrics>>) -> String {
    metrics.to_prometheus_text()
}
