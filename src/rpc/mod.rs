//! Binary RPC Server
//!
//! The binary equivalent of the HTTP surface: framed bincode requests over
//! TCP, one response per request, many requests per connection. Like the
//! HTTP translator this is a thin layer over the gateway.

pub mod protocol;

use std::sync::Arc;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::CacheError;
use crate::gateway::Gateway;
use self::protocol::{RpcRequest, RpcResponse};

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Accepts RPC connections and serves them until the process exits.
pub fn spawn_server(listener: TcpListener, gateway: Arc<Gateway>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = gateway.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, gateway).await {
                            debug!("RPC connection from {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed on RPC listener: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn serve_connection(mut stream: TcpStream, gateway: Arc<Gateway>) -> io::Result<()> {
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = handle_request(request, &gateway).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn handle_request(request: RpcRequest, gateway: &Gateway) -> RpcResponse {
    match request {
        RpcRequest::Get { key } => match gateway.get(&key).await {
            Ok(value) => RpcResponse::Get { value, found: true },
            Err(CacheError::NotFound) => RpcResponse::Get {
                value: String::new(),
                found: false,
            },
            Err(e) => RpcResponse::Error {
                message: e.to_string(),
            },
        },
        RpcRequest::Set {
            key,
            value,
            ttl_seconds,
        } => {
            let ttl = std::time::Duration::from_secs(ttl_seconds);
            match gateway.set(&key, &value, ttl).await {
                Ok(()) => RpcResponse::Set { success: true },
                Err(e) => {
                    debug!("RPC set failed: {}", e);
                    RpcResponse::Set { success: false }
                }
            }
        }
        RpcRequest::Delete { key } => match gateway.delete(&key).await {
            Ok(()) => RpcResponse::Delete { success: true },
            Err(e) => {
                debug!("RPC delete failed: {}", e);
                RpcResponse::Delete { success: false }
            }
        },
    }
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<RpcRequest>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "oversized RPC frame",
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    bincode::deserialize(&frame)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame(stream: &mut TcpStream, response: &RpcResponse) -> io::Result<()> {
    let frame =
        bincode::serialize(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Minimal client used by tests and tooling.
pub async fn call(addr: &str, request: &RpcRequest) -> io::Result<RpcResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let frame =
        bincode::serialize(request).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::consensus::CacheFsm;
    use crate::error::Result;
    use crate::gateway::{Consensus, ConsistencyMode};
    use crate::metrics::Metrics;
    use crate::ring::HashRing;
    use crate::store::Store;

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

    async fn rpc_fixture() -> String {
        let store = Arc::new(Store::new());
        let consensus = Arc::new(LoopbackConsensus {
            fsm: CacheFsm::new(store.clone()),
        });
        let gateway = Arc::new(Gateway::new(
            store,
            consensus,
            Arc::new(HashRing::new(10)),
            Arc::new(Metrics::new()),
            ConsistencyMode::Eventual,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        spawn_server(listener, gateway);
        addr
    }

    #[tokio::test]
    async fn set_get_delete_over_rpc() {
        let addr = rpc_fixture().await;

        let response = call(
            &addr,
            &RpcRequest::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                ttl_seconds: 0,
            },
        )
        .await
        .unwrap();
        assert_eq!(response, RpcResponse::Set { success: true });

        let response = call(
            &addr,
            &RpcRequest::Get {
                key: "k".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            response,
            RpcResponse::Get {
                value: "v".to_string(),
                found: true
            }
        );

        let response = call(
            &addr,
            &RpcRequest::Delete {
                key: "k".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response, RpcResponse::Delete { success: true });
    }

    #[tokio::test]
    async fn get_miss_is_found_false_not_an_error() {
        let addr = rpc_fixture().await;

        let response = call(
            &addr,
            &RpcRequest::Get {
                key: "ghost".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            response,
            RpcResponse::Get {
                value: String::new(),
                found: false
            }
        );
    }

    #[tokio::test]
    async fn ttl_is_in_seconds() {
        let addr = rpc_fixture().await;

        call(
            &addr,
            &RpcRequest::Set {
                key: "t".to_string(),
                value: "x".to_string(),
                ttl_seconds: 1,
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let response = call(
            &addr,
            &RpcRequest::Get {
                key: "t".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, RpcResponse::Get { found: false, .. }));
    }
}
