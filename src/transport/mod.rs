//! Consensus Transport
//!
//! The consensus port speaks a framed binary protocol, but in some
//! deployment environments the same port also receives HTTP health probes
//! from load balancers. The accept loop therefore peeks at the first byte
//! of every connection: ASCII letters that start common HTTP methods get a
//! minimal `200 OK` and a close, while binary traffic is handed to the
//! frame reader with the peeked byte replayed.
//!
//! ## Framing
//! `[0x01][u32 big-endian length][bincode Envelope]`. The frame tag is a
//! small binary code that can never collide with the HTTP method letters.
//! The envelope carries the sender's advertise address alongside the
//! protobuf-encoded raft message, which is how peers learn each other's
//! addresses without a separate discovery exchange.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::consensus::PeerRegistry;

/// Frame tag for a raft message envelope. Consensus frame tags are small
/// binary codes (0-3 range); HTTP methods start with uppercase ASCII.
pub const FRAME_RAFT: u8 = 0x01;

/// First bytes of GET, HEAD/... , POST/PUT/PATCH, CONNECT, OPTIONS, DELETE.
const HTTP_METHOD_BYTES: &[u8] = b"GHPCOD";

const HTTP_PROBE_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok";

/// Deadline for reading the first byte of a new connection.
const PEEK_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Wire envelope for one raft message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from_addr: String,
    payload: Vec<u8>,
}

/// A stream that replays one already-read byte before the underlying data.
pub struct PeekedStream<S> {
    peeked: Option<u8>,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(peeked: u8, inner: S) -> Self {
        Self {
            peeked: Some(peeked),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(byte) = this.peeked.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Runs the demultiplexing accept loop.
///
/// Decoded raft messages are forwarded to `messages`; sender addresses from
/// envelopes are recorded in `peers`.
pub fn spawn_listener(
    listener: TcpListener,
    messages: mpsc::Sender<Message>,
    peers: PeerRegistry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let messages = messages.clone();
                    let peers = peers.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, messages, peers).await;
                    });
                }
                Err(e) => {
                    error!("Accept failed on consensus listener: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn handle_connection(mut stream: TcpStream, messages: mpsc::Sender<Message>, peers: PeerRegistry) {
    // Peek exactly one byte under a short deadline; a slow or dead peer
    // blocks only its own connection.
    let mut first = [0u8; 1];
    let read = tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut first)).await;
    let n = match read {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Dropping connection, peek failed: {}", e);
            return;
        }
        Err(_) => {
            debug!("Dropping connection, peek timed out");
            return;
        }
    };
    if n == 0 {
        return;
    }

    if HTTP_METHOD_BYTES.contains(&first[0]) {
        // A health probe. Answer politely and never surface it to raft.
        if let Err(e) = stream.write_all(HTTP_PROBE_RESPONSE).await {
            debug!("Failed to answer health probe: {}", e);
        }
        let _ = stream.shutdown().await;
        return;
    }

    let mut conn = PeekedStream::new(first[0], stream);
    if let Err(e) = read_frames(&mut conn, &messages, &peers).await {
        debug!("Consensus connection closed: {}", e);
    }
}

async fn read_frames<S: AsyncRead + Unpin>(
    conn: &mut S,
    messages: &mpsc::Sender<Message>,
    peers: &PeerRegistry,
) -> io::Result<()> {
    loop {
        let mut tag = [0u8; 1];
        match conn.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        if tag[0] != FRAME_RAFT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame tag {:#04x}", tag[0]),
            ));
        }

        let mut len_buf = [0u8; 4];
        conn.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        let mut frame = vec![0u8; len];
        conn.read_exact(&mut frame).await?;

        let envelope: Envelope = bincode::deserialize(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let msg = Message::decode(&envelope.payload[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if msg.from != 0 && !envelope.from_addr.is_empty() {
            peers.insert(msg.from, envelope.from_addr);
        }
        if messages.send(msg).await.is_err() {
            // Runtime gone, nothing left to deliver to.
            return Ok(());
        }
    }
}

/// Sends one raft message to a peer, fire-and-forget.
///
/// A fresh connection per message keeps the sender trivial; raft retries
/// through its own heartbeat machinery, so a lost message only costs
/// latency.
pub fn send_message(addr: String, from_addr: String, msg: Message) {
    tokio::spawn(async move {
        if let Err(e) = try_send(&addr, from_addr, &msg).await {
            debug!("Failed to send raft message to {}: {}", addr, e);
        }
    });
}

async fn try_send(addr: &str, from_addr: String, msg: &Message) -> io::Result<()> {
    let envelope = Envelope {
        from_addr,
        payload: msg.encode_to_vec(),
    };
    let frame = bincode::serialize(&envelope)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if frame.len() > MAX_FRAME_BYTES {
        warn!("Refusing to send oversized raft frame ({} bytes)", frame.len());
        return Ok(());
    }

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&[FRAME_RAFT]).await?;
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}
