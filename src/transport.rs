//! Connection multiplexing for the shared RPC port.
//!
//! One TCP listener carries both the application gRPC traffic and the Raft
//! stream protocol. Incoming connections are classified by their first bytes:
//! gRPC-over-HTTP/2 connections open with the HTTP/2 client preface, while
//! Raft stream connections open with a four-byte magic written by
//! [`RaftListener::dial`]. Bytes read during classification are buffered and
//! replayed to the chosen side through [`PeekedStream`]; connections matching
//! neither signature are closed.
//!
//! The Raft side of the mux is a plain framed RPC protocol, one connection
//! per peer, reused across calls:
//!
//! ```text
//! request:  [1 byte rpc kind][u32 BE length][JSON payload]
//! response: [1 byte status  ][u32 BE length][JSON payload or error string]
//! ```
//!
//! Peers are dialed at the address advertised through gossip tags, resolved
//! via [`AddressDirectory`]; the address stored in the Raft configuration is
//! only the fallback. The directory is refreshed on every member join or
//! update, before any reconciliation runs, so topology changes never require
//! rewriting the Raft configuration.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, info};

/// HTTP/2 client connection preface; every gRPC connection starts with this.
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// Raft stream signature written by `dial` before the first frame.
pub const RAFT_MAGIC: [u8; 4] = [0xF5, b'T', b'V', b'1'];

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_DEPTH: usize = 64;
/// Upper bound on a single framed payload (a full snapshot chunk fits).
const MAX_FRAME: usize = 64 * 1024 * 1024;

// ── Address directory ─────────────────────────────────────────────────────────

/// Side-table mapping Raft server IDs to the RPC address their gossip tags
/// advertise. Populated by the agent's event dispatcher.
#[derive(Clone, Default)]
pub struct AddressDirectory {
    inner: Arc<RwLock<HashMap<u64, String>>>,
}

impl AddressDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, addr: String) {
        self.inner.write().unwrap().insert(id, addr);
    }

    pub fn lookup(&self, id: u64) -> Option<String> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) {
        self.inner.write().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

// ── Peeked stream ─────────────────────────────────────────────────────────────

/// A TCP stream with the bytes consumed during classification replayed in
/// front of the remaining socket data.
pub struct PeekedStream {
    inner: TcpStream,
    buffered: Vec<u8>,
    pos: usize,
}

impl PeekedStream {
    fn new(inner: TcpStream, buffered: Vec<u8>) -> Self {
        Self {
            inner,
            buffered,
            pos: 0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl AsyncRead for PeekedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.buffered.len() {
            let remaining = &self.buffered[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for PeekedStream {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

// ── Classification ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Grpc,
    Raft,
    Unknown,
}

/// Decide what a connection is from its first bytes. `None` means the prefix
/// is still consistent with one of the signatures and more bytes are needed.
fn classify(buf: &[u8]) -> Option<Protocol> {
    let raft_n = buf.len().min(RAFT_MAGIC.len());
    let raft_prefix = buf[..raft_n] == RAFT_MAGIC[..raft_n];
    if raft_prefix && buf.len() >= RAFT_MAGIC.len() {
        return Some(Protocol::Raft);
    }

    let http_n = buf.len().min(HTTP2_PREFACE.len());
    let http_prefix = buf[..http_n] == HTTP2_PREFACE[..http_n];
    if http_prefix && buf.len() >= HTTP2_PREFACE.len() {
        return Some(Protocol::Grpc);
    }

    if raft_prefix || http_prefix {
        None
    } else {
        Some(Protocol::Unknown)
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

/// Stream of classified gRPC connections, consumable by
/// `tonic::transport::Server::serve_with_incoming`.
pub type GrpcIncoming = ReceiverStream<Result<PeekedStream, io::Error>>;

/// The Raft half of the mux: accepts classified inbound Raft stream
/// connections and dials outbound ones.
pub struct RaftListener {
    rx: mpsc::Receiver<PeekedStream>,
    local: SocketAddr,
}

impl RaftListener {
    /// Next inbound Raft stream connection; `None` once the mux stops.
    pub async fn accept(&mut self) -> Option<PeekedStream> {
        self.rx.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Open an outbound Raft stream connection: plain TCP to the peer's
    /// advertised address, then the magic so the remote mux routes us.
    pub async fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr}")))??;
        stream.set_nodelay(true).ok();
        stream.write_all(&RAFT_MAGIC).await?;
        Ok(stream)
    }
}

/// Split a bound listener into its gRPC and Raft halves and start the serve
/// loop. The loop exits when `shutdown` flips.
pub fn spawn_mux(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> (GrpcIncoming, RaftListener) {
    let local = listener
        .local_addr()
        .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
    let (grpc_tx, grpc_rx) = mpsc::channel::<Result<PeekedStream, io::Error>>(CHANNEL_DEPTH);
    let (raft_tx, raft_rx) = mpsc::channel::<PeekedStream>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        info!(addr = %local, "RPC multiplexer listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(ok) => ok,
                        Err(e) => {
                            debug!(error = %e, "Mux accept error");
                            continue;
                        }
                    };
                    let grpc_tx = grpc_tx.clone();
                    let raft_tx = raft_tx.clone();
                    tokio::spawn(async move {
                        route_connection(stream, peer, grpc_tx, raft_tx).await;
                    });
                }
            }
        }
    });

    (
        ReceiverStream::new(grpc_rx),
        RaftListener {
            rx: raft_rx,
            local,
        },
    )
}

async fn route_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    grpc_tx: mpsc::Sender<Result<PeekedStream, io::Error>>,
    raft_tx: mpsc::Sender<PeekedStream>,
) {
    stream.set_nodelay(true).ok();
    let mut buf = Vec::with_capacity(HTTP2_PREFACE.len());

    let protocol = tokio::time::timeout(CLASSIFY_TIMEOUT, async {
        loop {
            if let Some(decision) = classify(&buf) {
                return Ok::<_, io::Error>(decision);
            }
            let mut chunk = [0u8; 32];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(Protocol::Unknown);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await;

    match protocol {
        Ok(Ok(Protocol::Grpc)) => {
            // Replay everything, including the preface, for tonic.
            let _ = grpc_tx.send(Ok(PeekedStream::new(stream, buf))).await;
        }
        Ok(Ok(Protocol::Raft)) => {
            // The magic is consumed; replay whatever followed it.
            let rest = buf[RAFT_MAGIC.len()..].to_vec();
            let _ = raft_tx.send(PeekedStream::new(stream, rest)).await;
        }
        Ok(Ok(Protocol::Unknown)) => {
            debug!(peer = %peer, "Closing connection with unknown protocol signature");
        }
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Connection died during classification");
        }
        Err(_) => {
            debug!(peer = %peer, "Connection classification timed out");
        }
    }
}

// ── Frame codec ───────────────────────────────────────────────────────────────

/// Write one `[kind][len][payload]` frame.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    kind: u8,
    payload: &[u8],
) -> io::Result<()> {
    stream.write_all(&[kind]).await?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read one `[kind][len][payload]` frame.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(u8, Vec<u8>)> {
    let mut kind = [0u8; 1];
    stream.read_exact(&mut kind).await?;
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((kind[0], payload))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_decides_on_full_signatures() {
        assert_eq!(classify(HTTP2_PREFACE), Some(Protocol::Grpc));
        assert_eq!(classify(&RAFT_MAGIC), Some(Protocol::Raft));

        let mut with_extra = HTTP2_PREFACE.to_vec();
        with_extra.extend_from_slice(b"settings-frame");
        assert_eq!(classify(&with_extra), Some(Protocol::Grpc));
    }

    #[test]
    fn classify_waits_on_ambiguous_prefixes() {
        assert_eq!(classify(b""), None);
        assert_eq!(classify(&HTTP2_PREFACE[..5]), None);
        assert_eq!(classify(&RAFT_MAGIC[..2]), None);
    }

    #[test]
    fn classify_rejects_foreign_protocols() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Some(Protocol::Unknown));
        assert_eq!(classify(b"SSH-2.0-OpenSSH"), Some(Protocol::Unknown));
    }

    #[test]
    fn directory_insert_lookup_remove() {
        let dir = AddressDirectory::new();
        assert!(dir.lookup(1).is_none());
        dir.insert(1, "10.0.0.1:6868".to_string());
        assert_eq!(dir.lookup(1).as_deref(), Some("10.0.0.1:6868"));
        dir.insert(1, "10.0.0.2:6868".to_string());
        assert_eq!(dir.lookup(1).as_deref(), Some("10.0.0.2:6868"));
        dir.remove(1);
        assert!(dir.is_empty());
    }

    async fn mux_fixture() -> (SocketAddr, GrpcIncoming, RaftListener, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (grpc, raft) = spawn_mux(listener, shutdown_rx);
        (addr, grpc, raft, shutdown_tx)
    }

    #[tokio::test]
    async fn raft_connections_route_to_raft_listener() {
        let (addr, _grpc, mut raft, _shutdown) = mux_fixture().await;

        let mut conn = RaftListener::dial(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        write_frame(&mut conn, 7, b"ping").await.unwrap();

        let mut accepted = tokio::time::timeout(Duration::from_secs(2), raft.accept())
            .await
            .unwrap()
            .unwrap();
        let (kind, payload) = read_frame(&mut accepted).await.unwrap();
        assert_eq!(kind, 7);
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn grpc_connections_replay_the_preface() {
        use tokio_stream::StreamExt;

        let (addr, mut grpc, _raft, _shutdown) = mux_fixture().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(HTTP2_PREFACE).await.unwrap();
        conn.write_all(b"after-preface").await.unwrap();

        let mut accepted = tokio::time::timeout(Duration::from_secs(2), grpc.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut replayed = vec![0u8; HTTP2_PREFACE.len() + b"after-preface".len()];
        accepted.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed[..HTTP2_PREFACE.len()], HTTP2_PREFACE);
        assert_eq!(&replayed[HTTP2_PREFACE.len()..], b"after-preface");
    }

    #[tokio::test]
    async fn unknown_protocols_are_dropped() {
        let (addr, _grpc, mut raft, _shutdown) = mux_fixture().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // Nothing shows up on the raft side.
        let accepted =
            tokio::time::timeout(Duration::from_millis(300), raft.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, 2, b"payload bytes").await.unwrap();
        let (kind, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(kind, 2);
        assert_eq!(payload, b"payload bytes");
    }
}
