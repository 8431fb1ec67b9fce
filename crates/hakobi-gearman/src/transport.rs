//! TCP transport: framed packet I/O with per-operation timeouts.
//!
//! Reads accumulate into an internal buffer and frames are cut out of it,
//! so a cancelled or timed-out receive never loses bytes mid-frame.

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::config::HostEndpoint;
use crate::protocol::{self, Magic, Packet};
use hakobi_core::job::ConnectionId;
use hakobi_core::pool::Connector;

static NEXT_CONNECTION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of transport failures.
pub enum ErrorKind {
    /// Socket-level failure; the connection is gone.
    Io,
    /// An operation ran past its configured timeout.
    Timeout,
    /// The peer closed the connection.
    Closed,
    /// The peer sent something that does not frame or decode.
    Protocol,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether this failure should count against the host's health.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::Timeout | ErrorKind::Closed)
    }

    fn io(error: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            inner: Box::new(error),
        }
    }

    fn timeout(op: &'static str) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            inner: Box::new(TimedOut(op)),
        }
    }

    fn closed() -> Self {
        Self {
            kind: ErrorKind::Closed,
            inner: Box::new(PeerClosed),
        }
    }
}

impl From<protocol::DecodeError> for Error {
    fn from(value: protocol::DecodeError) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct TimedOut(&'static str);

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} timed out", self.0)
    }
}

impl std::error::Error for TimedOut {}

#[derive(Debug)]
struct PeerClosed;

impl std::fmt::Display for PeerClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection closed by peer")
    }
}

impl std::error::Error for PeerClosed {}

/// One framed connection to a job server.
#[derive(Debug)]
pub struct Transport {
    stream: tokio::net::TcpStream,
    id: ConnectionId,
    buf: Vec<u8>,
    send_timeout: std::time::Duration,
    receive_timeout: std::time::Duration,
}

impl Transport {
    /// Dial `endpoint`, bounded by its connect timeout.
    pub async fn connect(endpoint: &HostEndpoint) -> Result<Self, Error> {
        let stream = tokio::time::timeout(
            endpoint.connect_timeout,
            tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| Error::timeout("connect"))?
        .map_err(Error::io)?;
        let _ = stream.set_nodelay(true);

        Ok(Self {
            stream,
            id: NEXT_CONNECTION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            buf: Vec::new(),
            send_timeout: endpoint.send_timeout,
            receive_timeout: endpoint.receive_timeout,
        })
    }

    /// Process-unique identity; stable for the lifetime of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send one request frame, bounded by the send timeout.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let frame = packet.encode(Magic::Request);
        tokio::time::timeout(self.send_timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| Error::timeout("send"))?
            .map_err(Error::io)
    }

    /// Receive one response frame, bounded by the receive timeout.
    pub async fn recv(&mut self) -> Result<Packet, Error> {
        tokio::time::timeout(self.receive_timeout, self.recv_unbounded())
            .await
            .map_err(|_| Error::timeout("receive"))?
    }

    /// Receive with an explicit deadline; `Ok(None)` when it elapses.
    ///
    /// Used for the post-PRE_SLEEP wait, where an elapsed deadline is the
    /// normal "nothing happened" case rather than an error.
    pub async fn recv_deadline(
        &mut self,
        limit: std::time::Duration,
    ) -> Result<Option<Packet>, Error> {
        match tokio::time::timeout(limit, self.recv_unbounded()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn recv_unbounded(&mut self) -> Result<Packet, Error> {
        loop {
            if let Some(packet) = self.take_frame()? {
                return Ok(packet);
            }
            let mut chunk = [0u8; 4096];
            let read = self.stream.read(&mut chunk).await.map_err(Error::io)?;
            if read == 0 {
                return Err(Error::closed());
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Packet>, Error> {
        if self.buf.len() < protocol::HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; protocol::HEADER_LEN];
        header.copy_from_slice(&self.buf[..protocol::HEADER_LEN]);
        let (kind, body_len) = match protocol::decode_header(&header, Magic::Response) {
            Ok(parsed) => parsed,
            Err(error) => {
                // The frame boundary is lost; drop buffered bytes so the
                // stream can resync instead of re-reporting the same junk.
                self.buf.clear();
                return Err(error.into());
            }
        };

        let frame_len = protocol::HEADER_LEN + body_len;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf[protocol::HEADER_LEN..frame_len].to_vec();
        self.buf.drain(..frame_len);
        Ok(Packet::decode(kind, &body).map(Some)?)
    }
}

/// Dials [`Transport`]s for a fixed endpoint; plugs into the core pool.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: HostEndpoint,
}

impl TcpConnector {
    pub fn new(endpoint: HostEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }
}

impl Connector for TcpConnector {
    type Connection = Transport;
    type Error = Error;

    async fn connect(&self) -> Result<Transport, Error> {
        Transport::connect(&self.endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    async fn listener() -> (tokio::net::TcpListener, HostEndpoint) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, HostEndpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn ids_are_unique_per_connection() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let a = Transport::connect(&endpoint).await.expect("connect a");
        let b = Transport::connect(&endpoint).await.expect("connect b");
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn receives_a_frame_split_across_writes() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let frame = Packet::new(PacketType::JobCreated, vec![b"H:1".to_vec()])
                .encode(Magic::Response);
            let (head, tail) = frame.split_at(5);
            sock.write_all(head).await.expect("head");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            sock.write_all(tail).await.expect("tail");
            // Keep the socket open until the client is done.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let mut transport = Transport::connect(&endpoint).await.expect("connect");
        let packet = transport.recv().await.expect("recv");
        assert_eq!(packet.kind, PacketType::JobCreated);
        assert_eq!(packet.arg(0), b"H:1");
    }

    #[tokio::test]
    async fn deadline_elapsing_keeps_the_stream_usable() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            let frame = Packet::new(PacketType::Noop, Vec::new()).encode(Magic::Response);
            sock.write_all(&frame).await.expect("frame");
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let mut transport = Transport::connect(&endpoint).await.expect("connect");
        let first = transport
            .recv_deadline(std::time::Duration::from_millis(10))
            .await
            .expect("deadline");
        assert!(first.is_none());

        let second = transport
            .recv_deadline(std::time::Duration::from_millis(200))
            .await
            .expect("recv");
        assert_eq!(second.map(|p| p.kind), Some(PacketType::Noop));
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_closed() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.expect("accept");
            drop(sock);
        });

        let mut transport = Transport::connect(&endpoint).await.expect("connect");
        let err = transport.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn connect_refused_is_an_io_error() {
        // Bind then drop to find a port that is very likely closed.
        let endpoint = {
            let (listener, endpoint) = listener().await;
            drop(listener);
            endpoint
        };
        let err = Transport::connect(&endpoint).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
