//! A single socket to the server, read frame by frame.
//!
//! [`Connection`] owns the socket halves, the [`ReceiveBuffer`] and the
//! [`ConnectionState`]. It does not spawn anything: the owner pulls events by
//! awaiting [`Connection::next_event`], typically inside a `select!` next to
//! its command channel and timers.

use std::collections::VecDeque;
use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::error::{ConnectFailure, TransportError};
use super::framing::{FrameTooLarge, ReceiveBuffer};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the server listens.
///
/// The variant is chosen once, when the client is built; everything above the
/// connection is identical for every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP `host:port`. `host` may be a name or an IP literal.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. IPv6 literals must be bracketed (`[::1]:8888`).
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Endpoint::tcp(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Lifecycle of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why an established connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// The server closed its end.
    PeerClosed,
    /// Reading from the socket failed.
    ReadFailed(String),
    /// Writing to the socket failed.
    WriteFailed(String),
    /// The server announced an oversized frame; the stream was abandoned.
    FrameTooLarge(FrameTooLarge),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::PeerClosed => f.write_str("server closed the connection"),
            LossReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            LossReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            LossReason::FrameTooLarge(e) => write!(f, "{}", e),
        }
    }
}

/// Something that happened on the socket.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One complete payload, in arrival order.
    Frame(Vec<u8>),
    /// The connection is gone; state is already `Disconnected`.
    Lost(LossReason),
}

struct Link {
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// One connection to one endpoint.
///
/// State changes are published on a watch channel so other tasks can read
/// [`ConnectionState`] without going through the owner.
pub struct Connection {
    link: Option<Link>,
    buffer: ReceiveBuffer,
    /// Frames decoded but not yet handed out by `next_event`.
    ready: VecDeque<Vec<u8>>,
    chunk: Vec<u8>,
    state: watch::Sender<ConnectionState>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link: None,
            buffer: ReceiveBuffer::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK],
            state,
        }
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open a connection, waiting at most `connect_timeout`.
    ///
    /// Name resolution counts against the timeout. Returns immediately with
    /// `Ok` if already connected.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` with the classified cause.
    pub async fn connect(
        &mut self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        debug!("Connecting to {} (timeout {:?})", endpoint, connect_timeout);

        match timeout(connect_timeout, open(endpoint)).await {
            Ok(Ok(link)) => {
                self.install(link);
                info!("Connected to {}", endpoint);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    kind: ConnectFailure::TimedOut,
                    source: None,
                })
            }
        }
    }

    /// Use an already-open stream as the connection.
    ///
    /// Lets callers plug in transports this crate does not dial itself, and
    /// lets tests run over in-memory pipes.
    pub fn attach_stream<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.install(Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
        });
    }

    fn install(&mut self, link: Link) {
        self.buffer.clear();
        self.ready.clear();
        self.link = Some(link);
        self.state.send_replace(ConnectionState::Connected);
    }

    /// Close the connection gracefully.
    ///
    /// Half-closes our side and waits up to `grace` for the server to close
    /// its side, then drops the socket regardless. Always ends `Disconnected`.
    pub async fn disconnect(&mut self, grace: Duration) {
        if let Some(mut link) = self.link.take() {
            let closing = async {
                link.writer.shutdown().await?;
                let mut scratch = [0u8; 1024];
                while link.reader.read(&mut scratch).await? > 0 {}
                Ok::<(), io::Error>(())
            };

            match timeout(grace, closing).await {
                Ok(Ok(())) => debug!("Server acknowledged close"),
                Ok(Err(e)) => debug!("Error during graceful close: {}", e),
                Err(_) => debug!("Server did not close within {:?}, forcing", grace),
            }
        }
        self.drop_link();
    }

    /// Write one encoded frame.
    ///
    /// A failed or short write kills the connection; there is no partial
    /// write retry.
    ///
    /// # Errors
    ///
    /// `NotConnected` if there is no socket, `WriteFailure` otherwise.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let result = write_all_flush(&mut link.writer, frame).await;
        self.finish_write(result)
    }

    /// Write one encoded frame, giving up at `deadline`.
    ///
    /// A server that stops reading fills the socket buffer and would otherwise
    /// block the writer forever. Running out of time counts as a write failure
    /// (kind `TimedOut`) and drops the connection, since part of the frame may
    /// already be on the wire.
    ///
    /// # Errors
    ///
    /// `NotConnected` if there is no socket, `WriteFailure` otherwise.
    pub async fn send_until(
        &mut self,
        frame: &[u8],
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let result = match timeout_at(deadline, write_all_flush(&mut link.writer, frame)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write stalled: server is not reading",
            )),
        };
        self.finish_write(result)
    }

    fn finish_write(&mut self, result: io::Result<()>) -> Result<(), TransportError> {
        if let Err(e) = result {
            warn!("Write failed, dropping connection: {}", e);
            self.drop_link();
            return Err(TransportError::WriteFailure(e));
        }
        Ok(())
    }

    /// Wait for the next frame or for the connection to go away.
    ///
    /// Never resolves while disconnected. Cancel-safe: dropping the future
    /// loses no bytes, so it can be raced against timers in `select!`.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            // Frames from an earlier read go out first
            if let Some(frame) = self.ready.pop_front() {
                return ConnectionEvent::Frame(frame);
            }

            let Some(link) = self.link.as_mut() else {
                return std::future::pending().await;
            };

            // Zero bytes means the server closed its side
            let n = match link.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    self.drop_link();
                    return ConnectionEvent::Lost(LossReason::PeerClosed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.drop_link();
                    return ConnectionEvent::Lost(LossReason::ReadFailed(e.to_string()));
                }
            };

            // Keep any partial frame for the next read
            self.buffer.extend(&self.chunk[..n]);
            match self.buffer.drain_frames() {
                Ok(frames) => self.ready.extend(frames),
                Err(e) => {
                    self.drop_link();
                    return ConnectionEvent::Lost(LossReason::FrameTooLarge(e));
                }
            }
        }
    }

    /// Return an event only if one is available without waiting.
    pub async fn poll_ready_event(&mut self) -> Option<ConnectionEvent> {
        timeout(Duration::ZERO, self.next_event()).await.ok()
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.buffer.clear();
        self.ready.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

async fn write_all_flush(writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Dial the endpoint (no timeout; the caller wraps this).
async fn open(endpoint: &Endpoint) -> Result<Link, TransportError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            // Resolve first so DNS failures get their own classification
            let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    kind: ConnectFailure::HostNotFound,
                    source: Some(e),
                })?
                .collect();

            // Try each resolved address, keeping the last error for the report
            let mut last_error = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY: {}", e);
                        }
                        let (reader, writer) = stream.into_split();
                        return Ok(Link {
                            reader: Box::new(reader),
                            writer: Box::new(writer),
                        });
                    }
                    Err(e) => {
                        debug!("Connect to {} failed: {}", addr, e);
                        last_error = Some(e);
                    }
                }
            }

            Err(match last_error {
                Some(e) => TransportError::connect(endpoint, e),
                None => TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    kind: ConnectFailure::HostNotFound,
                    source: None,
                },
            })
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| TransportError::connect(endpoint, e))?;
            let (reader, writer) = stream.into_split();
            Ok(Link {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::{encode, MAX_FRAME_LEN};
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn next(conn: &mut Connection) -> ConnectionEvent {
        timeout(TEST_TIMEOUT, conn.next_event())
            .await
            .expect("Test timed out")
    }

    #[test]
    fn test_endpoint_parse_and_display() {
        assert_eq!(
            Endpoint::parse("127.0.0.1:8888"),
            Some(Endpoint::tcp("127.0.0.1", 8888))
        );
        assert_eq!(Endpoint::parse("[::1]:9000"), Some(Endpoint::tcp("::1", 9000)));
        assert_eq!(Endpoint::parse("localhost"), None);
        assert_eq!(Endpoint::parse(":80"), None);

        assert_eq!(Endpoint::tcp("::1", 9000).to_string(), "[::1]:9000");
        assert_eq!(Endpoint::tcp("shop.local", 8888).to_string(), "shop.local:8888");
    }

    #[tokio::test]
    async fn test_frame_split_across_segments() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new();
        conn.attach_stream(client);
        assert!(conn.is_connected());

        let frame = encode(br#"{"success":true,"message":"welcome!"}"#);
        server.write_all(&frame[..14]).await.unwrap();
        assert!(conn.poll_ready_event().await.is_none());

        server.write_all(&frame[14..]).await.unwrap();
        match next(&mut conn).await {
            ConnectionEvent::Frame(payload) => assert_eq!(payload, frame[4..].to_vec()),
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        let mut bytes = encode(b"1");
        bytes.extend(encode(b"2"));
        bytes.extend(encode(b"3"));
        server.write_all(&bytes).await.unwrap();

        for expected in [b"1", b"2", b"3"] {
            match next(&mut conn).await {
                ConnectionEvent::Frame(payload) => assert_eq!(payload, expected.to_vec()),
                other => panic!("Expected frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_loss() {
        let (client, server) = duplex(64);
        let mut conn = Connection::new();
        conn.attach_stream(client);
        let state = conn.watch_state();

        drop(server);

        match next(&mut conn).await {
            ConnectionEvent::Lost(reason) => assert_eq!(reason, LossReason::PeerClosed),
            other => panic!("Expected loss, got {:?}", other),
        }
        assert!(!conn.is_connected());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        server
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();

        match next(&mut conn).await {
            ConnectionEvent::Lost(LossReason::FrameTooLarge(e)) => {
                assert_eq!(e.declared, MAX_FRAME_LEN + 1)
            }
            other => panic!("Expected FrameTooLarge loss, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_writes_whole_frame() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        let frame = encode(br#"{"action":"ping"}"#);
        conn.send(&frame).await.unwrap();

        let mut received = vec![0u8; frame.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let mut conn = Connection::new();
        let err = conn.send(&encode(b"{}")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_to_closed_peer_is_write_failure() {
        let (client, server) = duplex(64);
        let mut conn = Connection::new();
        conn.attach_stream(client);
        let state = conn.watch_state();

        drop(server);

        let err = conn.send(&encode(&[b'x'; 1024])).await.unwrap_err();
        assert!(matches!(err, TransportError::WriteFailure(_)), "got {:?}", err);
        assert!(err.is_connection_level());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_until_gives_up_when_peer_stops_reading() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        // The peer never reads, so the 64-byte pipe fills and the write stalls.
        let started = Instant::now();
        let err = timeout(
            TEST_TIMEOUT,
            conn.send_until(&encode(&[b'x'; 4096]), started + Duration::from_millis(100)),
        )
        .await
        .expect("Test timed out")
        .unwrap_err();

        match err {
            TransportError::WriteFailure(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("Expected WriteFailure, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_until_completes_before_deadline() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        let frame = encode(br#"{"action":"ping"}"#);
        conn.send_until(&frame, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let mut received = vec![0u8; frame.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, frame);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_half_closes_and_times_out() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new();
        conn.attach_stream(client);

        // Server never closes its side, so disconnect must give up after grace.
        timeout(TEST_TIMEOUT, conn.disconnect(Duration::from_millis(50)))
            .await
            .expect("Test timed out");
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let mut scratch = [0u8; 8];
        assert_eq!(server.read(&mut scratch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = Connection::new();
        let err = conn
            .connect(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap_err();

        match err {
            TransportError::Connect { kind, .. } => assert_eq!(kind, ConnectFailure::Refused),
            other => panic!("Expected Connect error, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());

        let mut conn = Connection::new();
        conn.connect(&endpoint, Duration::from_secs(2)).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        // Listener is gone; a real dial would now fail.
        drop(listener);
        conn.connect(&endpoint, Duration::from_secs(2)).await.unwrap();
        assert!(conn.is_connected());
    }
}
