//! TCP transport: connection establishment, raw byte receive, framed send.
//!
//! A [`Transport`] owns one TCP connection. The reader half runs in a
//! background task that forwards received chunks as [`TransportEvent`]s on
//! an unbounded channel; the writer half sits behind a mutex and is written
//! synchronously by [`Transport::send`]. When the peer closes the stream or
//! a read fails, exactly one [`TransportEvent::Closed`] is emitted and the
//! reader task exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use skylark_config::NetConfig;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP handshake did not complete within the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// An underlying socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the reader task stopped.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// The server closed the stream cleanly.
    #[error("server closed the connection")]
    PeerClosed,

    /// A socket read failed.
    #[error("read failed: {0}")]
    ReadError(std::io::Error),
}

/// Events emitted by the reader task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A chunk of raw bytes arrived. Chunk boundaries are arbitrary; the
    /// frame decoder reassembles messages.
    Data(Vec<u8>),
    /// The connection ended. Emitted exactly once per connection, and not
    /// at all when the close was requested locally via
    /// [`Transport::disconnect`].
    Closed(CloseReason),
}

// ---------------------------------------------------------------------------
// Traffic counters
// ---------------------------------------------------------------------------

/// Atomic traffic counters, updated by the send path and the reader task.
#[derive(Debug, Default)]
pub struct TransportCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    chunks_received: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Completed [`Transport::send`] calls.
    pub frames_sent: u64,
    /// Socket read chunks forwarded to the event channel.
    pub chunks_received: u64,
}

impl TransportCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_receive(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot and zero all counters, e.g. once per stats interval.
    pub fn snapshot_and_reset(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            frames_sent: self.frames_sent.swap(0, Ordering::Relaxed),
            chunks_received: self.chunks_received.swap(0, Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Handle to one TCP connection.
///
/// Created via [`Transport::connect`]. Owns the writer half of the stream
/// (behind a mutex, shared with nobody but the caller), a shutdown signal
/// for the reader task, and the traffic counters.
pub struct Transport {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    counters: Arc<TransportCounters>,
    peer_addr: SocketAddr,
}

impl Transport {
    /// Connect to the server at `addr`.
    ///
    /// Applies the configured connect timeout, sets `TCP_NODELAY`, splits
    /// the stream, and spawns the reader task. Received chunks and the
    /// final close notification are delivered on `events`.
    pub async fn connect(
        addr: SocketAddr,
        config: &NetConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(connect_timeout))??;
        stream.set_nodelay(true)?;

        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let connected = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(TransportCounters::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let read_connected = Arc::clone(&connected);
        let read_counters = Arc::clone(&counters);
        tokio::spawn(async move {
            Self::read_loop(reader, events, read_connected, read_counters, shutdown_rx).await;
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            connected,
            shutdown_tx,
            counters,
            peer_addr,
        })
    }

    /// Write one encoded frame to the socket.
    ///
    /// Best effort: returns [`TransportError::NotConnected`] if the
    /// connection is already down, and marks it down on write failure.
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        match writer.write_all(frame).await {
            Ok(()) => {
                self.counters.record_send(frame.len());
                Ok(())
            }
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(TransportError::Io(err))
            }
        }
    }

    /// Close the connection and stop the reader task.
    ///
    /// Idempotent: calling on an already-closed transport does nothing.
    /// No [`TransportEvent::Closed`] is emitted for a local disconnect.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the connection is believed to be up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Address of the connected server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Traffic counters for this connection.
    pub fn counters(&self) -> &TransportCounters {
        &self.counters
    }

    /// Read incoming bytes until the connection closes or shutdown is
    /// signalled. Emits at most one [`TransportEvent::Closed`].
    async fn read_loop(
        mut reader: OwnedReadHalf,
        events: mpsc::UnboundedSender<TransportEvent>,
        connected: Arc<AtomicBool>,
        counters: Arc<TransportCounters>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("server closed the connection");
                            connected.store(false, Ordering::Relaxed);
                            let _ = events.send(TransportEvent::Closed(CloseReason::PeerClosed));
                            break;
                        }
                        Ok(n) => {
                            counters.record_receive(n);
                            if events.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                                // Receiver gone; nobody is processing.
                                connected.store(false, Ordering::Relaxed);
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "socket read failed");
                            connected.store(false, Ordering::Relaxed);
                            let _ = events.send(TransportEvent::Closed(CloseReason::ReadError(err)));
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
