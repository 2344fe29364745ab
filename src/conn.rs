//! Buffered per-connection socket wrapper: id, deadline helpers, prefixed
//! logging, and a close-hook that fires `DisconnectEvent` exactly once for
//! client-side connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::events::{DisconnectEvent, EventBus, NetworkEvent};

/// Deadline used throughout the pre-pipe phases and the bidirectional pipe.
pub const IO_TIMEOUT: Duration = Duration::from_secs(15);

/// Fires `DisconnectEvent` at most once, shared between whatever tasks end
/// up touching a client connection's closing path (the session itself, and
/// later the two independent pipe-loop tasks).
#[derive(Clone)]
pub struct DisconnectGuard {
    events: Option<Arc<EventBus>>,
    base: NetworkEvent,
    fired: Arc<AtomicBool>,
}

impl DisconnectGuard {
    pub fn fire(&self) {
        let Some(events) = &self.events else {
            return;
        };
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut event = DisconnectEvent {
            base: self.base.clone(),
        };
        events.disconnect.dispatch(&mut event);
    }
}

/// A single client- or upstream-side socket, buffered for reads, carrying a
/// connection id and prefixed logging helpers.
pub struct Conn {
    stream: BufReader<TcpStream>,
    id: u64,
    peer: SocketAddr,
    guard: DisconnectGuard,
}

impl Conn {
    pub fn new_client(stream: TcpStream, id: u64, peer: SocketAddr, events: Arc<EventBus>) -> Self {
        let guard = DisconnectGuard {
            events: Some(events),
            base: NetworkEvent {
                remote_addr: peer,
                conn_id: id,
            },
            fired: Arc::new(AtomicBool::new(false)),
        };
        Conn {
            stream: BufReader::new(stream),
            id,
            peer,
            guard,
        }
    }

    pub fn new_upstream(stream: TcpStream, id: u64, peer: SocketAddr) -> Self {
        let guard = DisconnectGuard {
            events: None,
            base: NetworkEvent {
                remote_addr: peer,
                conn_id: id,
            },
            fired: Arc::new(AtomicBool::new(false)),
        };
        Conn {
            stream: BufReader::new(stream),
            id,
            peer,
            guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn prefix(&self) -> String {
        format!("[#{} {}]", self.id, self.peer)
    }

    pub fn log_debug(&self, msg: &str) {
        log::debug!("{} {}", self.prefix(), msg);
    }

    pub fn log_info(&self, msg: &str) {
        log::info!("{} {}", self.prefix(), msg);
    }

    pub fn log_warn(&self, msg: &str) {
        log::warn!("{} {}", self.prefix(), msg);
    }

    pub fn log_error(&self, msg: &str) {
        log::error!("{} {}", self.prefix(), msg);
    }

    pub fn inner_mut(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.stream
    }

    /// `nodelay = false` keeps Nagle's algorithm on, coalescing small writes
    /// on both legs of a proxied connection.
    pub fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        self.stream.get_ref().set_nodelay(nodelay)
    }

    /// Wraps the write itself in a deadline.
    pub async fn write_with_timeout(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match tokio::time::timeout(IO_TIMEOUT, self.stream.write_all(buf)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            )),
        }
    }

    pub async fn read_packet_raw(&mut self) -> Result<crate::codec::RawPacket, crate::codec::CodecError> {
        crate::codec::read_packet(&mut self.stream).await
    }

    pub async fn read_initial(&mut self) -> Result<crate::codec::Initial, crate::codec::CodecError> {
        crate::codec::read_initial(&mut self.stream).await
    }

    pub async fn write_packet(&mut self, packet: &crate::codec::RawPacket) -> std::io::Result<()> {
        self.write_with_timeout(&crate::codec::write_raw(packet)).await
    }

    /// Splits into independent read/write halves for the bidirectional pipe.
    /// Uses `tokio::io::split` rather than `TcpStream::into_split` so both
    /// halves keep sharing this `BufReader`'s internal buffer — splitting the
    /// raw socket instead would silently drop any bytes the buffered reader
    /// had already pulled off the wire but not yet handed out to a caller.
    pub fn into_split(
        self,
    ) -> (
        tokio::io::ReadHalf<BufReader<TcpStream>>,
        tokio::io::WriteHalf<BufReader<TcpStream>>,
        DisconnectGuard,
    ) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (read_half, write_half, self.guard)
    }

    pub async fn close(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
        self.guard.fire();
    }
}

#[cfg(test)]
impl DisconnectGuard {
    /// A guard with no event bus attached, for tests that only care about
    /// the pipe's read/write behavior and not disconnect dispatch.
    pub(crate) fn for_test() -> Self {
        DisconnectGuard {
            events: None,
            base: NetworkEvent {
                remote_addr: "127.0.0.1:0".parse().unwrap(),
                conn_id: 0,
            },
            fired: Arc::new(AtomicBool::new(false)),
        }
    }
}
