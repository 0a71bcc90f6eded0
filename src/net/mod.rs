//! Network abstraction traits for async socket operations.
//!
//! The runtime works against these traits instead of concrete tokio types.
//! Stream I/O is readiness-based (`readable()`/`writable()` futures plus
//! non-blocking `try_read`/`try_write`) because the congestion machinery in
//! [`connection`](crate::connection) needs to observe `WouldBlock` itself —
//! a blocked write is a state transition, not something to await through.
//!
//! The `tokio_impl` module implements them for `tokio::net` sockets; tests
//! implement [`StreamSocket`] with in-memory fakes.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

mod tokio_impl;

/// A connected byte stream with readiness-based non-blocking I/O.
///
/// Implemented by `tokio::net::TcpStream` and `tokio::net::UnixStream`.
/// `Sync` is required because connection tasks hold a shared reference
/// across the readiness awaits.
pub trait StreamSocket: Send + Sync + Sized + 'static {
    /// Try to read without blocking. `Ok(0)` means the peer closed the
    /// stream; `WouldBlock` means no data is currently available.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Try to write without blocking. `WouldBlock` means the send buffer is
    /// full (congestion).
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Wait until the stream is likely readable.
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait until the stream is likely writable.
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// An async TCP stream.
pub trait TcpStream: StreamSocket {
    /// Connect to the given address.
    fn connect(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// The remote address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// An async TCP listener.
pub trait TcpListener: Send + Sized + 'static {
    /// The stream type produced when accepting connections.
    type Stream: TcpStream;

    /// Bind to the given address.
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Accept a new connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Get the local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A Unix stream listener for local IPC clients.
pub trait LocalListener: Send + Sized + 'static {
    /// The stream type produced when accepting connections.
    type Stream: StreamSocket;

    /// Bind to the given filesystem path.
    fn bind(path: &Path) -> io::Result<Self>;

    /// Accept a new connection.
    fn accept(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// An async UDP socket used for service discovery broadcasts.
pub trait UdpSocket: Send + Sync + Sized + 'static {
    /// Bind to the given address with `SO_REUSEADDR` and broadcast enabled,
    /// so several dispatchers on one host can share the SD port.
    fn bind_broadcast(addr: SocketAddr) -> io::Result<Self>;

    /// Send data to the given address.
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive data and the source address.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Get the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// The IPv4 broadcast address SD offers are sent to.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, port))
}
