//! Socket boundary. The service only talks to these traits, so tests can
//! swap in [`fake`] sockets while production uses [`tcp`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use futures::future::BoxFuture;

pub mod tcp;
#[cfg(test)]
pub(crate) mod fake;

/// Pending connection queue depth for every listening socket.
pub const LISTEN_BACKLOG: i32 = 128;

/// One accepted peer.
pub trait TarpitSocket: Send + Sync {
    /// Whether the peer still looks connected. Must not block.
    fn is_connected(&self) -> bool;

    fn local_endpoint(&self) -> Option<SocketAddr>;

    fn remote_endpoint(&self) -> Option<SocketAddr>;

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;

    /// Bound on how long a single [`send`](Self::send) may take.
    fn set_send_timeout(&self, timeout: Duration);

    /// Write all of `buf`.
    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Shut the connection down and release it. Idempotent.
    fn close(&self);
}

/// A bound, listening socket.
pub trait TarpitListener: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn TarpitSocket>>>;
}

pub trait SocketFactory: Send + Sync {
    /// Bind and listen on `addr`. Without `ipv4_only` the listener is dual
    /// stack.
    fn bind(&self, addr: SocketAddr, ipv4_only: bool) -> io::Result<Box<dyn TarpitListener>>;
}
