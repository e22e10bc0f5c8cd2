use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{Ipv6Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use shared::protocol::DEFAULT_SEND_TIMEOUT_MS;
use super::{SocketFactory, TarpitListener, TarpitSocket, LISTEN_BACKLOG};

/// Production sockets: `socket2` for setup, `tokio` for I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn bind(&self, addr: SocketAddr, ipv4_only: bool) -> io::Result<Box<dyn TarpitListener>> {
        let (socket, addr) = if ipv4_only {
            if addr.is_ipv6() {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "IPv6 address requested on an IPv4 only listener",
                ));
            }
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            (socket, addr)
        } else {
            let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_only_v6(false)?;
            (socket, dual_stack_addr(addr))
        };

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Box::new(TcpTarpitListener { listener }))
    }
}

/// IPv4 addresses become their IPv6 form; the IPv4 wildcard becomes `[::]`
/// so the listener takes both families.
fn dual_stack_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), v4.port())
        }
        SocketAddr::V4(v4) => SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()),
        v6 => v6,
    }
}

pub struct TcpTarpitListener {
    listener: TcpListener,
}

impl TarpitListener for TcpTarpitListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn TarpitSocket>>> {
        Box::pin(async move {
            let (stream, _) = self.listener.accept().await?;
            Ok(Box::new(TcpTarpitSocket::new(stream)) as Box<dyn TarpitSocket>)
        })
    }
}

pub struct TcpTarpitSocket {
    /// `None` once closed. Sends hold their own clone, so closing never
    /// waits on a write in progress.
    stream: Mutex<Option<Arc<TcpStream>>>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    send_timeout_ms: AtomicU64,
}

impl TcpTarpitSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
            stream: Mutex::new(Some(Arc::new(stream))),
            send_timeout_ms: AtomicU64::new(DEFAULT_SEND_TIMEOUT_MS),
        }
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }
}

async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl TarpitSocket for TcpTarpitSocket {
    fn is_connected(&self) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };

        // Peers never get read from, so a pending byte means "still there"
        // and a zero-length peek means they hung up. A peer that sent data
        // and then half-closed keeps peeking as connected; it completes on
        // the first failed send or the timeout.
        let mut pending = [MaybeUninit::<u8>::uninit(); 1];
        match SockRef::from(&*stream).peek(&mut pending) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        match self.stream() {
            Some(stream) => SockRef::from(&*stream).set_send_buffer_size(size),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    fn set_send_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.send_timeout_ms.store(millis, Ordering::Relaxed);
    }

    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let stream = self.stream().ok_or(ErrorKind::NotConnected)?;
            let timeout = Duration::from_millis(self.send_timeout_ms.load(Ordering::Relaxed));
            tokio::time::timeout(timeout, write_all(&stream, buf))
                .await
                .map_err(|_| io::Error::from(ErrorKind::TimedOut))?
        })
    }

    fn close(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = SockRef::from(&*stream).shutdown(Shutdown::Both);
        }
    }
}
