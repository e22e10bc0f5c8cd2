//! In-memory sockets for tests.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use super::{SocketFactory, TarpitListener, TarpitSocket};

#[derive(Debug, Default)]
pub(crate) struct FakeSocket {
    connected: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    sends: AtomicUsize,
    sent: Mutex<Vec<u8>>,
    send_delay: Mutex<Option<Duration>>,
    send_buffer_size: AtomicUsize,
    send_timeout: Mutex<Option<Duration>>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl FakeSocket {
    pub(crate) fn connected(local: SocketAddr, remote: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            local: Some(local),
            remote: Some(remote),
            ..Default::default()
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<u8> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::SeqCst)
    }

    pub(crate) fn send_timeout(&self) -> Option<Duration> {
        *self.send_timeout.lock()
    }
}

impl TarpitSocket for Arc<FakeSocket> {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.send_buffer_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    fn set_send_timeout(&self, timeout: Duration) {
        *self.send_timeout.lock() = Some(timeout);
    }

    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let delay = *self.send_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_sends.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return Err(ErrorKind::BrokenPipe.into());
            }
            self.sent.lock().extend_from_slice(buf);
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeListener {
    addr: SocketAddr,
    incoming: flume::Receiver<Arc<FakeSocket>>,
}

impl TarpitListener for FakeListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn TarpitSocket>>> {
        Box::pin(async move {
            let socket = self
                .incoming
                .recv_async()
                .await
                .map_err(|_| io::Error::from(ErrorKind::NotConnected))?;
            Ok(Box::new(socket) as Box<dyn TarpitSocket>)
        })
    }
}

/// Hands out [`FakeListener`]s and lets tests "connect" to them.
#[derive(Default)]
pub(crate) struct FakeSocketFactory {
    failing: Mutex<HashSet<u16>>,
    listeners: Mutex<HashMap<u16, flume::Sender<Arc<FakeSocket>>>>,
    binds: AtomicUsize,
    next_remote_port: AtomicU16,
}

impl FakeSocketFactory {
    pub(crate) fn fail_port(&self, port: u16) {
        self.failing.lock().insert(port);
    }

    pub(crate) fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    /// Queue a new peer on `port`. `None` when nothing is listening there.
    pub(crate) fn connect(&self, port: u16) -> Option<Arc<FakeSocket>> {
        let listeners = self.listeners.lock();
        let tx = listeners.get(&port)?;
        let remote_port = 40000 + self.next_remote_port.fetch_add(1, Ordering::SeqCst) % 20000;
        let socket = FakeSocket::connected(
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([198, 51, 100, 7], remote_port)),
        );
        tx.send(Arc::clone(&socket)).ok()?;
        Some(socket)
    }
}

impl SocketFactory for FakeSocketFactory {
    fn bind(&self, addr: SocketAddr, _ipv4_only: bool) -> io::Result<Box<dyn TarpitListener>> {
        if self.failing.lock().contains(&addr.port()) {
            return Err(ErrorKind::AddrInUse.into());
        }
        let (tx, rx) = flume::unbounded();
        self.listeners.lock().insert(addr.port(), tx);
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeListener { addr, incoming: rx }))
    }
}
