use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::clock::Clock;
use crate::connection::{Connection, ConnectionSettings};
use crate::error::TarpitError;
use crate::events::EventHub;
use crate::net::{SocketFactory, TarpitListener, TarpitSocket};
use crate::registry::ConnectionRegistry;
use crate::source::ByteSource;

/// Pause before re-arming an accept that failed.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything an accept loop needs to turn a socket into a tracked
/// connection.
pub struct AcceptContext {
    pub registry: Arc<ConnectionRegistry>,
    pub events: Arc<EventHub>,
    pub source: Arc<ByteSource>,
    pub clock: Arc<dyn Clock>,
    pub settings: ConnectionSettings,
}

impl AcceptContext {
    /// Apply socket options, register the connection and announce it. The
    /// connection stays tracked even when announcing it fails.
    pub fn admit(&self, socket: Box<dyn TarpitSocket>) -> Result<Arc<Connection>, TarpitError> {
        if let Err(e) = socket.set_send_buffer_size(self.settings.write_size) {
            tracing::debug!(error = %e, "failed to set send buffer size");
        }
        socket.set_send_timeout(self.settings.send_timeout);

        let conn = self.registry.register(|id| {
            Connection::new(
                id,
                socket,
                Arc::clone(&self.source),
                Arc::clone(&self.clock),
                self.settings,
            )
        });

        let status = conn.status();
        tracing::debug!(id = status.id, remote = %status.remote_endpoint, local = %status.local_endpoint, "connection accepted");
        self.events.connection_created(&status)?;
        Ok(conn)
    }
}

struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One listening socket and accept loop per port.
pub struct ListenerSet {
    factory: Arc<dyn SocketFactory>,
    address: IpAddr,
    ipv4_only: bool,
    context: Arc<AcceptContext>,
    listeners: HashMap<u16, ListenerHandle>,
}

impl ListenerSet {
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        address: IpAddr,
        ipv4_only: bool,
        context: Arc<AcceptContext>,
    ) -> Self {
        Self {
            factory,
            address,
            ipv4_only,
            context,
            listeners: HashMap::new(),
        }
    }

    /// Bind `port` and start accepting on it. `Ok(false)` if the port is
    /// already being listened on.
    pub fn add(&mut self, port: u16) -> Result<bool, TarpitError> {
        if port == 0 {
            return Err(TarpitError::InvalidPorts {
                spec: port.to_string(),
                reason: "invalid port 0".to_string(),
            });
        }
        if self.listeners.contains_key(&port) {
            return Ok(false);
        }

        let addr = SocketAddr::new(self.address, port);
        let listener = self
            .factory
            .bind(addr, self.ipv4_only)
            .map_err(|source| TarpitError::Bind { addr, source })?;
        let local_addr = listener.local_addr().unwrap_or(addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            cancel.clone(),
        ));

        tracing::debug!(port, %local_addr, "listener started");
        self.listeners.insert(port, ListenerHandle { local_addr, cancel, task });
        Ok(true)
    }

    /// Stop accepting on `port` and release its socket.
    pub async fn remove(&mut self, port: u16) -> bool {
        let Some(handle) = self.listeners.remove(&port) else {
            return false;
        };
        shutdown(port, handle).await;
        true
    }

    pub async fn clear(&mut self) {
        let handles: Vec<_> = self.listeners.drain().collect();
        futures::future::join_all(handles.into_iter().map(|(port, handle)| shutdown(port, handle))).await;
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.get(&port).map(|h| h.local_addr)
    }
}

async fn shutdown(port: u16, handle: ListenerHandle) {
    handle.cancel.cancel();
    if let Err(e) = handle.task.await {
        tracing::warn!(port, error = %e, "accept loop ended abnormally");
    }
    tracing::debug!(port, "listener stopped");
}

/// Keep exactly one accept outstanding until cancelled. The listener is
/// dropped (closing the socket) when the loop ends.
async fn accept_loop(
    listener: Box<dyn TarpitListener>,
    context: Arc<AcceptContext>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(socket) => {
                    if cancel.is_cancelled() {
                        socket.close();
                        break;
                    }
                    if let Err(e) = context.admit(socket) {
                        tracing::error!(error = %e, "failed to announce connection");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}
