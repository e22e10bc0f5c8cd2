use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::types::ConnectionStatus;
use crate::clock::Clock;
use crate::net::TarpitSocket;
use crate::source::{ByteSource, CyclicReader};

/// Per-connection settings taken from the service options at start.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub write_size: usize,
    pub timeout: Duration,
    pub send_timeout: Duration,
}

/// Reader position plus the reusable chunk buffer. Only touched by the
/// send that holds the in-flight guard.
struct Outbox {
    reader: CyclicReader,
    buffer: Vec<u8>,
}

/// One accepted peer being fed bytes until it leaves or times out.
pub struct Connection {
    id: u32,
    created: DateTime<Utc>,
    timeout: Duration,
    socket: Box<dyn TarpitSocket>,
    clock: Arc<dyn Clock>,
    outbox: Mutex<Outbox>,
    sending: AtomicBool,
    bytes_sent: AtomicU64,
    completed: AtomicBool,
    ended: Mutex<Option<DateTime<Utc>>>,
    local_endpoint: String,
    remote_endpoint: String,
}

impl Connection {
    pub fn new(
        id: u32,
        socket: Box<dyn TarpitSocket>,
        source: Arc<ByteSource>,
        clock: Arc<dyn Clock>,
        settings: ConnectionSettings,
    ) -> Self {
        let local_endpoint = socket.local_endpoint().map(|a| a.to_string()).unwrap_or_default();
        let remote_endpoint = socket.remote_endpoint().map(|a| a.to_string()).unwrap_or_default();

        Self {
            id,
            created: clock.now(),
            timeout: settings.timeout,
            socket,
            clock,
            outbox: Mutex::new(Outbox {
                reader: CyclicReader::new(source),
                buffer: vec![0; settings.write_size],
            }),
            sending: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            ended: Mutex::new(None),
            local_endpoint,
            remote_endpoint,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        let ended = *self.ended.lock();
        self.elapsed_until(ended)
    }

    fn elapsed_until(&self, ended: Option<DateTime<Utc>>) -> Duration {
        let until = ended.unwrap_or_else(|| self.clock.now());
        (until - self.created).to_std().unwrap_or_default()
    }

    /// Close the connection once it has been held for the full timeout or
    /// the peer is gone. Idempotent.
    pub fn update(&self) {
        if self.is_completed() {
            return;
        }
        if self.elapsed() >= self.timeout {
            tracing::debug!(id = self.id, remote = %self.remote_endpoint, "connection timed out");
            self.close();
        } else if !self.socket.is_connected() {
            tracing::debug!(id = self.id, remote = %self.remote_endpoint, "peer disconnected");
            self.close();
        }
    }

    /// Start sending the next chunk in the background. Does nothing while a
    /// previous send is still running or the peer is gone.
    pub fn send(self: &Arc<Self>) {
        if self.is_completed() {
            return;
        }
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.socket.is_connected() {
            self.sending.store(false, Ordering::Release);
            return;
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.send_chunk().await;
            conn.sending.store(false, Ordering::Release);
        });
    }

    async fn send_chunk(&self) {
        let chunk = {
            let mut outbox = self.outbox.lock();
            let mut chunk = std::mem::take(&mut outbox.buffer);
            outbox.reader.read(&mut chunk);
            chunk
        };

        match self.socket.send(&chunk).await {
            Ok(()) => {
                self.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(id = self.id, error = %e, "send failed, closing connection");
                self.close();
            }
        }

        self.outbox.lock().buffer = chunk;
    }

    /// Close the socket and mark the connection completed. Idempotent.
    pub fn close(&self) {
        self.socket.close();
        if !self.completed.load(Ordering::Acquire) {
            let mut ended = self.ended.lock();
            if ended.is_none() {
                *ended = Some(self.clock.now());
            }
            self.completed.store(true, Ordering::Release);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let ended = *self.ended.lock();
        ConnectionStatus {
            id: self.id,
            created: self.created,
            ended,
            duration: self.elapsed_until(ended),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            local_endpoint: self.local_endpoint.clone(),
            remote_endpoint: self.remote_endpoint.clone(),
            completed: self.is_completed(),
        }
    }
}
