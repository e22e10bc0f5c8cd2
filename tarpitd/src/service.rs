use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use shared::types::ConnectionStatus;
use crate::clock::{Clock, SystemClock};
use crate::connection::ConnectionSettings;
use crate::error::TarpitError;
use crate::events::{ErrorEvent, EventHub, SubscriptionId, TarpitEvent};
use crate::listeners::{AcceptContext, ListenerSet};
use crate::net::tcp::TcpSocketFactory;
use crate::net::SocketFactory;
use crate::options::{TarpitOptions, TarpitOptionsUpdate};
use crate::ports::PortSet;
use crate::registry::ConnectionRegistry;
use crate::scheduler::{TickContext, UpdateScheduler};
use crate::source::{ByteSource, FileSystem, LocalFileSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No options applied yet
    Unconfigured,
    /// Valid options, nothing listening
    Configured,
    /// Scheduler ticking, at least one listener bound at start
    Running,
    /// Torn down; may be reconfigured and started again
    Stopped,
}

/// The platform capabilities the service runs on.
#[derive(Clone)]
pub struct Collaborators {
    pub sockets: Arc<dyn SocketFactory>,
    pub files: Arc<dyn FileSystem>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            sockets: Arc::new(TcpSocketFactory),
            files: Arc::new(LocalFileSystem),
            clock: Arc::new(SystemClock),
        }
    }
}

struct Running {
    listeners: ListenerSet,
    scheduler: UpdateScheduler,
}

struct ServiceInner {
    state: Mutex<ServiceState>,
    options: RwLock<Option<TarpitOptions>>,
    events: Arc<EventHub>,
    registry: Arc<ConnectionRegistry>,
    running: tokio::sync::Mutex<Option<Running>>,
    /// Mirrors the listener count of `running` for the synchronous
    /// `configure` check. Written only with `running` held.
    active_listeners: AtomicUsize,
    collaborators: Collaborators,
}

impl ServiceInner {
    fn publish_listeners(&self, running: &Option<Running>) {
        let count = running.as_ref().map_or(0, |r| r.listeners.len());
        self.active_listeners.store(count, Ordering::Release);
    }
}

/// Tarpit facade: configuration, start/stop and event subscription.
/// Cheap to clone; clones share the same service.
#[derive(Clone)]
pub struct TarpitService {
    inner: Arc<ServiceInner>,
}

impl TarpitService {
    /// A service with validated options, ready to start.
    pub fn new(options: TarpitOptions) -> Result<Self, TarpitError> {
        Self::with_collaborators(Some(options), Collaborators::default())
    }

    /// A service that must be configured before it can start.
    pub fn unconfigured() -> Self {
        Self::build(None, Collaborators::default())
    }

    pub fn with_collaborators(
        options: Option<TarpitOptions>,
        collaborators: Collaborators,
    ) -> Result<Self, TarpitError> {
        if let Some(options) = &options {
            options.validate()?;
        }
        Ok(Self::build(options, collaborators))
    }

    fn build(options: Option<TarpitOptions>, collaborators: Collaborators) -> Self {
        let state = if options.is_some() {
            ServiceState::Configured
        } else {
            ServiceState::Unconfigured
        };

        Self {
            inner: Arc::new(ServiceInner {
                state: Mutex::new(state),
                options: RwLock::new(options),
                events: Arc::new(EventHub::new()),
                registry: Arc::new(ConnectionRegistry::new()),
                running: tokio::sync::Mutex::new(None),
                active_listeners: AtomicUsize::new(0),
                collaborators,
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    pub fn options(&self) -> Option<TarpitOptions> {
        self.inner.options.read().clone()
    }

    /// Merge `update` into the current options (or the defaults, when
    /// unconfigured). Refused while any listener is bound; a failed call
    /// leaves the options untouched. Options changed while the service is
    /// still running take effect on the next start.
    pub fn configure(&self, update: &TarpitOptionsUpdate) -> Result<(), TarpitError> {
        let mut state = self.inner.state.lock();
        if self.inner.active_listeners.load(Ordering::Acquire) > 0 {
            return Err(TarpitError::Locked);
        }

        let mut options = self.inner.options.write();
        let base = options.clone().unwrap_or_default();
        let merged = update.apply_to(&base)?;
        merged.validate()?;

        *options = Some(merged);
        if *state == ServiceState::Unconfigured {
            *state = ServiceState::Configured;
        }
        Ok(())
    }

    /// Load the response source, bind every configured port and start the
    /// scheduler. Returns how many ports are listening.
    ///
    /// With an error observer registered, a start that cannot go ahead is
    /// reported as a terminating error and returns `Ok(0)` with the state
    /// unchanged. Without one the error is returned.
    pub async fn start(&self) -> Result<usize, TarpitError> {
        let mut running = self.inner.running.lock().await;

        let (previous, options) = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            match previous {
                ServiceState::Running => return Err(TarpitError::AlreadyRunning),
                ServiceState::Unconfigured => return Err(TarpitError::NotConfigured),
                ServiceState::Configured | ServiceState::Stopped => {}
            }
            let options = self.inner.options.read().clone().ok_or(TarpitError::NotConfigured)?;
            *state = ServiceState::Running;
            (previous, options)
        };

        let failure = match self.launch(&options).await {
            Ok(Some(launched)) => {
                let count = launched.listeners.len();
                tracing::info!(listeners = count, address = %options.listen_address, "tarpit started");
                *running = Some(launched);
                self.inner.publish_listeners(&running);
                return Ok(count);
            }
            Ok(None) => TarpitError::NoListeners,
            Err(e) => e,
        };

        *self.inner.state.lock() = previous;
        tracing::warn!(error = %failure, "tarpit failed to start");
        self.inner.events.report_error(failure, true)?;
        Ok(0)
    }

    /// `Ok(None)` when every port failed and the failures went to an error
    /// observer.
    async fn launch(&self, options: &TarpitOptions) -> Result<Option<Running>, TarpitError> {
        options.validate()?;
        let collaborators = &self.inner.collaborators;

        let source = Arc::new(ByteSource::load(options.response(), &*collaborators.files)?);
        let ports: PortSet = options.ports.parse()?;
        let address = options.listen_ip()?;

        let context = Arc::new(AcceptContext {
            registry: Arc::clone(&self.inner.registry),
            events: Arc::clone(&self.inner.events),
            source,
            clock: Arc::clone(&collaborators.clock),
            settings: ConnectionSettings {
                write_size: options.write_size,
                timeout: options.timeout(),
                send_timeout: options.send_timeout(),
            },
        });

        let mut listeners = ListenerSet::new(
            Arc::clone(&collaborators.sockets),
            address,
            options.ipv4_only,
            context,
        );

        for port in ports {
            if let Err(e) = listeners.add(port) {
                tracing::warn!(port, error = %e, "failed to start listener");
                if let Err(e) = self.inner.events.report_error(e, false) {
                    listeners.clear().await;
                    return Err(e);
                }
            }
        }
        if listeners.is_empty() {
            return Ok(None);
        }

        let ticks = Arc::new(TickContext::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.events),
            Arc::clone(&collaborators.clock),
            options.update_interval(),
        ));
        let scheduler = UpdateScheduler::spawn(ticks, options.write_interval());

        Ok(Some(Running { listeners, scheduler }))
    }

    /// Stop ticking and accepting, force-close every remaining connection
    /// and publish one final aggregate update. No-op unless running.
    pub async fn stop(&self) {
        let mut running = self.inner.running.lock().await;
        let Some(Running { mut listeners, scheduler }) = running.take() else {
            return;
        };
        self.inner.publish_listeners(&running);

        scheduler.shutdown().await;
        listeners.clear().await;

        let connections = self.inner.registry.drain();
        for conn in &connections {
            conn.close();
        }
        let statuses: Vec<ConnectionStatus> = connections.iter().map(|c| c.status()).collect();

        *self.inner.state.lock() = ServiceState::Stopped;
        tracing::info!(connections = statuses.len(), "tarpit stopped");
        if let Err(e) = self.inner.events.connections_updated(&statuses) {
            tracing::error!(error = %e, "failed to publish final connection update");
        }
    }

    /// Start listening on one more port while running. `Ok(false)` when
    /// the port was already bound, or its bind failure went to an error
    /// observer.
    pub async fn add_listener(&self, port: u16) -> Result<bool, TarpitError> {
        let mut running = self.inner.running.lock().await;
        let launched = running.as_mut().ok_or(TarpitError::NotRunning)?;

        let result = launched.listeners.add(port);
        self.inner.publish_listeners(&running);
        match result {
            Ok(added) => {
                if added {
                    tracing::info!(port, "listener added");
                }
                Ok(added)
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "failed to add listener");
                self.inner.events.report_error(e, false)?;
                Ok(false)
            }
        }
    }

    /// Returns how many of `ports` were newly bound.
    pub async fn add_listeners(&self, ports: impl IntoIterator<Item = u16>) -> Result<usize, TarpitError> {
        let mut added = 0;
        for port in ports {
            if self.add_listener(port).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn remove_listener(&self, port: u16) -> bool {
        let mut running = self.inner.running.lock().await;
        let Some(launched) = running.as_mut() else {
            return false;
        };

        let removed = launched.listeners.remove(port).await;
        self.inner.publish_listeners(&running);
        if removed {
            tracing::info!(port, "listener removed");
        }
        removed
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.running.lock().await.as_ref().map_or(0, |r| r.listeners.len())
    }

    pub async fn listening_ports(&self) -> Vec<u16> {
        self.inner.running.lock().await.as_ref().map_or_else(Vec::new, |r| r.listeners.ports())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn current_connections(&self) -> Vec<ConnectionStatus> {
        self.inner.registry.snapshot().iter().map(|c| c.status()).collect()
    }

    /// Force one connection closed. Returns false if no such connection is
    /// tracked.
    pub fn close_connection(&self, id: u32) -> bool {
        match self.inner.registry.get(id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn on_connection_created<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.events.on_connection_created(f)
    }

    pub fn on_connections_updated<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&[ConnectionStatus]) + Send + Sync + 'static,
    {
        self.inner.events.on_connections_updated(f)
    }

    pub fn on_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_error(f)
    }

    pub fn subscribe(&self) -> flume::Receiver<TarpitEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use crate::clock::ManualClock;
    use crate::net::fake::FakeSocketFactory;

    struct Harness {
        factory: Arc<FakeSocketFactory>,
        clock: Arc<ManualClock>,
        service: TarpitService,
    }

    struct OneFile;

    impl FileSystem for OneFile {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            if path == Path::new("/srv/tarpit/banner.txt") {
                Ok(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec())
            } else {
                Err(io::ErrorKind::NotFound.into())
            }
        }
    }

    fn harness(update: TarpitOptionsUpdate) -> Harness {
        let base = TarpitOptionsUpdate {
            ports: Some("8001".to_string()),
            write_interval_ms: Some(10),
            update_interval_secs: Some(1),
            ..Default::default()
        }
        .apply_to(&TarpitOptions::default())
        .unwrap();
        let options = update.apply_to(&base).unwrap();

        let factory = Arc::new(FakeSocketFactory::default());
        let clock = Arc::new(ManualClock::new());
        let service = TarpitService::with_collaborators(
            Some(options),
            Collaborators {
                sockets: factory.clone(),
                files: Arc::new(OneFile),
                clock: clock.clone(),
            },
        )
        .unwrap();

        Harness { factory, clock, service }
    }

    fn ports(spec: &str) -> TarpitOptionsUpdate {
        TarpitOptionsUpdate {
            ports: Some(spec.to_string()),
            ..Default::default()
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_port_range_spanning_100_binds_100_listeners() {
        let h = harness(ports("1-100"));

        assert_eq!(h.service.start().await.unwrap(), 100);
        assert_eq!(h.service.state(), ServiceState::Running);
        assert_eq!(h.service.listener_count().await, 100);

        h.service.stop().await;
        assert_eq!(h.service.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failures_go_to_error_observer() {
        let h = harness(ports("1-100"));
        for port in (2..=100).step_by(2) {
            h.factory.fail_port(port);
        }
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_in = Arc::clone(&errors);
        h.service.on_error(move |event| {
            assert!(!event.terminating);
            assert!(matches!(*event.error, TarpitError::Bind { .. }));
            errors_in.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(h.service.start().await.unwrap(), 50);
        assert_eq!(errors.load(Ordering::SeqCst), 50);

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_without_observer_fails_start() {
        let h = harness(ports("10-20"));
        h.factory.fail_port(15);

        let err = h.service.start().await.unwrap_err();

        assert!(matches!(err, TarpitError::Bind { ref addr, .. } if addr.port() == 15));
        assert_eq!(h.service.state(), ServiceState::Configured);
        assert_eq!(h.service.listener_count().await, 0);
        assert!(h.factory.connect(10).is_none());
    }

    #[tokio::test]
    async fn test_start_with_no_bound_port_is_not_running() {
        let h = harness(ports("20-22"));
        for port in 20..=22 {
            h.factory.fail_port(port);
        }
        let events = h.service.subscribe();

        assert_eq!(h.service.start().await.unwrap(), 0);
        assert_eq!(h.service.state(), ServiceState::Configured);
        assert_eq!(h.service.listener_count().await, 0);
        h.service.configure(&ports("30")).unwrap();

        let errors: Vec<ErrorEvent> = events
            .drain()
            .filter_map(|event| match event {
                TarpitEvent::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 4);
        assert!(errors[..3].iter().all(|e| !e.terminating));
        assert!(errors[3].terminating);
        assert!(matches!(*errors[3].error, TarpitError::NoListeners));

        assert_eq!(h.service.start().await.unwrap(), 1);
        assert_eq!(h.service.state(), ServiceState::Running);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_configure_allowed_once_last_listener_removed() {
        let h = harness(ports("8001-8002"));
        h.service.start().await.unwrap();

        assert!(h.service.remove_listener(8001).await);
        assert!(matches!(h.service.configure(&ports("9000")), Err(TarpitError::Locked)));
        assert!(h.service.remove_listener(8002).await);
        h.service.configure(&ports("9000")).unwrap();

        assert!(h.service.add_listener(8003).await.unwrap());
        assert!(matches!(h.service.configure(&ports("9001")), Err(TarpitError::Locked)));

        h.service.stop().await;
        assert_eq!(h.service.start().await.unwrap(), 1);
        assert_eq!(h.service.listening_ports().await, vec![9000]);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_is_terminating_when_observed() {
        let h = harness(TarpitOptionsUpdate {
            response_file: Some("/nowhere.bin".into()),
            ..Default::default()
        });
        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_in = Arc::clone(&reported);
        h.service.on_error(move |event| reported_in.lock().push(event.clone()));

        assert_eq!(h.service.start().await.unwrap(), 0);
        assert_eq!(h.service.state(), ServiceState::Configured);
        assert_eq!(h.factory.binds(), 0);

        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].terminating);
        assert!(matches!(*reported[0].error, TarpitError::ResponseFile { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connections_get_unique_ids() {
        let h = harness(ports("1-100"));
        let ids = Arc::new(Mutex::new(Vec::new()));
        let ids_in = Arc::clone(&ids);
        h.service.on_connection_created(move |status| ids_in.lock().push(status.id));
        h.service.start().await.unwrap();

        let connects: Vec<_> = (1..=100u16)
            .map(|port| {
                let factory = Arc::clone(&h.factory);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        factory.connect(port).unwrap();
                    }
                })
            })
            .collect();
        futures::future::join_all(connects).await;
        wait_for(|| ids.lock().len() == 1000).await;
        h.service.stop().await;

        let unique: HashSet<u32> = ids.lock().iter().copied().collect();
        assert_eq!(unique.len(), 1000);
    }

    #[tokio::test]
    async fn test_accepted_socket_gets_configured_options() {
        let h = harness(TarpitOptionsUpdate {
            write_size: Some(10),
            send_timeout_ms: Some(3000),
            ..Default::default()
        });
        assert_eq!(h.service.start().await.unwrap(), 1);

        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        h.service.stop().await;

        assert_eq!(socket.send_buffer_size(), 10);
        assert_eq!(socket.send_timeout(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_remote_disconnect_completes_and_prunes() {
        let h = harness(TarpitOptionsUpdate::default());
        let updates = h.service.subscribe();
        h.service.start().await.unwrap();

        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        socket.set_connected(false);
        wait_for(|| h.service.current_connections().iter().all(|c| c.completed)).await;

        h.clock.advance_secs(2);
        wait_for(|| h.service.connection_count() == 0).await;

        let batch = updates
            .drain()
            .find_map(|event| match event {
                TarpitEvent::ConnectionsUpdated(batch) => Some(batch),
                _ => None,
            })
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].completed);

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_send_error_completes_connection() {
        let h = harness(TarpitOptionsUpdate::default());
        h.service.start().await.unwrap();

        let socket = h.factory.connect(8001).unwrap();
        socket.fail_sends();
        wait_for(|| {
            let current = h.service.current_connections();
            current.len() == 1 && current[0].completed
        })
        .await;

        assert!(socket.is_closed());
        assert_eq!(h.service.current_connections()[0].bytes_sent, 0);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_closes_connected_peer() {
        let h = harness(TarpitOptionsUpdate {
            timeout_secs: Some(30),
            update_interval_secs: Some(3600),
            ..Default::default()
        });
        h.service.start().await.unwrap();

        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        h.clock.advance_secs(29);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!h.service.current_connections()[0].completed);

        h.clock.advance_secs(1);
        wait_for(|| h.service.current_connections().iter().all(|c| c.completed)).await;

        assert!(socket.is_closed());
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_bytes_sent_tracks_writes() {
        let h = harness(TarpitOptionsUpdate {
            write_size: Some(10),
            response_text: Some("abcdefghijklmnop".to_string()),
            ..Default::default()
        });
        let last = Arc::new(Mutex::new(Vec::new()));
        let last_in = Arc::clone(&last);
        h.service.on_connections_updated(move |batch| *last_in.lock() = batch.to_vec());
        h.service.start().await.unwrap();

        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| socket.sends() >= 3).await;
        h.service.stop().await;

        let last = last.lock();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].bytes_sent, 10 * socket.sends() as u64);
        assert!(socket.sent().starts_with(b"abcdefghijklmnopabcd"));
    }

    #[tokio::test]
    async fn test_stop_emits_one_final_update_with_all_completed() {
        let h = harness(TarpitOptionsUpdate {
            update_interval_secs: Some(3600),
            ..Default::default()
        });
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batches_in = Arc::clone(&batches);
        h.service.on_connections_updated(move |batch| batches_in.lock().push(batch.to_vec()));
        h.service.start().await.unwrap();

        for _ in 0..3 {
            h.factory.connect(8001).unwrap();
        }
        wait_for(|| h.service.connection_count() == 3).await;
        h.service.stop().await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(batches[0].iter().all(|s| s.completed && s.ended.is_some()));
        assert_eq!(h.service.state(), ServiceState::Stopped);
        assert_eq!(h.service.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_configure_refused_while_running() {
        let h = harness(TarpitOptionsUpdate::default());
        h.service.start().await.unwrap();
        let before = h.service.options();

        let err = h.service.configure(&ports("9000")).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(h.service.options(), before);

        h.service.stop().await;
        h.service.configure(&ports("9000")).unwrap();
        assert_eq!(h.service.options().unwrap().ports, "9000");
    }

    #[tokio::test]
    async fn test_invalid_configure_keeps_previous_options() {
        let h = harness(TarpitOptionsUpdate::default());
        let before = h.service.options();

        let err = h.service.configure(&ports("5-1")).unwrap_err();
        assert!(matches!(err, TarpitError::InvalidPorts { .. }));
        assert_eq!(h.service.options(), before);
    }

    #[tokio::test]
    async fn test_unconfigured_service_must_be_configured_first() {
        let service = TarpitService::unconfigured();
        assert_eq!(service.state(), ServiceState::Unconfigured);
        assert!(matches!(service.start().await, Err(TarpitError::NotConfigured)));

        service.configure(&ports("7000-7001")).unwrap();
        assert_eq!(service.state(), ServiceState::Configured);
        let options = service.options().unwrap();
        assert_eq!(options.ports, "7000-7001");
        assert_eq!(options.write_size, TarpitOptions::default().write_size);
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let h = harness(TarpitOptionsUpdate::default());
        h.service.start().await.unwrap();

        assert!(matches!(h.service.start().await, Err(TarpitError::AlreadyRunning)));
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_close_connection_by_id() {
        let h = harness(TarpitOptionsUpdate::default());
        h.service.start().await.unwrap();
        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        let id = h.service.current_connections()[0].id;

        assert!(!h.service.close_connection(id + 1));
        assert!(h.service.close_connection(id));
        assert!(socket.is_closed());
        assert!(h.service.current_connections()[0].completed);

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_listeners_added_and_removed_at_runtime() {
        let h = harness(TarpitOptionsUpdate::default());
        assert!(matches!(h.service.add_listener(9001).await, Err(TarpitError::NotRunning)));
        h.service.start().await.unwrap();

        assert!(h.service.add_listener(9001).await.unwrap());
        assert!(!h.service.add_listener(9001).await.unwrap());
        assert_eq!(h.service.add_listeners([9002, 9003, 8001]).await.unwrap(), 2);
        assert_eq!(h.service.listening_ports().await, vec![8001, 9001, 9002, 9003]);

        assert!(h.service.remove_listener(8001).await);
        assert!(!h.service.remove_listener(8001).await);
        assert!(h.factory.connect(8001).is_none());
        assert!(h.factory.connect(9002).is_some());
        wait_for(|| h.service.connection_count() == 1).await;

        h.factory.fail_port(9100);
        assert!(matches!(h.service.add_listener(9100).await, Err(TarpitError::Bind { .. })));
        let _errors = h.service.subscribe();
        assert!(!h.service.add_listener(9100).await.unwrap());

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_response_file_is_loaded() {
        let h = harness(TarpitOptionsUpdate {
            write_size: Some(7),
            response_file: Some("/srv/tarpit/banner.txt".into()),
            ..Default::default()
        });
        h.service.start().await.unwrap();

        let socket = h.factory.connect(8001).unwrap();
        wait_for(|| socket.sends() >= 1).await;
        h.service.stop().await;

        assert!(socket.sent().starts_with(b"SSH-2.0"));
    }

    #[tokio::test]
    async fn test_missing_response_file_fails_start() {
        let h = harness(TarpitOptionsUpdate {
            response_file: Some("/nowhere.bin".into()),
            ..Default::default()
        });

        let err = h.service.start().await.unwrap_err();
        assert!(matches!(err, TarpitError::ResponseFile { .. }));
        assert_eq!(h.service.state(), ServiceState::Configured);
        assert_eq!(h.factory.binds(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_ids_increasing() {
        let h = harness(TarpitOptionsUpdate::default());

        h.service.start().await.unwrap();
        h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        let first = h.service.current_connections()[0].id;
        h.service.stop().await;

        assert_eq!(h.service.start().await.unwrap(), 1);
        h.factory.connect(8001).unwrap();
        wait_for(|| h.service.connection_count() == 1).await;
        assert!(h.service.current_connections()[0].id > first);
        h.service.stop().await;
    }
}
