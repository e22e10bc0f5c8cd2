//! Observer registry for the three service events.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use shared::types::ConnectionStatus;
use crate::error::TarpitError;

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: Arc<TarpitError>,
    /// The operation that hit the error gave up entirely
    pub terminating: bool,
}

#[derive(Debug, Clone)]
pub enum TarpitEvent {
    ConnectionCreated(ConnectionStatus),
    ConnectionsUpdated(Vec<ConnectionStatus>),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type CreatedFn = dyn Fn(&ConnectionStatus) + Send + Sync;
type UpdatedFn = dyn Fn(&[ConnectionStatus]) + Send + Sync;
type ErrorFn = dyn Fn(&ErrorEvent) + Send + Sync;

#[derive(Clone)]
enum Handler {
    Created(Arc<CreatedFn>),
    Updated(Arc<UpdatedFn>),
    Error(Arc<ErrorFn>),
    Channel(flume::Sender<TarpitEvent>),
}

impl Handler {
    fn observes_errors(&self) -> bool {
        matches!(self, Handler::Error(_) | Handler::Channel(_))
    }
}

#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Handler)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub fn on_connection_created<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.add(Handler::Created(Arc::new(f)))
    }

    pub fn on_connections_updated<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&[ConnectionStatus]) + Send + Sync + 'static,
    {
        self.add(Handler::Updated(Arc::new(f)))
    }

    /// Registering any error observer switches the owner from fail-fast to
    /// reporting errors here.
    pub fn on_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.add(Handler::Error(Arc::new(f)))
    }

    /// Every event, delivered over a channel. Counts as an error observer
    /// until the receiver is dropped.
    pub fn subscribe(&self) -> flume::Receiver<TarpitEvent> {
        let (tx, rx) = flume::unbounded();
        self.add(Handler::Channel(tx));
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    pub fn has_error_observer(&self) -> bool {
        self.handlers.read().iter().any(|(_, h)| match h {
            Handler::Channel(tx) => !tx.is_disconnected(),
            other => other.observes_errors(),
        })
    }

    /// Announce a new connection. A panicking observer is reported as an
    /// error, or returned when nobody observes errors.
    pub fn connection_created(&self, status: &ConnectionStatus) -> Result<(), TarpitError> {
        let panics = self.dispatch(|handler| match handler {
            Handler::Created(f) => invoke(|| f(status)),
            Handler::Channel(tx) => channel_send(tx, TarpitEvent::ConnectionCreated(status.clone())),
            _ => Delivery::Done,
        });
        self.report_panics("connection created", panics)
    }

    pub fn connections_updated(&self, statuses: &[ConnectionStatus]) -> Result<(), TarpitError> {
        let panics = self.dispatch(|handler| match handler {
            Handler::Updated(f) => invoke(|| f(statuses)),
            Handler::Channel(tx) => channel_send(tx, TarpitEvent::ConnectionsUpdated(statuses.to_vec())),
            _ => Delivery::Done,
        });
        self.report_panics("connections updated", panics)
    }

    /// Deliver `error` to the error observers, or hand it back when there
    /// are none so the caller fails fast.
    pub fn report_error(&self, error: TarpitError, terminating: bool) -> Result<(), TarpitError> {
        if !self.has_error_observer() {
            return Err(error);
        }

        let event = ErrorEvent { error: Arc::new(error), terminating };
        let panics = self.dispatch(|handler| match handler {
            Handler::Error(f) => invoke(|| f(&event)),
            Handler::Channel(tx) => channel_send(tx, TarpitEvent::Error(event.clone())),
            _ => Delivery::Done,
        });
        for message in panics {
            tracing::error!(%message, error = %event.error, "error observer panicked");
        }
        Ok(())
    }

    fn report_panics(&self, event: &'static str, panics: Vec<String>) -> Result<(), TarpitError> {
        for message in panics {
            tracing::warn!(event, %message, "observer panicked");
            self.report_error(TarpitError::ObserverPanicked { event, message }, false)?;
        }
        Ok(())
    }

    /// Runs `deliver` on a copy of the handler list so observers may
    /// (un)subscribe from inside a callback. Closed channels are dropped;
    /// returns the messages of observers that panicked.
    fn dispatch(&self, deliver: impl Fn(&Handler) -> Delivery) -> Vec<String> {
        let handlers = self.handlers.read().clone();
        let mut dead = Vec::new();
        let mut panics = Vec::new();
        for (id, handler) in &handlers {
            match deliver(handler) {
                Delivery::Done => {}
                Delivery::Closed => dead.push(*id),
                Delivery::Panicked(message) => panics.push(message),
            }
        }

        if !dead.is_empty() {
            self.handlers.write().retain(|(id, _)| !dead.contains(id));
        }
        panics
    }
}

enum Delivery {
    Done,
    Closed,
    Panicked(String),
}

fn invoke(f: impl FnOnce()) -> Delivery {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Delivery::Done,
        Err(payload) => Delivery::Panicked(panic_message(&*payload)),
    }
}

fn channel_send(tx: &flume::Sender<TarpitEvent>, event: TarpitEvent) -> Delivery {
    match tx.send(event) {
        Ok(()) => Delivery::Done,
        Err(_) => Delivery::Closed,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
