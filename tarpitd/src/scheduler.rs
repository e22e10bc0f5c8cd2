use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::types::ConnectionStatus;
use crate::clock::Clock;
use crate::events::EventHub;
use crate::registry::ConnectionRegistry;

/// Shared state for every tick.
pub struct TickContext {
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    update_interval: chrono::Duration,
    next_update: Mutex<DateTime<Utc>>,
    busy: Arc<AtomicBool>,
}

impl TickContext {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: Arc<EventHub>,
        clock: Arc<dyn Clock>,
        update_interval: Duration,
    ) -> Self {
        let update_interval = chrono::Duration::from_std(update_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(i32::MAX)));
        let next_update = clock.now() + update_interval;
        Self {
            registry,
            events,
            clock,
            update_interval,
            next_update: Mutex::new(next_update),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Advance every live connection and, once the aggregate deadline has
    /// passed, publish the batch and prune the connections it reported as
    /// completed. A connection completing after its status was taken stays
    /// until the next batch.
    pub fn tick(&self) {
        let connections = self.registry.snapshot();

        for conn in &connections {
            conn.update();
        }
        for conn in &connections {
            conn.send();
        }

        if connections.is_empty() {
            return;
        }

        let now = self.clock.now();
        {
            let mut next_update = self.next_update.lock();
            if now < *next_update {
                return;
            }
            *next_update = now + self.update_interval;
        }

        let statuses: Vec<ConnectionStatus> = connections.iter().map(|c| c.status()).collect();
        if let Err(e) = self.events.connections_updated(&statuses) {
            tracing::error!(error = %e, "failed to publish connection update");
        }
        let completed: Vec<u32> = statuses.iter().filter(|s| s.completed).map(|s| s.id).collect();
        let removed = self.registry.remove_ids(&completed);
        tracing::trace!(connections = statuses.len(), removed, "aggregate update");
    }
}

/// Holds the busy flag for one tick; clears it when dropped.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic driver. A tick that fires while the previous one is still
/// running is dropped, never queued.
pub struct UpdateScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    in_flight: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UpdateScheduler {
    pub fn spawn(context: Arc<TickContext>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run(context, interval, cancel.clone(), Arc::clone(&in_flight)));
        Self { cancel, task, in_flight }
    }

    /// Stop ticking. When this returns no tick is running or will run.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "scheduler loop ended abnormally");
        }
        let last = self.in_flight.lock().take();
        if let Some(last) = last {
            if let Err(e) = last.await {
                tracing::warn!(error = %e, "scheduler tick ended abnormally");
            }
        }
    }
}

async fn run(
    context: Arc<TickContext>,
    interval: Duration,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<Option<JoinHandle<()>>>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(guard) = BusyGuard::try_acquire(&context.busy) else {
                    tracing::trace!("previous tick still running, dropping tick");
                    continue;
                };
                let context = Arc::clone(&context);
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    context.tick();
                });
                *in_flight.lock() = Some(handle);
            }
        }
    }
}
