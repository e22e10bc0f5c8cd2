use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use tarpitd::api;
use tarpitd::config::Config;
use tarpitd::{TarpitEvent, TarpitService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tarpitd=info"))
        )
        .init();

    tracing::info!("Starting tarpitd");

    // Load config; without an argument run on defaults
    let config = match std::env::args().nth(1) {
        Some(config_path) => {
            let config = Config::load(&config_path)
                .with_context(|| format!("Failed to load config from {}", config_path))?;
            tracing::info!("Loaded config from {}", config_path);
            config
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Config::default()
        }
    };

    let options = config.tarpit_options()?;
    let service = TarpitService::new(options).context("Invalid tarpit options")?;

    // Observe events before starting so bind failures are reported, not fatal
    let cancel = CancellationToken::new();
    let events = service.subscribe();
    let events_done = CancellationToken::new();
    let events_cancel = events_done.clone();
    let events_handle = tokio::spawn(async move {
        log_events(events, events_cancel).await;
    });

    let listeners = service.start().await.context("Failed to start tarpit")?;
    if listeners == 0 {
        tracing::warn!("Tarpit did not start; only the status API is serving");
    }

    let server_handle = match &config.api.listen {
        Some(listen) => Some(serve_api(listen, service.clone(), cancel.clone()).await?),
        None => None,
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    service.stop().await;
    events_done.cancel();
    let _ = events_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve_api(
    listen: &str,
    service: TarpitService,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let app = api::routes::router(api::routes::AppState { service });

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    }))
}

/// Log service events until cancelled, then drain what is still queued so
/// the final update from `stop` is not lost.
async fn log_events(events: flume::Receiver<TarpitEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = events.recv_async() => match event {
                Ok(event) => log_event(&event),
                Err(_) => break,
            },
            _ = cancel.cancelled() => {
                for event in events.drain() {
                    log_event(&event);
                }
                break;
            }
        }
    }
}

fn log_event(event: &TarpitEvent) {
    match event {
        TarpitEvent::ConnectionCreated(status) => {
            tracing::info!(id = status.id, remote = %status.remote_endpoint, local = %status.local_endpoint, "connection trapped");
        }
        TarpitEvent::ConnectionsUpdated(statuses) => {
            let active = statuses.iter().filter(|s| !s.completed).count();
            let bytes: u64 = statuses.iter().map(|s| s.bytes_sent).sum();
            tracing::info!(connections = statuses.len(), active, bytes_sent = bytes, "connections updated");
            for status in statuses.iter().filter(|s| s.completed) {
                tracing::info!(
                    id = status.id,
                    remote = %status.remote_endpoint,
                    held_secs = status.duration.as_secs(),
                    bytes_sent = status.bytes_sent,
                    "connection released"
                );
            }
        }
        TarpitEvent::Error(event) if event.terminating => {
            tracing::error!(error = %event.error, "tarpit error");
        }
        TarpitEvent::Error(event) => {
            tracing::warn!(error = %event.error, "tarpit error");
        }
    }
}
