use crate::dispatch::DispatchEngine;
use crate::gateway::Gateway;
use actix_web::dev::Server;
use actix_web::{get, App, HttpResponse, HttpServer, Responder};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

/// Health endpoint for the long-running sweeper. Signal handling is left to [`shutdown_signal`].
pub fn health_server(port: u16) -> std::io::Result<Server> {
    let server = HttpServer::new(|| App::new().service(health_check))
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    info!(port, "Health check server running.");
    Ok(server)
}

// Graceful shutdown signal future
pub async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let mut term_signal = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term_signal) => term_signal,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
            return;
        }
    };
    #[cfg(unix)]
    let terminate = term_signal.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received. Exiting sweeper loop.");
}

/// Runs a dispatch pass every `interval` until `cancel` fires, then waits for
/// in-flight passes to finish marking their messages.
pub async fn run_sweeper<G: Gateway + 'static>(
    engine: Arc<DispatchEngine<G>>,
    interval: Duration,
    batch_size: i64,
    cancel: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, batch_size, "Starting outbox sweeper timer...");
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = Arc::clone(&engine);
                let cancel = cancel.clone();

                tracker.spawn(async move {
                    if let Err(e) = engine.process_until(batch_size, &cancel).await {
                        error!("Error during outbox sweep: {}", e);
                    }
                });
            },
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    info!("Sweeper shutting down.");
}
