use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use termin::config::Config;
use termin::engine::Engine;
use termin::notify::{LogDelivery, NotifyHub, run_mailer};
use termin::{maintenance, observability, wire};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("termin.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        wal_path,
        Arc::clone(&notify),
        config.lookahead_days,
    )?);
    if let Err(err) = engine.seed_defaults().await {
        error!(%err, "failed to seed default service types");
        return Err(io::Error::other(err.to_string()));
    }

    tokio::spawn(run_mailer(Arc::clone(&engine), Arc::new(LogDelivery)));
    tokio::spawn(maintenance::run_compactor(
        Arc::clone(&engine),
        config.compact_threshold,
    ));

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!(bind = %config.bind, port = config.port, "listening");

    let permits = Arc::new(Semaphore::new(config.max_connections));
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    warn!(%peer, "connection limit reached, refusing");
                    drop(socket);
                    continue;
                };
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Err(err) = wire::process_connection(socket, engine).await {
                        warn!(%peer, %err, "connection closed with error");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                    drop(permit);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    // Stop accepting, then give open connections a moment to finish.
    drop(listener);
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while permits.available_permits() < config.max_connections {
        if tokio::time::Instant::now() >= deadline {
            warn!("drain timeout reached, exiting with connections open");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("shutdown complete");
    Ok(())
}
