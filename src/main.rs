use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use timetabled::config::Config;
use timetabled::engine::Engine;
use timetabled::observability;
use timetabled::wire::{self, TimetableFactory};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    observability::init(config.metrics_port);
    let tls = timetabled::tls::load_tls_acceptor(
        config.tls_cert.as_deref(),
        config.tls_key.as_deref(),
    )?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path())?);
    let admin_id = engine
        .ensure_admin(&config.admin_email, "Administrator")
        .await?;
    info!("administrator {} ({admin_id})", config.admin_email);
    info!(
        "loaded {} classrooms, {} timetable entries",
        engine.list_classrooms().await.len(),
        engine.entry_count()
    );

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        timetabled::compactor::run_compactor(compactor_engine, threshold).await;
    });

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("timetabled listening on {}", config.listen_addr());
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  tls: {}", if tls.is_some() { "enabled" } else { "disabled" });

    let factory = TimetableFactory::new(engine, config.password.clone());
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    tokio::select! {
        _ = accept_loop(listener, factory, tls, semaphore.clone()) => {}
        _ = shutdown_signal() => info!("shutdown signal received, stopping accept loop"),
    }

    drain(&semaphore, config.max_connections).await;
    info!("timetabled stopped");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    factory: TimetableFactory,
    tls: Option<pgwire::tokio::TlsAcceptor>,
    semaphore: Arc<Semaphore>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept error: {e}");
                continue;
            }
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        info!("connection from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let factory = factory.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            let _permit = permit; // held until connection closes
            if let Err(e) = wire::process_connection(socket, &factory, tls).await {
                error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Wait for open connections to finish, up to `DRAIN_TIMEOUT`.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while semaphore.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let remaining = max_connections - semaphore.available_permits();
            warn!("drain timeout, {remaining} connections still open");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("all connections drained");
}
