//! Rota Modem - Entry Point
//!
//! Discovers modems, starts one proxy per interface and serves the control API
//! until a shutdown signal arrives.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_modem::api::{ApiServer, AppState};
use rota_modem::config::Config;
use rota_modem::error::Result;
use rota_modem::modem::create_provider;
use rota_modem::proxy::{HttpProbe, InstanceContext, ProxyPool, RotationQueue};
use rota_modem::services::{IpLog, RefreshHandle, RefreshService};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("Starting Rota Modem");
    info!(
        backend = config.modem.backend.as_str(),
        control = %config.control_addr(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let provider = create_provider(&config.modem);
    let ctx = InstanceContext {
        config: Arc::new(config.clone()),
        provider,
        probe: Arc::new(HttpProbe::from_config(&config.health)),
        ip_log: Arc::new(IpLog::new(&config.health.ip_log_path)),
        queue: Arc::new(RotationQueue::new()),
        shutdown: shutdown_rx.clone(),
    };
    let pool = Arc::new(ProxyPool::new(ctx));

    // The control listener is the only fatal bind.
    let api_server = ApiServer::bind(&config, AppState::new(&config, pool.clone())).await?;

    match pool.refresh().await {
        Ok(summary) => info!(created = ?summary.created, "Initial modem discovery complete"),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => error!(kind = %e.kind(), "Initial modem discovery failed: {}", e),
    }

    // Periodic interface discovery
    let (refresh_handle, refresh_shutdown) = RefreshHandle::new();
    let refresh_service = RefreshService::new(pool.clone(), config.pool.refresh_interval);
    let refresh_task = tokio::spawn(async move {
        refresh_service.run(refresh_shutdown).await;
    });

    let queue_pool = pool.clone();
    let queue_shutdown = shutdown_rx.clone();
    let queue_task = tokio::spawn(async move {
        queue_pool.run_queue_worker(queue_shutdown).await;
    });

    let api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!(kind = %e.kind(), fatal = e.is_fatal(), "Control API error: {}", e);
        }
    });

    info!(instances = pool.len(), "Rota Modem started");

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    refresh_handle.shutdown();

    let _ = tokio::join!(refresh_task, queue_task, api_task);
    pool.shutdown().await;

    info!("Rota Modem stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_modem={},tower_http=info", config.log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
