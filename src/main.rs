use std::sync::Arc;

use chain_registry::config::Config;
use chain_registry::registry::{self, Registry, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = registry::from_config(&config.registry).await;
    let service = config.service.to_service_info();

    registry.register(&service).await?;
    tracing::info!(
        service_id = %service.id,
        service_name = %service.name,
        backend = %registry.kind(),
        "Service advertised, waiting for shutdown signal"
    );

    // 启动心跳任务
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(heartbeat_loop(
        registry.clone(),
        service.clone(),
        config.service.heartbeat_interval(),
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down...");

    shutdown.cancel();
    tracker.close();
    tracker.wait().await;

    if let Err(e) = registry.deregister(&service.id).await {
        tracing::error!(service_id = %service.id, error = %e, "Failed to deregister service");
    }
    if let Err(e) = registry.close().await {
        tracing::error!(error = %e, "Failed to close registry");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn heartbeat_loop(
    registry: Arc<dyn Registry>,
    service: ServiceInfo,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match registry.health_check(&service.id).await {
                    Ok(()) => tracing::debug!(service_id = %service.id, "Heartbeat sent"),
                    Err(e) if e.requires_reregistration() => {
                        tracing::warn!(
                            service_id = %service.id,
                            error = %e,
                            "Registration lost, registering again"
                        );
                        if let Err(e) = registry.register(&service).await {
                            tracing::error!(service_id = %service.id, error = %e, "Failed to re-register service");
                        }
                    }
                    Err(e) => tracing::warn!(service_id = %service.id, error = %e, "Heartbeat failed"),
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
