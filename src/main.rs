use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use push_relay::config::{LoggingConfig, Settings};
use push_relay::postgres::PostgresPool;
use push_relay::queue::{create_task_queue, ConsumerConfig, QueueConsumer};
use push_relay::repository::{create_repository, Repository};
use push_relay::server::{create_app, AppState};
use push_relay::shutdown::{GracefulShutdown, ShutdownConfig};
use push_relay::targets::TargetRegistry;
use push_relay::tenant::Resolver;
use push_relay::worker::DispatchWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.logging);
    tracing::info!("Configuration loaded");

    // Persistence
    let pool = if settings.database.enabled {
        Some(PostgresPool::new(&settings.database).await?)
    } else {
        None
    };
    let repository = create_repository(&settings, pool);

    // Delivery targets: load and run all of them before taking any work
    let registry = match start_targets(repository.as_ref()).await {
        Ok(registry) => registry,
        Err(e) => {
            repository.close().await;
            return Err(e);
        }
    };

    // From here on every exit path goes through the shutdown sequence
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let grace = Duration::from_secs(settings.worker.shutdown_grace_seconds);
    let shutdown = GracefulShutdown::with_config(
        registry.clone(),
        repository.clone(),
        shutdown_tx.clone(),
        ShutdownConfig::for_grace_period(grace),
    );

    // Queue transport
    let queue = match create_task_queue(&settings).await {
        Ok(queue) => queue,
        Err(e) => {
            shutdown.execute("queue unavailable", None).await;
            return Err(e.into());
        }
    };

    // Dispatch worker
    let consumer_handle = if settings.worker.enabled {
        let worker = Arc::new(DispatchWorker::new(
            Resolver::new(repository.clone()),
            registry.clone(),
        ));
        let consumer = QueueConsumer::new(
            queue.clone(),
            worker,
            ConsumerConfig::from(&settings.worker),
        );
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { consumer.run(shutdown_rx).await }))
    } else {
        None
    };

    // HTTP ingress
    let served = if settings.server.enabled {
        let state = AppState::new(settings.clone(), repository.clone(), queue.clone());
        serve(&settings.server_addr(), create_app(state)).await
    } else {
        tracing::info!("HTTP server disabled, running worker only");
        shutdown_signal().await;
        Ok(())
    };

    let reason = match &served {
        Ok(()) => "signal",
        Err(e) => {
            tracing::error!(error = %e, "HTTP server failed");
            "server failure"
        }
    };
    let result = shutdown.execute(reason, consumer_handle).await;

    tracing::info!(success = result.success, "Relay shutdown complete");
    served
}

async fn start_targets(repository: &dyn Repository) -> Result<Arc<TargetRegistry>> {
    let targets: Vec<_> = repository
        .get_targets()
        .await?
        .into_iter()
        .filter(|target| target.enable)
        .collect();

    let registry = TargetRegistry::from_targets(&targets)?;
    if let Err(e) = registry.load_all().await {
        if let Err(shutdown) = registry.shutdown_all().await {
            tracing::warn!(error = %shutdown, "Target cleanup after failed load");
        }
        return Err(e.into());
    }
    // run_all shuts down what it started when it fails
    registry.run_all().await?;

    tracing::info!(targets = registry.len(), "Targets running");
    Ok(Arc::new(registry))
}

async fn serve(addr: &str, app: Router) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
