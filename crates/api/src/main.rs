//! API server entry point.

use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaPersistence};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn serve<P: SagaPersistence + Clone + 'static>(
    store: P,
    config: Config,
    metrics_handle: PrometheusHandle,
) {
    let state = api::create_state(store, &config).expect("invalid saga definition");

    // Finish whatever a previous process left behind before taking traffic.
    match state.recovery.recover_all().await {
        Ok(report) => tracing::info!(
            recovered = report.recovered.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            dead_lettered = report.dead_lettered.len(),
            "startup recovery finished"
        ),
        Err(e) => tracing::error!(error = %e, "startup recovery failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recovery = state.recovery.clone();
    let interval = config.recovery_interval;
    let recovery_task = tokio::spawn(async move {
        recovery.run_periodic(interval, shutdown_rx).await;
    });

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, owner = %config.owner_id, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = recovery_task.await {
        tracing::error!(error = %e, "recovery task panicked");
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the saga store and run the server over it
    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            let store = PostgresSagaStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store");
            serve(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state will not survive a restart");
            serve(InMemorySagaStore::new(), config, metrics_handle).await;
        }
    }
}
