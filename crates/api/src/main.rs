//! API server entry point.

use std::sync::Arc;

use api::System;
use api::config::Config;
use outbox::PostgresOutboxStore;
use projections::{InMemorySagaStateStore, PostgresSagaStateStore, SagaStateStore};
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

/// PostgreSQL when `DATABASE_URL` is set, memory otherwise.
async fn saga_state_store(config: &Config) -> Arc<dyn SagaStateStore> {
    let Some(url) = &config.database_url else {
        return Arc::new(InMemorySagaStateStore::new());
    };
    let pool = sqlx::PgPool::connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    PostgresOutboxStore::new(pool.clone())
        .run_migrations()
        .await
        .expect("failed to run migrations");
    tracing::info!("saga state kept in PostgreSQL");
    Arc::new(PostgresSagaStateStore::new(pool))
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Wire the participants and start the background workers
    let system = System::new(&config, saga_state_store(&config).await).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = system.spawn(shutdown_rx);

    // 4. Build the application
    let app = api::create_app(system.app_state(), metrics_handle);

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 6. Stop publishers and dispatcher
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }

    tracing::info!("server shut down gracefully");
}
