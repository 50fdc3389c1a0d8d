use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ridepool_api::{app, worker, AppState};
use ridepool_booking::{BookingPolicy, Ports, SeatInventory};
use ridepool_core::SystemClock;
use ridepool_store::app_config::Config;
use ridepool_store::{
    DbClient, EventProducer, PgBookingRepository, PgCapacityProvider, PgSeatHoldRepository, RedisClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ridepool_api=debug,ridepool_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting ridepool API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis
    let redis = Arc::new(
        RedisClient::new(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?,
    );

    // Kafka
    let kafka = Arc::new(EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?);

    let ports = Ports {
        fast_store: redis.clone(),
        bookings: Arc::new(PgBookingRepository::new(db.pool.clone())),
        seat_holds: Arc::new(PgSeatHoldRepository::new(db.pool.clone())),
        capacity: Arc::new(PgCapacityProvider::new(db.pool.clone())),
        payments: kafka.clone(),
        events: kafka,
        clock: Arc::new(SystemClock),
    };
    let inventory = SeatInventory::new(ports, policy_from(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = worker::spawn_reconciler(
        inventory.reconciler.clone(),
        Duration::from_secs(config.reconciler.interval_seconds),
        shutdown_rx,
    );

    let app = app(AppState::new(&inventory, redis));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler.await {
        tracing::error!("Reconciler task ended abnormally: {}", e);
    }
    Ok(())
}

fn policy_from(config: &Config) -> BookingPolicy {
    BookingPolicy {
        hold_ttl: Duration::from_secs(config.holds.default_ttl_seconds),
        extended_hold_ttl: Duration::from_secs(config.holds.extended_ttl_seconds),
        lock_max_wait: Duration::from_millis(config.locks.max_wait_ms),
        lock_lease: Duration::from_millis(config.locks.lease_ms),
        lock_retry_interval: Duration::from_millis(config.locks.retry_interval_ms),
        reconcile_batch_size: config.reconciler.batch_size,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
