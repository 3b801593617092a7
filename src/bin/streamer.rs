//! Streamer Binary - Streaming delivery HTTP server
//!
//! Wires up:
//! - S3 object store and DynamoDB repositories
//! - Redis status cache
//! - Stats recorder for play events
//!
//! Serves until SIGINT/SIGTERM, then drains in-flight requests and pending play events.

use cadenza::adapters::aws::{DynamoRepository, S3ObjectStore};
use cadenza::adapters::http::create_router;
use cadenza::adapters::local::RedisPool;
use cadenza::application::delivery::{DeliverySettings, StreamingService};
use cadenza::application::stats::StatsRecorder;
use cadenza::config::AppConfig;
use cadenza::runtime;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    runtime::init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    runtime::cancel_on_signal(cancel.clone());

    // 1. Adapters
    let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let storage = S3ObjectStore::from_config(&shared, config.storage.s3_endpoint.as_deref());
    let repo = DynamoRepository::new(
        aws_sdk_dynamodb::Client::new(&shared),
        config.dynamo.table.clone(),
    );
    let cache = match RedisPool::new(&config.bus.redis_url) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "failed to create Redis pool");
            std::process::exit(1);
        }
    };

    // 2. Application Services
    let stats_cancel = CancellationToken::new();
    let (stats, stats_worker) = StatsRecorder::spawn(
        repo.clone(),
        config.delivery.stats_queue_capacity,
        stats_cancel.clone(),
    );
    let service = Arc::new(StreamingService::new(
        storage,
        cache,
        repo,
        stats,
        DeliverySettings::from_config(&config),
    ));

    // 3. HTTP Layer
    let app = create_router(service);
    let address = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(address = %address, error = %err, "failed to bind TCP listener");
            std::process::exit(1);
        }
    };
    tracing::info!(address = %address, "listening");

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;
    if let Err(err) = served {
        tracing::error!(error = %err, "server failed");
    }

    // Play events queued by the last responses still get counted.
    stats_cancel.cancel();
    if let Err(err) = stats_worker.await {
        tracing::error!(error = %err, "stats worker failed");
    }
    tracing::info!("streamer stopped");
}
