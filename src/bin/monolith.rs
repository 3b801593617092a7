//! Monolith Binary - Local development deployment
//!
//! This is the main entry point for local development and single-server deployment.
//! It wires up:
//! - Local adapters (filesystem object store, Redis bus and cache, in-memory repository)
//! - Transcoding and Track Sync consumer loops
//! - Streaming delivery HTTP server

use cadenza::adapters::ffmpeg::FfmpegEncoder;
use cadenza::adapters::http::create_router;
use cadenza::adapters::local::{FsObjectStore, RedisPool};
use cadenza::adapters::memory::MemoryRepository;
use cadenza::application::consumer::{ConsumerLoop, Subscription};
use cadenza::application::delivery::{DeliverySettings, StreamingService};
use cadenza::application::stats::StatsRecorder;
use cadenza::application::track_sync::TrackSyncService;
use cadenza::application::transcoder::{TranscodeService, TranscodeSettings};
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

    for dir in [&config.storage.upload_dir, &config.pipeline.scratch_dir] {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            tracing::error!(dir = %dir.display(), error = %err, "failed to create directory");
            std::process::exit(1);
        }
    }

    // 1. Adapters (Local implementations)
    let storage = FsObjectStore::new(config.storage.upload_dir.clone());
    let repo = MemoryRepository::new();
    let redis = match RedisPool::new(&config.bus.redis_url) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "failed to create Redis pool");
            std::process::exit(1);
        }
    };
    let bus = redis.bus(config.bus.redelivery_after, config.bus.max_deliveries);
    let encoder = FfmpegEncoder::new(&config.pipeline);

    // 2. Application Services
    let transcoder = TranscodeService::new(
        storage.clone(),
        bus.clone(),
        redis.clone(),
        repo.clone(),
        encoder,
        TranscodeSettings::from_config(&config),
    );
    let track_sync = TrackSyncService::new(repo.clone());

    let stats_cancel = CancellationToken::new();
    let (stats, stats_worker) = StatsRecorder::spawn(
        repo.clone(),
        config.delivery.stats_queue_capacity,
        stats_cancel.clone(),
    );
    let streaming = Arc::new(StreamingService::new(
        storage,
        redis,
        repo,
        stats,
        DeliverySettings::from_config(&config),
    ));

    // 3. Start consumers
    let processing = ConsumerLoop::new(bus.clone(), Subscription::processing(&config.bus));
    let sync = ConsumerLoop::new(bus, Subscription::track_sync(&config.bus));
    let processing_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { processing.run(&transcoder, cancel).await })
    };
    let sync_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { sync.run(&track_sync, cancel).await })
    };

    // 4. HTTP Layer
    let app = create_router(streaming);
    let address = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(address = %address, error = %err, "failed to bind TCP listener");
            cancel.cancel();
            std::process::exit(1);
        }
    };
    tracing::info!(address = %address, "listening");

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;
    if let Err(err) = served {
        tracing::error!(error = %err, "server failed");
        cancel.cancel();
    }

    for (name, task) in [("processing", processing_task), ("track sync", sync_task)] {
        if let Err(err) = task.await {
            tracing::error!(consumer = name, error = %err, "consumer task failed");
        }
    }
    stats_cancel.cancel();
    if let Err(err) = stats_worker.await {
        tracing::error!(error = %err, "stats worker failed");
    }
    tracing::info!("monolith stopped");
}
