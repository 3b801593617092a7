//! Processor Binary - Transcoding and Track Sync consumers
//!
//! Wires up:
//! - S3 object store and DynamoDB repositories
//! - Redis Streams bus and Redis status cache
//! - ffmpeg encoder
//!
//! Runs one consumer loop per pipeline until SIGINT/SIGTERM.

use cadenza::adapters::aws::{DynamoRepository, S3ObjectStore};
use cadenza::adapters::ffmpeg::FfmpegEncoder;
use cadenza::adapters::local::RedisPool;
use cadenza::application::consumer::{ConsumerLoop, Subscription};
use cadenza::application::track_sync::TrackSyncService;
use cadenza::application::transcoder::{TranscodeService, TranscodeSettings};
use cadenza::config::AppConfig;
use cadenza::runtime;
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

    if let Err(err) = tokio::fs::create_dir_all(&config.pipeline.scratch_dir).await {
        tracing::error!(dir = %config.pipeline.scratch_dir.display(), error = %err, "failed to create scratch directory");
        std::process::exit(1);
    }

    // 1. Adapters
    let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let storage = S3ObjectStore::from_config(&shared, config.storage.s3_endpoint.as_deref());
    let repo = DynamoRepository::new(
        aws_sdk_dynamodb::Client::new(&shared),
        config.dynamo.table.clone(),
    );

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
        storage,
        bus.clone(),
        redis,
        repo.clone(),
        encoder,
        TranscodeSettings::from_config(&config),
    );
    let track_sync = TrackSyncService::new(repo);

    // 3. Consumer loops
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

    for (name, task) in [("processing", processing_task), ("track sync", sync_task)] {
        if let Err(err) = task.await {
            tracing::error!(consumer = name, error = %err, "consumer task failed");
        }
    }
    tracing::info!("processor stopped");
}
