//! Configuration for the pipelines, the delivery server and their adapters.
//!
//! Everything is read from the environment (a `.env` file is honored). Invalid numbers fall back to
//! their defaults with a warning; structurally invalid settings are rejected.

use crate::domain::quality;
use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// HTTP server bind settings.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub addr: String,
    pub port: String,
}

/// Object store buckets and backend location.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Original uploads
    pub sources: String,
    /// Per-bitrate delivery files
    pub tracks: String,
    pub previews: String,
    /// Root directory of the filesystem object store
    #[cfg(feature = "local")]
    pub upload_dir: PathBuf,
    /// S3-compatible endpoint override (MinIO)
    #[cfg(feature = "aws")]
    pub s3_endpoint: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sources: "audio-originals".to_string(),
            tracks: "audio-tracks".to_string(),
            previews: "audio-previews".to_string(),
            #[cfg(feature = "local")]
            upload_dir: PathBuf::from("./data"),
            #[cfg(feature = "aws")]
            s3_endpoint: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Topics {
    pub processing: String,
    pub processing_complete: String,
    pub track_sync: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            processing: "audio.processing".to_string(),
            processing_complete: "audio.processing.complete".to_string(),
            track_sync: "music-player-track-sync".to_string(),
        }
    }
}

/// Message bus consumption settings.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Redis connection URL (bus + status cache)
    #[cfg(feature = "local")]
    pub redis_url: String,
    pub topics: Topics,
    pub processing_group: String,
    pub track_sync_group: String,
    /// Consumer name within the groups, unique per process
    pub consumer_name: String,
    pub poll_timeout: Duration,
    /// Pause after a failed bus read
    pub backoff: Duration,
    /// Deliveries after which an unacknowledged message is dropped
    pub max_deliveries: u32,
    /// Idle time before an unacknowledged message is redelivered
    pub redelivery_after: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            #[cfg(feature = "local")]
            redis_url: "redis://127.0.0.1/".to_string(),
            topics: Topics::default(),
            processing_group: "audio-processor".to_string(),
            track_sync_group: "track-sync".to_string(),
            consumer_name: format!("cadenza-{}", std::process::id()),
            poll_timeout: Duration::from_secs(1),
            backoff: Duration::from_millis(5000),
            max_deliveries: 3,
            redelivery_after: longest_job(PipelineConfig::default().encode_timeout, 1) + REDELIVERY_MARGIN,
        }
    }
}

/// Transcoding pipeline policy.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Target bitrates in kbps, as labels
    pub bitrates: Vec<String>,
    /// Bitrates encoded and uploaded at the same time
    pub concurrency: usize,
    /// Extra attempts for a failed bitrate encode; whole-job retries come from bus redelivery
    pub encode_retries: u32,
    pub encode_timeout: Duration,
    /// Explicit encoder binary, skips the search
    pub ffmpeg_path: Option<PathBuf>,
    pub scratch_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bitrates: vec![quality::DEFAULT_QUALITY.to_string()],
            concurrency: 2,
            encode_retries: 0,
            encode_timeout: Duration::from_secs(600),
            ffmpeg_path: None,
            scratch_dir: env::temp_dir(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub default_quality: String,
    pub stats_queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_quality: quality::DEFAULT_QUALITY.to_string(),
            stats_queue_capacity: 1024,
        }
    }
}

#[cfg(feature = "aws")]
#[derive(Clone, Debug)]
pub struct DynamoConfig {
    /// Single table holding tracks, jobs, sessions and stats
    pub table: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub delivery: DeliveryConfig,
    #[cfg(feature = "aws")]
    pub dynamo: DynamoConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let bus_defaults = BusConfig::default();
        let pipeline_defaults = PipelineConfig::default();
        let delivery_defaults = DeliveryConfig::default();
        let storage_defaults = StorageConfig::default();
        let topic_defaults = Topics::default();

        let bitrates = match vars.get("TRANSCODE_BITRATES") {
            Some(raw) => parse_bitrates(&raw)?,
            None => pipeline_defaults.bitrates,
        };

        // A job in flight must not look abandoned to other consumers.
        let encode_timeout = Duration::from_secs(vars.parse("ENCODE_TIMEOUT_SECS", 600u64));
        let longest_job = longest_job(encode_timeout, bitrates.len());
        let redelivery_after = match vars.get("BUS_REDELIVERY_MS") {
            Some(_) => Duration::from_millis(vars.parse("BUS_REDELIVERY_MS", 0u64)),
            None => longest_job + REDELIVERY_MARGIN,
        };
        if redelivery_after <= longest_job {
            return Err(ConfigError(format!(
                "BUS_REDELIVERY_MS {}ms must exceed the longest transcode ({}s)",
                redelivery_after.as_millis(),
                longest_job.as_secs()
            )));
        }

        let default_quality = vars.string("DEFAULT_QUALITY", &delivery_defaults.default_quality);
        if !quality::is_supported(&default_quality) {
            return Err(ConfigError(format!(
                "DEFAULT_QUALITY {:?} is not one of {:?}",
                default_quality,
                quality::SUPPORTED_QUALITIES
            )));
        }

        Ok(Self {
            http: HttpConfig {
                addr: vars.string("ADDR", "127.0.0.1"),
                port: vars.string("PORT", "8080"),
            },
            bus: BusConfig {
                #[cfg(feature = "local")]
                redis_url: vars.string("REDIS_URL", &bus_defaults.redis_url),
                topics: Topics {
                    processing: vars.string("TOPIC_AUDIO_PROCESSING", &topic_defaults.processing),
                    processing_complete: vars.string(
                        "TOPIC_AUDIO_PROCESSING_COMPLETE",
                        &topic_defaults.processing_complete,
                    ),
                    track_sync: vars.string("TOPIC_TRACK_SYNC", &topic_defaults.track_sync),
                },
                processing_group: vars.string("BUS_CONSUMER_GROUP", &bus_defaults.processing_group),
                track_sync_group: vars.string("TRACK_SYNC_GROUP", &bus_defaults.track_sync_group),
                consumer_name: vars.string("BUS_CONSUMER_NAME", &bus_defaults.consumer_name),
                poll_timeout: Duration::from_millis(vars.parse("BUS_POLL_TIMEOUT_MS", 1000u64)),
                backoff: Duration::from_millis(vars.parse("BUS_BACKOFF_MS", 5000u64)),
                max_deliveries: vars.parse("BUS_MAX_DELIVERIES", bus_defaults.max_deliveries).max(1),
                redelivery_after,
            },
            storage: StorageConfig {
                sources: vars.string("SOURCE_BUCKET", &storage_defaults.sources),
                tracks: vars.string("TRACKS_BUCKET", &storage_defaults.tracks),
                previews: vars.string("PREVIEWS_BUCKET", &storage_defaults.previews),
                #[cfg(feature = "local")]
                upload_dir: vars
                    .get("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(storage_defaults.upload_dir),
                #[cfg(feature = "aws")]
                s3_endpoint: vars.get("S3_ENDPOINT"),
            },
            pipeline: PipelineConfig {
                bitrates,
                concurrency: vars.parse("TRANSCODE_CONCURRENCY", pipeline_defaults.concurrency).max(1),
                encode_retries: vars.parse("ENCODE_RETRIES", pipeline_defaults.encode_retries),
                encode_timeout,
                ffmpeg_path: vars.get("FFMPEG_PATH").map(PathBuf::from),
                scratch_dir: vars
                    .get("SCRATCH_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(pipeline_defaults.scratch_dir),
            },
            delivery: DeliveryConfig {
                default_quality,
                stats_queue_capacity: vars
                    .parse("STATS_QUEUE_CAPACITY", delivery_defaults.stats_queue_capacity)
                    .max(1),
            },
            #[cfg(feature = "aws")]
            dynamo: DynamoConfig {
                table: vars.string("DYNAMODB_TABLE", "cadenza"),
            },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http.addr, self.http.port)
    }
}

/// Slack for download and upload on top of the encoder timeouts.
const REDELIVERY_MARGIN: Duration = Duration::from_secs(60);

/// Upper bound of one job's encoding time: every bitrate plus the preview, back to back.
fn longest_job(encode_timeout: Duration, bitrates: usize) -> Duration {
    encode_timeout.saturating_mul(bitrates as u32 + 1)
}

/// Parses a comma-separated list of bitrates in kbps.
pub fn parse_bitrates(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut bitrates = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|label| !label.is_empty()) {
        match label.parse::<u32>() {
            Ok(kbps) if kbps > 0 => {
                let label = kbps.to_string();
                if !bitrates.contains(&label) {
                    bitrates.push(label);
                }
            }
            _ => return Err(ConfigError(format!("invalid bitrate {:?}", label))),
        }
    }
    if bitrates.is_empty() {
        return Err(ConfigError("TRANSCODE_BITRATES is empty".to_string()));
    }
    Ok(bitrates)
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, %default, "invalid value, using default");
                default
            }),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bus.topics.processing, "audio.processing");
        assert_eq!(config.bus.topics.processing_complete, "audio.processing.complete");
        assert_eq!(config.bus.topics.track_sync, "music-player-track-sync");
        assert_eq!(config.storage.tracks, "audio-tracks");
        assert_eq!(config.storage.previews, "audio-previews");
        assert_eq!(config.pipeline.bitrates, vec!["320".to_string()]);
        assert_eq!(config.pipeline.encode_retries, 0);
        assert_eq!(config.delivery.default_quality, "320");
        assert_eq!(config.bus.backoff, Duration::from_millis(5000));
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_overrides_and_invalid_numbers() {
        let config = config_from(&[
            ("TRANSCODE_BITRATES", "128, 320,128"),
            ("TRANSCODE_CONCURRENCY", "4"),
            ("BUS_BACKOFF_MS", "not-a-number"),
            ("DEFAULT_QUALITY", "192"),
            ("SOURCE_BUCKET", "uploads"),
        ])
        .unwrap();
        assert_eq!(config.pipeline.bitrates, vec!["128".to_string(), "320".to_string()]);
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.bus.backoff, Duration::from_millis(5000));
        assert_eq!(config.delivery.default_quality, "192");
        assert_eq!(config.storage.sources, "uploads");
    }

    #[test]
    fn test_rejects_bad_bitrates_and_quality() {
        assert!(config_from(&[("TRANSCODE_BITRATES", "320,loud")]).is_err());
        assert!(config_from(&[("TRANSCODE_BITRATES", " , ")]).is_err());
        assert!(config_from(&[("DEFAULT_QUALITY", "999")]).is_err());
    }

    #[test]
    fn test_redelivery_outlasts_longest_job() {
        let config = config_from(&[("TRANSCODE_BITRATES", "128,320"), ("ENCODE_TIMEOUT_SECS", "100")]).unwrap();
        assert_eq!(config.bus.redelivery_after, Duration::from_secs(360));

        let config = config_from(&[]).unwrap();
        assert!(config.bus.redelivery_after > config.pipeline.encode_timeout * 2);

        let err = config_from(&[("BUS_REDELIVERY_MS", "30000")]).unwrap_err();
        assert!(err.0.contains("BUS_REDELIVERY_MS"));
        assert!(config_from(&[("BUS_REDELIVERY_MS", "oops")]).is_err());
        assert!(config_from(&[("ENCODE_TIMEOUT_SECS", "10"), ("BUS_REDELIVERY_MS", "30000")]).is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_raised() {
        let config = config_from(&[("TRANSCODE_CONCURRENCY", "0")]).unwrap();
        assert_eq!(config.pipeline.concurrency, 1);
    }
}
