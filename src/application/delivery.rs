use crate::application::stats::StatsRecorder;
use crate::config::AppConfig;
use crate::domain::jobs::{ProcessingStatus, StatusSnapshot};
use crate::domain::keys;
use crate::domain::quality::{self, ARTIFACT_EXTENSION, SUPPORTED_QUALITIES};
use crate::domain::range::ByteRange;
use crate::domain::session::{parse_position, ClientContext, StreamSession};
use crate::domain::track::Track;
use crate::error::DeliveryError;
use crate::ports::cache::StatusCache;
use crate::ports::repository::{SessionRepository, StatsRepository, TrackRepository};
use crate::ports::storage::{ObjectBody, ObjectStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POPULAR_LIMIT: usize = 10;

#[derive(Clone, Debug)]
pub struct DeliverySettings {
    pub sources_bucket: String,
    pub tracks_bucket: String,
    pub previews_bucket: String,
    pub default_quality: String,
}

impl DeliverySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sources_bucket: config.storage.sources.clone(),
            tracks_bucket: config.storage.tracks.clone(),
            previews_bucket: config.storage.previews.clone(),
            default_quality: config.delivery.default_quality.clone(),
        }
    }
}

/// An opened object ready to be written to a response.
pub struct MediaResponse {
    pub body: ObjectBody,
    pub content_type: &'static str,
    /// Size of the whole object
    pub total_size: u64,
    /// Set when only part of the object is served
    pub range: Option<ByteRange>,
    pub session_id: Option<String>,
    /// Download file name, served as an attachment when set
    pub attachment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Qualities {
    pub track_id: u64,
    pub qualities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackStatus {
    pub track_id: u64,
    pub title: String,
    pub artist_id: u64,
    pub processing_status: ProcessingStatus,
    pub stream_count: i64,
    pub unique_listeners: i64,
    pub last_streamed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularTrack {
    pub id: u64,
    pub title: String,
    pub artist_id: u64,
    pub total_streams: i64,
    pub unique_users: i64,
    pub last_streamed_at: Option<DateTime<Utc>>,
}

/// Client-facing view of a playback session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: &'static str,
    pub track_id: u64,
    pub quality: String,
    pub current_pos: f64,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl From<&StreamSession> for SessionView {
    fn from(session: &StreamSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: if session.is_active { "active" } else { "ended" },
            track_id: session.track_id,
            quality: session.quality.clone(),
            current_pos: session.current_pos,
            is_active: session.is_active,
            started_at: session.started_at,
            last_access: session.last_access_at,
        }
    }
}

/// Form fields of a progress report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressForm {
    pub track_id: Option<String>,
    pub quality: Option<String>,
    pub position: Option<String>,
}

/// Read side of the catalogue: artifacts, sessions and play statistics.
pub struct StreamingService<S, C, R> {
    storage: S,
    cache: C,
    repo: R,
    stats: StatsRecorder,
    settings: DeliverySettings,
}

impl<S, C, R> StreamingService<S, C, R>
where
    S: ObjectStore,
    C: StatusCache,
    R: TrackRepository + SessionRepository + StatsRepository,
{
    pub fn new(storage: S, cache: C, repo: R, stats: StatsRecorder, settings: DeliverySettings) -> Self {
        Self {
            storage,
            cache,
            repo,
            stats,
            settings,
        }
    }

    /// Open the delivery artifact of a track, starting a playback session.
    ///
    /// Unsupported qualities fall back to the default. A range header that cannot be satisfied
    /// yields the whole object.
    pub async fn stream(
        &self,
        track_id: u64,
        requested_quality: Option<&str>,
        context: &ClientContext,
        range_header: Option<&str>,
    ) -> Result<MediaResponse, DeliveryError> {
        let track = self.resolve_track(track_id).await?;
        let quality = quality::resolve(requested_quality, &self.settings.default_quality).to_string();
        let session = self.start_session(context, track.id, &quality).await;

        let bucket = &self.settings.tracks_bucket;
        let key = quality::artifact_key(track.id, &quality);
        let (body, total_size, range) = self.open(bucket, &key, range_header).await?;

        tracing::info!(
            track_id = track.id,
            quality = %quality,
            session_id = %session.session_id,
            partial = range.is_some(),
            "stream opened"
        );
        self.stats.record(track.id, context.user_id);

        Ok(MediaResponse {
            body,
            content_type: quality::content_type_for(ARTIFACT_EXTENSION),
            total_size,
            range,
            session_id: Some(session.session_id),
            attachment: None,
        })
    }

    /// The original upload, as an attachment.
    pub async fn download(&self, track_id: u64) -> Result<MediaResponse, DeliveryError> {
        let track = self.resolve_track(track_id).await?;
        let (body, total_size, _) = self
            .open(&self.settings.sources_bucket, &track.file_path, None)
            .await?;

        let title = track.title.replace('"', "'");
        Ok(MediaResponse {
            body,
            content_type: quality::content_type_for(&track.file_format),
            total_size,
            range: None,
            session_id: None,
            attachment: Some(format!("{}.{}", title, track.file_format)),
        })
    }

    pub async fn preview(&self, track_id: u64) -> Result<MediaResponse, DeliveryError> {
        let track = self.resolve_track(track_id).await?;
        let key = quality::preview_key(track.id);
        let (body, total_size, _) = self.open(&self.settings.previews_bucket, &key, None).await?;
        Ok(MediaResponse {
            body,
            content_type: quality::content_type_for(ARTIFACT_EXTENSION),
            total_size,
            range: None,
            session_id: None,
            attachment: None,
        })
    }

    /// Qualities with an artifact in storage.
    pub async fn qualities(&self, track_id: u64) -> Result<Qualities, DeliveryError> {
        let track = self.resolve_track(track_id).await?;
        let cache_key = keys::qualities(track.id);

        if let Some(cached) = self.cached(&cache_key).await {
            match serde_json::from_str::<Vec<String>>(&cached) {
                Ok(qualities) => {
                    return Ok(Qualities {
                        track_id: track.id,
                        qualities,
                    })
                }
                Err(err) => tracing::warn!(key = %cache_key, error = %err, "ignoring unreadable cached qualities"),
            }
        }

        let mut available = Vec::new();
        for label in SUPPORTED_QUALITIES {
            let key = quality::artifact_key(track.id, label);
            match self.storage.stat(&self.settings.tracks_bucket, &key).await {
                Ok(Some(_)) => available.push(label.to_string()),
                Ok(None) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "failed to stat artifact"),
            }
        }

        match serde_json::to_string(&available) {
            Ok(json) => {
                if let Err(err) = self.cache.set(&cache_key, &json, keys::QUALITIES_TTL).await {
                    tracing::warn!(key = %cache_key, error = %err, "failed to cache qualities");
                }
            }
            Err(err) => tracing::warn!(key = %cache_key, error = %err, "failed to encode qualities"),
        }

        Ok(Qualities {
            track_id: track.id,
            qualities: available,
        })
    }

    pub async fn track_status(&self, track_id: u64) -> Result<TrackStatus, DeliveryError> {
        let track = self.resolve_track(track_id).await?;
        let snapshot = self.cached(&keys::processing_status(track.id)).await;
        let stats = self
            .repo
            .get_stats(track.id)
            .await
            .map_err(DeliveryError::Internal)?;

        Ok(TrackStatus {
            track_id: track.id,
            title: track.title,
            artist_id: track.artist_id,
            processing_status: StatusSnapshot::parse_status(snapshot.as_deref()),
            stream_count: stats.total_streams,
            unique_listeners: stats.unique_users,
            last_streamed_at: stats.last_streamed_at,
        })
    }

    /// Most streamed tracks. Tracks no longer in the catalogue are left out.
    pub async fn popular(&self, limit: usize) -> Result<Vec<PopularTrack>, DeliveryError> {
        let limit = if limit == 0 { DEFAULT_POPULAR_LIMIT } else { limit };
        let top = self
            .repo
            .top_tracks(limit)
            .await
            .map_err(DeliveryError::Internal)?;

        let mut tracks = Vec::with_capacity(top.len());
        for stats in top {
            let track = self
                .repo
                .get_track(stats.track_id)
                .await
                .map_err(DeliveryError::Internal)?;
            if let Some(track) = track {
                tracks.push(PopularTrack {
                    id: track.id,
                    title: track.title,
                    artist_id: track.artist_id,
                    total_streams: stats.total_streams,
                    unique_users: stats.unique_users,
                    last_streamed_at: stats.last_streamed_at,
                });
            }
        }
        Ok(tracks)
    }

    /// Session state, from the cache when possible.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionView, DeliveryError> {
        let session_id = required_session_id(session_id)?;

        if let Some(mut session) = self.cached_session(session_id).await {
            let position = self
                .cache
                .get_field(&keys::session_position(session_id), keys::POSITION_FIELD)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(session_id, error = %err, "failed to read cached position");
                    None
                });
            if let Some(position) = position.and_then(|raw| parse_position(&raw).ok()) {
                session.current_pos = position;
            }
            return Ok(SessionView::from(&session));
        }

        let mut session = self.load_session(session_id).await?;
        session.touch();
        if let Err(err) = self.repo.save_session(&session).await {
            tracing::warn!(session_id, error = %err, "failed to refresh session access time");
        }
        self.cache_session(&session).await;
        Ok(SessionView::from(&session))
    }

    /// Persisted playback position of a session.
    pub async fn progress(&self, session_id: &str) -> Result<SessionView, DeliveryError> {
        let session_id = required_session_id(session_id)?;
        let session = self.load_session(session_id).await?;
        Ok(SessionView::from(&session))
    }

    /// Record a position report.
    ///
    /// An unknown session is started for the reported track instead.
    pub async fn update_progress(
        &self,
        session_id: &str,
        form: &ProgressForm,
        context: &ClientContext,
    ) -> Result<SessionView, DeliveryError> {
        let session_id = required_session_id(session_id)?;
        let existing = self
            .repo
            .get_session(session_id)
            .await
            .map_err(DeliveryError::Internal)?;

        let Some(mut session) = existing else {
            let track_id = form
                .track_id
                .as_deref()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|id| *id > 0)
                .ok_or_else(|| DeliveryError::InvalidInput("invalid track id".to_string()))?;
            let quality = quality::resolve(form.quality.as_deref(), &self.settings.default_quality);
            let session = self.start_session(context, track_id, quality).await;
            return Ok(SessionView::from(&session));
        };

        let raw = form.position.as_deref().unwrap_or_default();
        let position = parse_position(raw).map_err(|err| DeliveryError::InvalidInput(err.to_string()))?;
        let duration = match self.repo.get_track(session.track_id).await {
            Ok(track) => track.and_then(|track| track.known_duration()),
            Err(err) => {
                tracing::warn!(track_id = session.track_id, error = %err, "failed to load track duration");
                None
            }
        };
        let stored = session
            .update_position(position, duration)
            .map_err(|err| DeliveryError::InvalidInput(err.to_string()))?;

        self.repo
            .save_session(&session)
            .await
            .map_err(DeliveryError::Internal)?;
        let pos_key = keys::session_position(session_id);
        if let Err(err) = self
            .cache
            .set_field(&pos_key, keys::POSITION_FIELD, &stored.to_string(), keys::SESSION_TTL)
            .await
        {
            tracing::warn!(session_id, error = %err, "failed to cache position");
        }

        tracing::debug!(session_id, position = stored, "playback position updated");
        Ok(SessionView::from(&session))
    }

    /// Live track by id, cache first.
    async fn resolve_track(&self, track_id: u64) -> Result<Track, DeliveryError> {
        let cache_key = keys::track_info(track_id);
        if let Some(cached) = self.cached(&cache_key).await {
            match serde_json::from_str::<Track>(&cached) {
                Ok(track) if !track.is_deleted() => return Ok(track),
                Ok(_) => {}
                Err(err) => tracing::warn!(key = %cache_key, error = %err, "ignoring unreadable cached track"),
            }
        }

        let track = self
            .repo
            .get_track(track_id)
            .await
            .map_err(DeliveryError::Internal)?
            .ok_or(DeliveryError::NotFound("track"))?;

        match serde_json::to_string(&track) {
            Ok(json) => {
                if let Err(err) = self.cache.set(&cache_key, &json, keys::TRACK_SNAPSHOT_TTL).await {
                    tracing::warn!(key = %cache_key, error = %err, "failed to cache track");
                }
            }
            Err(err) => tracing::warn!(key = %cache_key, error = %err, "failed to encode track"),
        }
        Ok(track)
    }

    async fn open(
        &self,
        bucket: &str,
        key: &str,
        range_header: Option<&str>,
    ) -> Result<(ObjectBody, u64, Option<ByteRange>), DeliveryError> {
        let info = self
            .storage
            .stat(bucket, key)
            .await
            .map_err(|err| {
                tracing::error!(bucket, key, error = %err, "failed to stat object");
                DeliveryError::Storage(key.to_string())
            })?
            .ok_or_else(|| {
                tracing::error!(bucket, key, "object missing");
                DeliveryError::Storage(key.to_string())
            })?;

        let range = range_header.and_then(|header| ByteRange::parse(header, info.size));
        let body = self
            .storage
            .get(bucket, key, range)
            .await
            .map_err(|err| {
                tracing::error!(bucket, key, error = %err, "failed to open object");
                DeliveryError::Storage(key.to_string())
            })?
            .ok_or_else(|| DeliveryError::Storage(key.to_string()))?;

        Ok((body, info.size, range))
    }

    /// Start a session and end the one it supersedes.
    ///
    /// Bookkeeping failures are logged; playback goes ahead regardless.
    async fn start_session(&self, context: &ClientContext, track_id: u64, quality: &str) -> StreamSession {
        let session = StreamSession::start(context, track_id, quality);
        if let Err(err) = self.repo.save_session(&session).await {
            tracing::warn!(session_id = %session.session_id, error = %err, "failed to persist session");
        }

        match self
            .repo
            .replace_active_session(&context.key(), &session.session_id)
            .await
        {
            Ok(Some(previous)) => self.end_session(&previous).await,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(session_id = %session.session_id, error = %err, "failed to record active session")
            }
        }

        self.cache_session(&session).await;
        session
    }

    async fn end_session(&self, session_id: &str) {
        match self.repo.get_session(session_id).await {
            Ok(Some(mut previous)) if previous.is_active => {
                previous.end();
                if let Err(err) = self.repo.save_session(&previous).await {
                    tracing::warn!(session_id, error = %err, "failed to end superseded session");
                }
                if let Err(err) = self.cache.delete(&keys::session(session_id)).await {
                    tracing::warn!(session_id, error = %err, "failed to evict superseded session");
                }
                tracing::debug!(session_id, "session superseded");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(session_id, error = %err, "failed to load superseded session"),
        }
    }

    async fn load_session(&self, session_id: &str) -> Result<StreamSession, DeliveryError> {
        self.repo
            .get_session(session_id)
            .await
            .map_err(DeliveryError::Internal)?
            .ok_or(DeliveryError::NotFound("session"))
    }

    async fn cache_session(&self, session: &StreamSession) {
        let key = keys::session(&session.session_id);
        match serde_json::to_string(session) {
            Ok(json) => {
                if let Err(err) = self.cache.set(&key, &json, keys::SESSION_TTL).await {
                    tracing::warn!(key = %key, error = %err, "failed to cache session");
                }
            }
            Err(err) => tracing::warn!(key = %key, error = %err, "failed to encode session"),
        }
    }

    async fn cached_session(&self, session_id: &str) -> Option<StreamSession> {
        let raw = self.cached(&keys::session(session_id)).await?;
        serde_json::from_str(&raw)
            .map_err(|err| tracing::warn!(session_id, error = %err, "ignoring unreadable cached session"))
            .ok()
    }

    /// Cache read where a failure counts as a miss.
    async fn cached(&self, key: &str) -> Option<String> {
        self.cache.get(key).await.unwrap_or_else(|err| {
            tracing::warn!(key, error = %err, "cache read failed");
            None
        })
    }
}

fn required_session_id(session_id: &str) -> Result<&str, DeliveryError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(DeliveryError::InvalidInput("session id is required".to_string()));
    }
    Ok(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryCache, MemoryObjectStore, MemoryRepository};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    const TRACKS: &str = "audio-tracks";
    const PREVIEWS: &str = "audio-previews";
    const SOURCES: &str = "audio-originals";

    struct Harness {
        store: MemoryObjectStore,
        cache: MemoryCache,
        repo: MemoryRepository,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
        service: StreamingService<MemoryObjectStore, MemoryCache, MemoryRepository>,
    }

    impl Harness {
        async fn new() -> Self {
            let store = MemoryObjectStore::new();
            let cache = MemoryCache::new();
            let repo = MemoryRepository::new();
            let cancel = CancellationToken::new();
            let (stats, worker) = StatsRecorder::spawn(repo.clone(), 64, cancel.clone());
            let settings = DeliverySettings {
                sources_bucket: SOURCES.to_string(),
                tracks_bucket: TRACKS.to_string(),
                previews_bucket: PREVIEWS.to_string(),
                default_quality: "320".to_string(),
            };
            let service =
                StreamingService::new(store.clone(), cache.clone(), repo.clone(), stats, settings);

            let track = Track {
                id: 42,
                title: "Intro".into(),
                artist_id: 3,
                file_path: "raw/42.wav".into(),
                file_format: "wav".into(),
                duration: 180.0,
                ..Default::default()
            };
            repo.save_track(&track).await.unwrap();
            store.put(TRACKS, "42/320.mp3", (0..=255u8).collect::<Vec<u8>>(), Some("audio/mpeg"));

            Self {
                store,
                cache,
                repo,
                cancel,
                worker,
                service,
            }
        }

        async fn drain_stats(self) -> MemoryRepository {
            self.cancel.cancel();
            self.worker.await.unwrap();
            self.repo
        }
    }

    fn context(user_agent: &str) -> ClientContext {
        ClientContext {
            user_id: 7,
            ip_address: "10.0.0.1".into(),
            user_agent: user_agent.into(),
        }
    }

    async fn read_all(mut body: ObjectBody) -> Vec<u8> {
        let mut buf = Vec::new();
        body.reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ranged_stream() {
        let h = Harness::new().await;
        let media = h
            .service
            .stream(42, Some("320"), &context("curl"), Some("bytes=10-19"))
            .await
            .unwrap();

        assert_eq!(media.range, Some(ByteRange { start: 10, end: 19 }));
        assert_eq!(media.total_size, 256);
        assert_eq!(media.content_type, "audio/mpeg");
        assert_eq!(media.body.content_length, 10);
        assert_eq!(read_all(media.body).await, (10..20u8).collect::<Vec<u8>>());

        let repo = h.drain_stats().await;
        assert_eq!(repo.get_stats(42).await.unwrap().total_streams, 1);
        assert_eq!(repo.get_track(42).await.unwrap().unwrap().play_count, 1);
    }

    #[tokio::test]
    async fn test_unsupported_quality_and_bad_range_serve_everything() {
        let h = Harness::new().await;
        let media = h
            .service
            .stream(42, Some("999"), &context("curl"), Some("bytes=300-400"))
            .await
            .unwrap();
        assert_eq!(media.range, None);
        assert_eq!(read_all(media.body).await.len(), 256);
    }

    #[tokio::test]
    async fn test_stream_errors() {
        let h = Harness::new().await;
        let missing = h.service.stream(7, None, &context("curl"), None).await;
        assert!(matches!(missing, Err(DeliveryError::NotFound("track"))));

        let no_artifact = h.service.stream(42, Some("128"), &context("curl"), None).await;
        assert!(matches!(no_artifact, Err(DeliveryError::Storage(_))));
    }

    #[tokio::test]
    async fn test_track_resolved_from_cache() {
        let h = Harness::new().await;
        h.service.stream(42, None, &context("curl"), None).await.unwrap();
        assert!(h.cache.ttl(&keys::track_info(42)).is_some());

        // Cached copy keeps serving while the repository is down.
        h.repo.set_failing(true);
        assert!(h.service.stream(42, None, &context("curl"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_session_supersedes_previous() {
        let h = Harness::new().await;
        let first = h
            .service
            .stream(42, None, &context("curl"), None)
            .await
            .unwrap()
            .session_id
            .unwrap();
        let second = h
            .service
            .stream(42, None, &context("curl"), None)
            .await
            .unwrap()
            .session_id
            .unwrap();
        let other_device = h
            .service
            .stream(42, None, &context("Firefox"), None)
            .await
            .unwrap()
            .session_id
            .unwrap();

        let first = h.repo.get_session(&first).await.unwrap().unwrap();
        assert!(!first.is_active);
        assert!(first.ended_at.is_some());
        assert!(h.repo.get_session(&second).await.unwrap().unwrap().is_active);
        assert!(h.repo.get_session(&other_device).await.unwrap().unwrap().is_active);
        assert_eq!(h.cache.get(&keys::session(&first.session_id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_download_and_preview() {
        let h = Harness::new().await;
        h.store.put(SOURCES, "raw/42.wav", b"RIFF".to_vec(), None);
        let download = h.service.download(42).await.unwrap();
        assert_eq!(download.content_type, "audio/wav");
        assert_eq!(download.attachment.as_deref(), Some("Intro.wav"));
        assert_eq!(read_all(download.body).await, b"RIFF");

        assert!(matches!(h.service.preview(42).await, Err(DeliveryError::Storage(_))));
        h.store.put(PREVIEWS, "42/preview.mp3", b"ID3".to_vec(), None);
        let preview = h.service.preview(42).await.unwrap();
        assert_eq!(preview.total_size, 3);
        assert_eq!(preview.content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn test_qualities_are_cached() {
        let h = Harness::new().await;
        h.store.put(TRACKS, "42/128.mp3", b"x".to_vec(), None);

        let qualities = h.service.qualities(42).await.unwrap();
        assert_eq!(qualities.qualities, vec!["128".to_string(), "320".to_string()]);
        assert!(h.cache.ttl(&keys::qualities(42)).unwrap() > Duration::from_secs(11 * 3600));

        h.store.put(TRACKS, "42/64.mp3", b"x".to_vec(), None);
        assert_eq!(h.service.qualities(42).await.unwrap(), qualities);
    }

    #[tokio::test]
    async fn test_track_status() {
        let h = Harness::new().await;
        let status = h.service.track_status(42).await.unwrap();
        assert_eq!(status.processing_status, ProcessingStatus::Unknown);
        assert_eq!(status.stream_count, 0);

        let snapshot = serde_json::to_string(&StatusSnapshot::new(ProcessingStatus::Completed)).unwrap();
        h.cache
            .set(&keys::processing_status(42), &snapshot, keys::TRACK_SNAPSHOT_TTL)
            .await
            .unwrap();
        h.repo.record_stream(42, 1, Utc::now()).await.unwrap();
        h.repo.record_stream(42, 2, Utc::now()).await.unwrap();

        let status = h.service.track_status(42).await.unwrap();
        assert_eq!(status.processing_status, ProcessingStatus::Completed);
        assert_eq!(status.title, "Intro");
        assert_eq!(status.stream_count, 2);
        assert_eq!(status.unique_listeners, 2);
    }

    #[tokio::test]
    async fn test_popular_skips_unknown_tracks() {
        let h = Harness::new().await;
        h.repo.record_stream(42, 1, Utc::now()).await.unwrap();
        for user in 0..3 {
            h.repo.record_stream(99, user, Utc::now()).await.unwrap();
        }

        let popular = h.service.popular(0).await.unwrap();
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].id, 42);
        assert_eq!(popular[0].total_streams, 1);
    }

    #[tokio::test]
    async fn test_session_status() {
        let h = Harness::new().await;
        assert!(matches!(
            h.service.session_status("  ").await,
            Err(DeliveryError::InvalidInput(_))
        ));
        assert!(matches!(
            h.service.session_status("nope").await,
            Err(DeliveryError::NotFound("session"))
        ));

        let media = h.service.stream(42, None, &context("curl"), None).await.unwrap();
        let session_id = media.session_id.unwrap();
        h.cache
            .set_field(&keys::session_position(&session_id), keys::POSITION_FIELD, "33.5", keys::SESSION_TTL)
            .await
            .unwrap();
        let cached = h.service.session_status(&session_id).await.unwrap();
        assert_eq!(cached.status, "active");
        assert_eq!(cached.current_pos, 33.5);

        h.cache.delete(&keys::session(&session_id)).await.unwrap();
        let from_repo = h.service.session_status(&session_id).await.unwrap();
        assert_eq!(from_repo.track_id, 42);
        assert_eq!(from_repo.current_pos, 0.0);
        assert!(h.cache.get(&keys::session(&session_id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let h = Harness::new().await;
        let media = h.service.stream(42, None, &context("curl"), None).await.unwrap();
        let session_id = media.session_id.unwrap();

        let form = |position: &str| ProgressForm {
            position: Some(position.to_string()),
            ..Default::default()
        };

        let view = h
            .service
            .update_progress(&session_id, &form("61.25"), &context("curl"))
            .await
            .unwrap();
        assert_eq!(view.current_pos, 61.25);
        assert_eq!(
            h.cache
                .get_field(&keys::session_position(&session_id), keys::POSITION_FIELD)
                .await
                .unwrap()
                .as_deref(),
            Some("61.25")
        );

        let clamped = h
            .service
            .update_progress(&session_id, &form("9000"), &context("curl"))
            .await
            .unwrap();
        assert_eq!(clamped.current_pos, 180.0);

        for bad in ["-1", "NaN", "abc", ""] {
            let err = h
                .service
                .update_progress(&session_id, &form(bad), &context("curl"))
                .await
                .unwrap_err();
            assert!(matches!(err, DeliveryError::InvalidInput(_)), "position {:?}", bad);
        }
        assert_eq!(h.service.progress(&session_id).await.unwrap().current_pos, 180.0);
    }

    #[tokio::test]
    async fn test_progress_for_unknown_session_starts_one() {
        let h = Harness::new().await;
        let form = ProgressForm {
            track_id: Some("42".into()),
            quality: Some("128".into()),
            position: None,
        };
        let view = h
            .service
            .update_progress("stale-id", &form, &context("curl"))
            .await
            .unwrap();
        assert_ne!(view.session_id, "stale-id");
        assert_eq!(view.quality, "128");
        assert_eq!(view.current_pos, 0.0);
        assert!(h.repo.get_session(&view.session_id).await.unwrap().is_some());

        let bad = ProgressForm {
            track_id: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(
            h.service.update_progress("stale-id", &bad, &context("curl")).await,
            Err(DeliveryError::InvalidInput(_))
        ));
        assert!(matches!(
            h.service.progress("stale-id").await,
            Err(DeliveryError::NotFound("session"))
        ));
    }
}
