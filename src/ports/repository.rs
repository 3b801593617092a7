use crate::domain::jobs::ConversionJob;
use crate::domain::session::StreamSession;
use crate::domain::track::{StreamStats, Track, TrackPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error;
use uuid::Uuid;

#[async_trait]
pub trait TrackRepository: Send + Sync {
    /// Get a live (not soft-deleted) track
    async fn get_track(&self, track_id: u64) -> Result<Option<Track>, Box<dyn Error + Send + Sync>>;

    /// Get the stored track, soft-deleted or not
    async fn find_track(&self, track_id: u64) -> Result<Option<Track>, Box<dyn Error + Send + Sync>>;

    /// Insert or replace a track
    async fn save_track(&self, track: &Track) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Change only the attributes set in `patch`
    /// Returns the updated track, `None` when no track is stored
    async fn update_track(
        &self,
        track_id: u64,
        patch: &TrackPatch,
    ) -> Result<Option<Track>, Box<dyn Error + Send + Sync>>;

    /// Soft-delete a track as of `at`
    /// Returns false when no live track matched
    async fn delete_track(
        &self,
        track_id: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, Box<dyn Error + Send + Sync>>;

    /// Atomically add one play
    /// Returns the new play count, `None` when the track does not exist
    async fn increment_play_count(
        &self,
        track_id: u64,
    ) -> Result<Option<i64>, Box<dyn Error + Send + Sync>>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace a job and point the track's latest attempt at it
    async fn save_job(&self, job: &ConversionJob) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ConversionJob>, Box<dyn Error + Send + Sync>>;

    /// The track's latest attempt, if it is still processing
    async fn find_active_job(
        &self,
        track_id: u64,
    ) -> Result<Option<ConversionJob>, Box<dyn Error + Send + Sync>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save_session(&self, session: &StreamSession) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<StreamSession>, Box<dyn Error + Send + Sync>>;

    /// Record `session_id` as the active session for a client context
    /// Returns the session it replaced, if any
    async fn replace_active_session(
        &self,
        context_key: &str,
        session_id: &str,
    ) -> Result<Option<String>, Box<dyn Error + Send + Sync>>;
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn get_stats(&self, track_id: u64) -> Result<StreamStats, Box<dyn Error + Send + Sync>>;

    /// Count one stream by `user_id`
    async fn record_stream(
        &self,
        track_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Result<StreamStats, Box<dyn Error + Send + Sync>>;

    /// Replace the stream total with an externally accumulated value
    async fn overwrite_total(
        &self,
        track_id: u64,
        total_streams: i64,
        last_streamed_at: DateTime<Utc>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Tracks with the most streams, highest first
    async fn top_tracks(&self, limit: usize) -> Result<Vec<StreamStats>, Box<dyn Error + Send + Sync>>;
}
