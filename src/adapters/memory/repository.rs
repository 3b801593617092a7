use super::injected;
use crate::domain::jobs::{ConversionJob, JobStatus};
use crate::domain::session::StreamSession;
use crate::domain::track::{StreamStats, Track, TrackPatch};
use crate::error::BoxError;
use crate::ports::repository::{JobRepository, SessionRepository, StatsRepository, TrackRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct StatsEntry {
    stats: StreamStats,
    listeners: HashSet<u64>,
}

#[derive(Default)]
struct State {
    tracks: HashMap<u64, Track>,
    jobs: HashMap<Uuid, ConversionJob>,
    latest_job: HashMap<u64, Uuid>,
    sessions: HashMap<String, StreamSession>,
    active_sessions: HashMap<String, String>,
    stats: HashMap<u64, StatsEntry>,
}

/// Every repository port over one in-memory state.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
    failing: Arc<AtomicBool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until turned off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored track, soft-deleted or not
    pub fn stored_track(&self, track_id: u64) -> Option<Track> {
        self.state.lock().tracks.get(&track_id).cloned()
    }

    /// All jobs of a track, oldest first
    pub fn jobs_for(&self, track_id: u64) -> Vec<ConversionJob> {
        let mut jobs: Vec<ConversionJob> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.track_id == track_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    fn check(&self) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected("repository"));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackRepository for MemoryRepository {
    async fn get_track(&self, track_id: u64) -> Result<Option<Track>, BoxError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .tracks
            .get(&track_id)
            .filter(|track| !track.is_deleted())
            .cloned())
    }

    async fn find_track(&self, track_id: u64) -> Result<Option<Track>, BoxError> {
        self.check()?;
        Ok(self.stored_track(track_id))
    }

    async fn save_track(&self, track: &Track) -> Result<(), BoxError> {
        self.check()?;
        self.state.lock().tracks.insert(track.id, track.clone());
        Ok(())
    }

    async fn update_track(&self, track_id: u64, patch: &TrackPatch) -> Result<Option<Track>, BoxError> {
        self.check()?;
        Ok(self.state.lock().tracks.get_mut(&track_id).map(|track| {
            track.apply(patch);
            track.clone()
        }))
    }

    async fn delete_track(&self, track_id: u64, at: DateTime<Utc>) -> Result<bool, BoxError> {
        self.check()?;
        match self.state.lock().tracks.get_mut(&track_id) {
            Some(track) if !track.is_deleted() => {
                track.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_play_count(&self, track_id: u64) -> Result<Option<i64>, BoxError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .tracks
            .get_mut(&track_id)
            .filter(|track| !track.is_deleted())
            .map(|track| {
                track.play_count += 1;
                track.play_count
            }))
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn save_job(&self, job: &ConversionJob) -> Result<(), BoxError> {
        self.check()?;
        let mut state = self.state.lock();
        state.jobs.insert(job.id, job.clone());
        state.latest_job.insert(job.track_id, job.id);
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ConversionJob>, BoxError> {
        self.check()?;
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn find_active_job(&self, track_id: u64) -> Result<Option<ConversionJob>, BoxError> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .latest_job
            .get(&track_id)
            .and_then(|id| state.jobs.get(id))
            .filter(|job| job.status == JobStatus::Processing)
            .cloned())
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn save_session(&self, session: &StreamSession) -> Result<(), BoxError> {
        self.check()?;
        self.state
            .lock()
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<StreamSession>, BoxError> {
        self.check()?;
        Ok(self.state.lock().sessions.get(session_id).cloned())
    }

    async fn replace_active_session(
        &self,
        context_key: &str,
        session_id: &str,
    ) -> Result<Option<String>, BoxError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .active_sessions
            .insert(context_key.to_string(), session_id.to_string())
            .filter(|previous| previous != session_id))
    }
}

#[async_trait]
impl StatsRepository for MemoryRepository {
    async fn get_stats(&self, track_id: u64) -> Result<StreamStats, BoxError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .stats
            .get(&track_id)
            .map(|entry| entry.stats.clone())
            .unwrap_or_else(|| StreamStats::empty(track_id)))
    }

    async fn record_stream(
        &self,
        track_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Result<StreamStats, BoxError> {
        self.check()?;
        let mut state = self.state.lock();
        let entry = state.stats.entry(track_id).or_insert_with(|| StatsEntry {
            stats: StreamStats::empty(track_id),
            listeners: HashSet::new(),
        });
        entry.listeners.insert(user_id);
        entry.stats.total_streams += 1;
        entry.stats.unique_users = entry.listeners.len() as i64;
        entry.stats.last_streamed_at = Some(at);
        Ok(entry.stats.clone())
    }

    async fn overwrite_total(
        &self,
        track_id: u64,
        total_streams: i64,
        last_streamed_at: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        self.check()?;
        let mut state = self.state.lock();
        let entry = state.stats.entry(track_id).or_insert_with(|| StatsEntry {
            stats: StreamStats::empty(track_id),
            listeners: HashSet::new(),
        });
        entry.stats.total_streams = total_streams;
        entry.stats.last_streamed_at = Some(last_streamed_at);
        Ok(())
    }

    async fn top_tracks(&self, limit: usize) -> Result<Vec<StreamStats>, BoxError> {
        self.check()?;
        let mut all: Vec<StreamStats> = self
            .state
            .lock()
            .stats
            .values()
            .map(|entry| entry.stats.clone())
            .collect();
        all.sort_by(|a, b| {
            b.total_streams
                .cmp(&a.total_streams)
                .then(a.track_id.cmp(&b.track_id))
        });
        all.truncate(limit);
        Ok(all)
    }
}
