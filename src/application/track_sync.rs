use crate::application::consumer::MessageHandler;
use crate::domain::sync::TrackMessage;
use crate::domain::track::TrackPatch;
use crate::error::SyncError;
use crate::ports::bus::Delivery;
use crate::ports::repository::{StatsRepository, TrackRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// What a sync message did to the stored track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Deleted,
    /// Older than the stored state
    Stale,
    /// Deletion of a track that does not exist
    Ignored,
}

/// Reconciles tracks with the upstream system of record.
pub struct TrackSyncService<R> {
    repo: R,
}

impl<R> TrackSyncService<R>
where
    R: TrackRepository + StatsRepository,
{
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub async fn handle_message(&self, payload: &[u8]) -> Result<SyncOutcome, SyncError> {
        let message =
            TrackMessage::decode(payload).map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        if message.id == 0 {
            return Err(SyncError::InvalidInput("missing track id".to_string()));
        }

        let stored = self
            .repo
            .find_track(message.id)
            .await
            .map_err(SyncError::Persistence)?;
        let updated_at = message.updated_at();

        if let Some(stored) = &stored {
            // A deletion wins over any upsert carrying the same timestamp.
            let newer = if stored.is_deleted() && !message.is_deleted {
                updated_at > stored.last_changed_at()
            } else {
                updated_at >= stored.last_changed_at()
            };
            if !newer {
                tracing::info!(track_id = message.id, "ignoring stale track message");
                return Ok(SyncOutcome::Stale);
            }
        }

        if message.is_deleted {
            if !stored.as_ref().is_some_and(|track| !track.is_deleted()) {
                return Ok(SyncOutcome::Ignored);
            }
            let at = if updated_at == DateTime::<Utc>::default() {
                Utc::now()
            } else {
                updated_at
            };
            self.repo
                .delete_track(message.id, at)
                .await
                .map_err(SyncError::Persistence)?;
            tracing::info!(track_id = message.id, "track deleted");
            return Ok(SyncOutcome::Deleted);
        }

        let outcome = match stored {
            Some(stored) => {
                let patch = TrackPatch {
                    restore: stored.is_deleted(),
                    ..message.to_patch()
                };
                let updated = self
                    .repo
                    .update_track(message.id, &patch)
                    .await
                    .map_err(SyncError::Persistence)?;
                if updated.is_none() {
                    return Err(SyncError::Persistence(
                        format!("track {} vanished during update", message.id).into(),
                    ));
                }
                if patch.restore {
                    tracing::info!(track_id = message.id, "track restored");
                }
                SyncOutcome::Updated
            }
            None => {
                self.repo
                    .save_track(&message.to_track())
                    .await
                    .map_err(SyncError::Persistence)?;
                SyncOutcome::Created
            }
        };

        if message.play_count > 0 {
            self.repo
                .overwrite_total(message.id, message.play_count, updated_at)
                .await
                .map_err(SyncError::Persistence)?;
        }

        tracing::debug!(track_id = message.id, outcome = ?outcome, "track synced");
        Ok(outcome)
    }
}

#[async_trait]
impl<R> MessageHandler for TrackSyncService<R>
where
    R: TrackRepository + StatsRepository,
{
    type Error = SyncError;

    async fn handle(&self, delivery: &Delivery, _cancel: &CancellationToken) -> Result<(), SyncError> {
        self.handle_message(&delivery.payload).await.map(|_| ())
    }
}
