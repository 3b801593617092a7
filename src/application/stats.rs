use crate::ports::repository::{StatsRepository, TrackRepository};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One play of a track, counted after the stream was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayEvent {
    pub track_id: u64,
    pub user_id: u64,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget submission of play events.
///
/// Events are queued on a bounded channel and applied by a single worker task. A full queue drops
/// the event instead of holding up the response that produced it.
#[derive(Clone)]
pub struct StatsRecorder {
    sender: mpsc::Sender<PlayEvent>,
}

impl StatsRecorder {
    /// Start the worker. It drains the queue and exits once `cancel` fires.
    pub fn spawn<R>(repo: R, capacity: usize, cancel: CancellationToken) -> (Self, JoinHandle<()>)
    where
        R: TrackRepository + StatsRepository + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(repo, receiver, cancel));
        (Self { sender }, worker)
    }

    pub fn record(&self, track_id: u64, user_id: u64) {
        let event = PlayEvent {
            track_id,
            user_id,
            at: Utc::now(),
        };
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(track_id = event.track_id, "stats queue full, dropping play event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(track_id = event.track_id, "stats worker stopped, dropping play event");
            }
        }
    }
}

async fn run_worker<R>(repo: R, mut receiver: mpsc::Receiver<PlayEvent>, cancel: CancellationToken)
where
    R: TrackRepository + StatsRepository,
{
    loop {
        tokio::select! {
            biased;
            event = receiver.recv() => match event {
                Some(event) => apply(&repo, event).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                receiver.close();
                let mut drained = 0usize;
                while let Some(event) = receiver.recv().await {
                    apply(&repo, event).await;
                    drained += 1;
                }
                tracing::debug!(drained, "stats queue drained");
                break;
            }
        }
    }
    tracing::info!("stats worker stopped");
}

async fn apply<R>(repo: &R, event: PlayEvent)
where
    R: TrackRepository + StatsRepository,
{
    match repo.increment_play_count(event.track_id).await {
        Ok(Some(_)) => {}
        Ok(None) => tracing::warn!(track_id = event.track_id, "play count not updated, track missing"),
        Err(err) => tracing::error!(track_id = event.track_id, error = %err, "failed to increment play count"),
    }
    if let Err(err) = repo.record_stream(event.track_id, event.user_id, event.at).await {
        tracing::error!(track_id = event.track_id, error = %err, "failed to record stream stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryRepository;
    use crate::domain::track::Track;

    async fn repo_with_track(id: u64) -> MemoryRepository {
        let repo = MemoryRepository::new();
        let track = Track {
            id,
            title: "Intro".into(),
            ..Default::default()
        };
        repo.save_track(&track).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_concurrent_plays_are_all_counted() {
        let repo = repo_with_track(42).await;
        let cancel = CancellationToken::new();
        let (recorder, worker) = StatsRecorder::spawn(repo.clone(), 1024, cancel.clone());

        let submitters: Vec<_> = (0..50u64)
            .map(|user| {
                let recorder = recorder.clone();
                tokio::spawn(async move { recorder.record(42, user % 5) })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }

        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(repo.get_track(42).await.unwrap().unwrap().play_count, 50);
        let stats = repo.get_stats(42).await.unwrap();
        assert_eq!(stats.total_streams, 50);
        assert_eq!(stats.unique_users, 5);
        assert!(stats.last_streamed_at.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let repo = repo_with_track(1).await;
        let cancel = CancellationToken::new();
        // No worker runs while the queue fills up.
        let (sender, receiver) = mpsc::channel(2);
        let recorder = StatsRecorder { sender };
        for _ in 0..5 {
            recorder.record(1, 7);
        }

        cancel.cancel();
        run_worker(repo.clone(), receiver, cancel).await;
        assert_eq!(repo.get_stats(1).await.unwrap().total_streams, 2);
    }

    #[tokio::test]
    async fn test_missing_track_still_counts_stream() {
        let repo = MemoryRepository::new();
        let cancel = CancellationToken::new();
        let (recorder, worker) = StatsRecorder::spawn(repo.clone(), 8, cancel.clone());
        recorder.record(9, 1);
        cancel.cancel();
        worker.await.unwrap();

        assert!(repo.get_track(9).await.unwrap().is_none());
        assert_eq!(repo.get_stats(9).await.unwrap().total_streams, 1);
    }
}
