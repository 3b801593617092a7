use crate::application::consumer::MessageHandler;
use crate::config::AppConfig;
use crate::domain::jobs::{
    ConversionJob, JobStatus, ProcessingResult, ProcessingStatus, ResultStatus, StatusSnapshot,
    TranscodeJob,
};
use crate::domain::keys;
use crate::domain::quality::{self, ARTIFACT_EXTENSION};
use crate::domain::track::{Track, TrackPatch};
use crate::error::{ArtifactError, BoxError, EncodeError, JobError};
use crate::ports::bus::{Delivery, MessageBus};
use crate::ports::cache::StatusCache;
use crate::ports::encoder::Encoder;
use crate::ports::repository::{JobRepository, TrackRepository};
use crate::ports::storage::ObjectStore;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

const NO_ARTIFACT: &str = "no bitrate artifact produced";

/// Pipeline policy for the transcoding service.
#[derive(Clone, Debug)]
pub struct TranscodeSettings {
    pub sources_bucket: String,
    pub tracks_bucket: String,
    pub previews_bucket: String,
    pub result_topic: String,
    pub bitrates: Vec<String>,
    pub concurrency: usize,
    pub encode_retries: u32,
    pub scratch_dir: PathBuf,
}

impl TranscodeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sources_bucket: config.storage.sources.clone(),
            tracks_bucket: config.storage.tracks.clone(),
            previews_bucket: config.storage.previews.clone(),
            result_topic: config.bus.topics.processing_complete.clone(),
            bitrates: config.pipeline.bitrates.clone(),
            concurrency: config.pipeline.concurrency,
            encode_retries: config.pipeline.encode_retries,
            scratch_dir: config.pipeline.scratch_dir.clone(),
        }
    }
}

/// Turns job messages into uploaded artifacts and a published result.
pub struct TranscodeService<S, B, C, R, E> {
    storage: S,
    bus: B,
    cache: C,
    repo: R,
    encoder: E,
    settings: TranscodeSettings,
}

impl<S, B, C, R, E> TranscodeService<S, B, C, R, E>
where
    S: ObjectStore,
    B: MessageBus,
    C: StatusCache,
    R: TrackRepository + JobRepository,
    E: Encoder,
{
    pub fn new(storage: S, bus: B, cache: C, repo: R, encoder: E, settings: TranscodeSettings) -> Self {
        Self {
            storage,
            bus,
            cache,
            repo,
            encoder,
            settings,
        }
    }

    /// Process one job message.
    ///
    /// Returns the published result. Errors are returned for messages that must not be
    /// acknowledged yet (see [`crate::error::Retryable`]) and for undecodable input.
    pub async fn handle_job(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult, JobError> {
        let job = TranscodeJob::decode(payload)?;
        let track_id = job.numeric_track_id()?;
        let settings = &self.settings;
        tracing::info!(track_id, file_path = %job.file_path, "transcode job received");

        let source = self
            .storage
            .stat(&settings.sources_bucket, &job.file_path)
            .await
            .map_err(|source| JobError::DownloadFailed {
                key: job.file_path.clone(),
                source,
            })?;
        if source.is_none() {
            let err = JobError::SourceMissing {
                bucket: settings.sources_bucket.clone(),
                key: job.file_path.clone(),
            };
            self.report_failure(&job, track_id, &err).await;
            return Err(err);
        }

        let track = self.upsert_track(&job, track_id).await?;

        if !self.encoder.is_available() {
            return self.skip(&job, track_id).await;
        }

        let mut conversion = match self
            .repo
            .find_active_job(track_id)
            .await
            .map_err(JobError::Persistence)?
        {
            Some(mut prior) => {
                tracing::info!(track_id, job_id = %prior.id, "retrying interrupted conversion job");
                prior.transition(JobStatus::Pending)?;
                prior
            }
            None => ConversionJob::new(track_id, &job.file_format, ARTIFACT_EXTENSION),
        };
        conversion.transition(JobStatus::Processing)?;
        self.repo
            .save_job(&conversion)
            .await
            .map_err(JobError::Persistence)?;
        self.write_snapshot(track_id, &StatusSnapshot::new(ProcessingStatus::Processing))
            .await;

        let scratch = match self.download_source(&job).await {
            Ok(path) => path,
            Err(err) => {
                self.fail_conversion(&mut conversion, &err).await;
                self.report_failure(&job, track_id, &err).await;
                return Err(err);
            }
        };

        let (versions, preview_path) = self
            .produce_artifacts(&scratch, &job, track_id, &mut conversion, cancel)
            .await;
        drop(scratch);

        if cancel.is_cancelled() {
            // The job stays processing and is picked up again on redelivery.
            tracing::warn!(track_id, job_id = %conversion.id, "transcode interrupted");
            return Err(JobError::Interrupted);
        }

        let result = if versions.is_empty() {
            conversion.fail(NO_ARTIFACT)?;
            ProcessingResult {
                preview_path,
                ..ProcessingResult::failed(&job.track_id, NO_ARTIFACT)
            }
        } else {
            conversion.transition(JobStatus::Completed)?;
            ProcessingResult {
                track_id: job.track_id.clone(),
                status: ResultStatus::Completed,
                versions,
                preview_path,
                error: None,
                finished_at: Utc::now(),
            }
        };
        self.repo
            .save_job(&conversion)
            .await
            .map_err(JobError::Persistence)?;

        self.publish_result(&result).await?;
        self.write_snapshot(track_id, &StatusSnapshot::from_result(&result))
            .await;
        self.write_track_info(&track).await;

        tracing::info!(
            track_id,
            job_id = %conversion.id,
            status = ?result.status,
            versions = result.versions.len(),
            preview = result.preview_path.is_some(),
            "transcode job finished"
        );
        Ok(result)
    }

    /// Point the track at the new upload, creating a placeholder row on first sight. Only the
    /// file attributes are written so plays counted meanwhile are kept.
    async fn upsert_track(&self, job: &TranscodeJob, track_id: u64) -> Result<Track, JobError> {
        let patch = TrackPatch {
            file_path: Some(job.file_path.clone()),
            file_format: Some(job.file_format.clone()),
            ..Default::default()
        };
        let updated = self
            .repo
            .update_track(track_id, &patch)
            .await
            .map_err(JobError::Persistence)?;
        if let Some(track) = updated {
            return Ok(track);
        }

        let track = Track::from_upload(
            track_id,
            job.numeric_user_id(),
            &job.file_path,
            &job.file_name,
            &job.file_format,
        );
        self.repo
            .save_track(&track)
            .await
            .map_err(JobError::Persistence)?;
        Ok(track)
    }

    /// Without an encoder the job is recorded as pending and reported as skipped.
    async fn skip(&self, job: &TranscodeJob, track_id: u64) -> Result<ProcessingResult, JobError> {
        tracing::warn!(track_id, "encoder unavailable, skipping transcode");
        let existing = self
            .repo
            .find_active_job(track_id)
            .await
            .map_err(JobError::Persistence)?;
        if existing.is_none() {
            let pending = ConversionJob::new(track_id, &job.file_format, ARTIFACT_EXTENSION);
            self.repo
                .save_job(&pending)
                .await
                .map_err(JobError::Persistence)?;
        }

        let result =
            ProcessingResult::skipped(&job.track_id, JobError::EncoderUnavailable.to_string());
        self.publish_result(&result).await?;
        self.write_snapshot(track_id, &StatusSnapshot::from_result(&result))
            .await;
        Ok(result)
    }

    async fn download_source(&self, job: &TranscodeJob) -> Result<TempPath, JobError> {
        let download_failed = |source: BoxError| JobError::DownloadFailed {
            key: job.file_path.clone(),
            source,
        };
        let suffix = format!(".{}", job.file_format);
        let scratch = tempfile::Builder::new()
            .prefix("cadenza-src-")
            .suffix(&suffix)
            .tempfile_in(&self.settings.scratch_dir)
            .map_err(|e| download_failed(e.into()))?
            .into_temp_path();
        self.storage
            .download(&self.settings.sources_bucket, &job.file_path, &scratch)
            .await
            .map_err(download_failed)?;
        Ok(scratch)
    }

    /// Encode and upload every bitrate, then the preview. Failed artifacts are logged and left
    /// out of the returned versions.
    async fn produce_artifacts(
        &self,
        source: &Path,
        job: &TranscodeJob,
        track_id: u64,
        conversion: &mut ConversionJob,
        cancel: &CancellationToken,
    ) -> (BTreeMap<String, String>, Option<String>) {
        let total = self.settings.bitrates.len() + 1;
        let format = job.file_format.as_str();
        let mut done = 0;
        let mut versions = BTreeMap::new();

        // Boxed up front so the handler future stays `Send`.
        let encodes: Vec<BoxFuture<'_, (&String, Result<String, ArtifactError>)>> = self
            .settings
            .bitrates
            .iter()
            .map(|bitrate| {
                async move {
                    let outcome = self
                        .produce_bitrate(source, track_id, bitrate, format, cancel)
                        .await;
                    (bitrate, outcome)
                }
                .boxed()
            })
            .collect();
        let mut results = stream::iter(encodes).buffer_unordered(self.settings.concurrency.max(1));

        while let Some((bitrate, outcome)) = results.next().await {
            match outcome {
                Ok(key) => {
                    tracing::info!(track_id, bitrate = %bitrate, key = %key, "artifact uploaded");
                    versions.insert(bitrate.clone(), key);
                }
                Err(err) => {
                    tracing::warn!(track_id, bitrate = %bitrate, error = %err, "artifact failed")
                }
            }
            done += 1;
            self.save_progress(conversion, done, total).await;
        }
        drop(results);

        let preview = match self.produce_preview(source, track_id, format, cancel).await {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::warn!(track_id, error = %err, "preview failed");
                None
            }
        };
        self.save_progress(conversion, total, total).await;

        (versions, preview)
    }

    async fn produce_bitrate(
        &self,
        source: &Path,
        track_id: u64,
        bitrate: &str,
        format: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ArtifactError> {
        let encode_failed = |source: EncodeError| ArtifactError::EncodeFailed {
            artifact: bitrate.to_string(),
            source,
        };
        let kbps: u32 = bitrate.parse().map_err(|_| {
            encode_failed(EncodeError::Failed {
                status: "not started".to_string(),
                output: format!("invalid bitrate {:?}", bitrate),
            })
        })?;

        let mut attempt = 0;
        let output = loop {
            match self.encoder.transcode(source, kbps, format, cancel).await {
                Ok(path) => break TempPath::try_from_path(path).map_err(ArtifactError::Scratch)?,
                Err(err) if attempt < self.settings.encode_retries && is_transient(&err, cancel) => {
                    attempt += 1;
                    tracing::warn!(track_id, bitrate, attempt, error = %err, "encode failed, retrying");
                }
                Err(err) => return Err(encode_failed(err)),
            }
        };

        let key = quality::artifact_key(track_id, bitrate);
        self.upload(&output, &self.settings.tracks_bucket, &key).await?;
        Ok(key)
    }

    async fn produce_preview(
        &self,
        source: &Path,
        track_id: u64,
        format: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ArtifactError> {
        let output = self
            .encoder
            .make_preview(source, format, cancel)
            .await
            .map_err(|source| ArtifactError::EncodeFailed {
                artifact: "preview".to_string(),
                source,
            })
            .and_then(|path| TempPath::try_from_path(path).map_err(ArtifactError::Scratch))?;

        let key = quality::preview_key(track_id);
        self.upload(&output, &self.settings.previews_bucket, &key).await?;
        Ok(key)
    }

    async fn upload(&self, local: &Path, bucket: &str, key: &str) -> Result<(), ArtifactError> {
        self.storage
            .upload(local, bucket, key, quality::content_type_for(ARTIFACT_EXTENSION))
            .await
            .map_err(|source| ArtifactError::UploadFailed {
                key: key.to_string(),
                source,
            })
    }

    async fn save_progress(&self, conversion: &mut ConversionJob, done: usize, total: usize) {
        conversion.set_progress(done, total);
        if let Err(err) = self.repo.save_job(conversion).await {
            tracing::warn!(job_id = %conversion.id, error = %err, "failed to save job progress");
        }
    }

    async fn fail_conversion(&self, conversion: &mut ConversionJob, err: &JobError) {
        if let Err(transition) = conversion.fail(err.to_string()) {
            tracing::warn!(error = %transition, "cannot mark job failed");
            return;
        }
        if let Err(save) = self.repo.save_job(conversion).await {
            tracing::warn!(job_id = %conversion.id, error = %save, "failed to save failed job");
        }
    }

    /// Publish a failed result and snapshot for a fatal error. Best effort: the error itself is
    /// what decides redelivery.
    async fn report_failure(&self, job: &TranscodeJob, track_id: u64, err: &JobError) {
        tracing::error!(track_id, error = %err, "transcode job failed");
        let result = ProcessingResult::failed(&job.track_id, err.to_string());
        if let Err(publish) = self.publish_result(&result).await {
            tracing::warn!(track_id, error = %publish, "failed to publish failure result");
        }
        self.write_snapshot(track_id, &StatusSnapshot::from_result(&result))
            .await;
    }

    async fn publish_result(&self, result: &ProcessingResult) -> Result<(), JobError> {
        let payload = serde_json::to_vec(result).map_err(|e| JobError::Publish(e.into()))?;
        self.bus
            .publish(
                &self.settings.result_topic,
                result.track_id.as_bytes(),
                &payload,
            )
            .await
            .map_err(JobError::Publish)
    }

    async fn write_snapshot(&self, track_id: u64, snapshot: &StatusSnapshot) {
        let key = keys::processing_status(track_id);
        match serde_json::to_string(snapshot) {
            Ok(json) => {
                if let Err(err) = self.cache.set(&key, &json, keys::TRACK_SNAPSHOT_TTL).await {
                    tracing::warn!(key = %key, error = %err, "failed to cache processing status");
                }
            }
            Err(err) => tracing::warn!(key = %key, error = %err, "failed to encode processing status"),
        }
    }

    async fn write_track_info(&self, track: &Track) {
        let key = keys::track_info(track.id);
        match serde_json::to_string(track) {
            Ok(json) => {
                if let Err(err) = self.cache.set(&key, &json, keys::TRACK_SNAPSHOT_TTL).await {
                    tracing::warn!(key = %key, error = %err, "failed to cache track");
                }
            }
            Err(err) => tracing::warn!(key = %key, error = %err, "failed to encode track"),
        }
    }
}

/// Failures worth another encode attempt.
fn is_transient(err: &EncodeError, cancel: &CancellationToken) -> bool {
    !cancel.is_cancelled() && !matches!(err, EncodeError::Unavailable | EncodeError::Cancelled)
}

#[async_trait]
impl<S, B, C, R, E> MessageHandler for TranscodeService<S, B, C, R, E>
where
    S: ObjectStore,
    B: MessageBus,
    C: StatusCache,
    R: TrackRepository + JobRepository,
    E: Encoder,
{
    type Error = JobError;

    async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> Result<(), JobError> {
        self.handle_job(&delivery.payload, cancel).await.map(|_| ())
    }
}
