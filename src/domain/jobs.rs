use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Only job schema version accepted on the job topic.
pub const JOB_SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    JOB_SCHEMA_VERSION
}

/// Transcoding request consumed from the job topic.
///
/// Unknown fields are rejected so that other message shapes (such as per-message
/// `processingRequired` lists) fail loudly instead of being half-read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscodeJob {
    #[serde(default = "default_version")]
    pub version: u32,
    pub track_id: String,
    #[serde(default)]
    pub user_id: String,
    /// Object key of the source upload
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    pub file_format: String,
}

impl TranscodeJob {
    pub fn decode(payload: &[u8]) -> Result<Self, JobError> {
        let job: TranscodeJob =
            serde_json::from_slice(payload).map_err(|e| JobError::InvalidInput(e.to_string()))?;

        if job.version != JOB_SCHEMA_VERSION {
            return Err(JobError::InvalidInput(format!(
                "unsupported job schema version {}",
                job.version
            )));
        }
        job.numeric_track_id()?;
        if job.file_path.trim().is_empty() {
            return Err(JobError::InvalidInput("empty file_path".to_string()));
        }
        Ok(job)
    }

    pub fn numeric_track_id(&self) -> Result<u64, JobError> {
        self.track_id
            .trim()
            .parse()
            .map_err(|_| JobError::InvalidInput(format!("invalid track id {:?}", self.track_id)))
    }

    /// Owning user, 0 when the producer did not send a numeric id.
    pub fn numeric_user_id(&self) -> u64 {
        self.user_id.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Forward-only, except that a processing or failed attempt may go back to pending for a retry.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("conversion job {job_id} cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Persisted state of one transcoding attempt for a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: Uuid,
    pub track_id: u64,
    pub source_format: String,
    pub target_format: String,
    pub status: JobStatus,
    pub priority: i32,
    /// Fraction of artifacts handled, 0.0 to 1.0
    pub progress: f64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionJob {
    pub fn new(track_id: u64, source_format: &str, target_format: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            track_id,
            source_format: source_format.to_string(),
            target_format: target_format.to_string(),
            status: JobStatus::Pending,
            priority: 1,
            progress: 0.0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
                self.progress = 0.0;
            }
            JobStatus::Processing => {
                self.started_at = Some(now);
                self.error_message = None;
                self.progress = 0.0;
            }
            JobStatus::Completed => {
                self.completed_at = Some(now);
                self.progress = 1.0;
            }
            JobStatus::Failed => {
                self.completed_at = Some(now);
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn set_progress(&mut self, done: usize, total: usize) {
        if total > 0 {
            self.progress = (done as f64 / total as f64).clamp(0.0, 1.0);
            self.updated_at = Utc::now();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Skipped,
}

/// Message published on the result topic once per handled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub track_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn failed(track_id: &str, error: impl Into<String>) -> Self {
        Self {
            track_id: track_id.to_string(),
            status: ResultStatus::Failed,
            versions: BTreeMap::new(),
            preview_path: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(track_id: &str, reason: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Skipped,
            ..Self::failed(track_id, reason)
        }
    }
}

/// Coarse processing status exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Unknown,
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl From<ResultStatus> for ProcessingStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Completed => ProcessingStatus::Completed,
            ResultStatus::Failed => ProcessingStatus::Failed,
            ResultStatus::Skipped => ProcessingStatus::Skipped,
        }
    }
}

/// Cached projection of a track's processing state (`track:<id>:processing_status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: ProcessingStatus,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(status: ProcessingStatus) -> Self {
        Self {
            status,
            versions: BTreeMap::new(),
            preview_path: None,
            updated_at: Utc::now(),
        }
    }

    pub fn from_result(result: &ProcessingResult) -> Self {
        Self {
            status: result.status.into(),
            versions: result.versions.clone(),
            preview_path: result.preview_path.clone(),
            updated_at: result.finished_at,
        }
    }

    /// Reads the status field of a cached snapshot, `Unknown` when it cannot be understood.
    pub fn parse_status(raw: Option<&str>) -> ProcessingStatus {
        #[derive(Deserialize)]
        struct StatusOnly {
            status: ProcessingStatus,
        }

        raw.and_then(|raw| serde_json::from_str::<StatusOnly>(raw).ok())
            .map(|parsed| parsed.status)
            .unwrap_or(ProcessingStatus::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_canonical_job() {
        let payload = br#"{"track_id":"42","user_id":"7","file_path":"raw/42.wav","file_name":"42.wav","file_format":"wav"}"#;
        let job = TranscodeJob::decode(payload).unwrap();
        assert_eq!(job.version, JOB_SCHEMA_VERSION);
        assert_eq!(job.numeric_track_id().unwrap(), 42);
        assert_eq!(job.numeric_user_id(), 7);
        assert_eq!(job.file_format, "wav");
    }

    #[test]
    fn test_decode_rejects_alternate_shape() {
        let payload = br#"{"track_id":"42","file_path":"raw/42.wav","file_format":"wav","processingRequired":["128","320"]}"#;
        let err = TranscodeJob::decode(payload).unwrap_err();
        assert!(matches!(err, JobError::InvalidInput(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_version_and_bad_ids() {
        let future = br#"{"version":2,"track_id":"42","file_path":"raw/42.wav","file_format":"wav"}"#;
        assert!(TranscodeJob::decode(future).is_err());

        let bad_id = br#"{"track_id":"abc","file_path":"raw/42.wav","file_format":"wav"}"#;
        assert!(TranscodeJob::decode(bad_id).is_err());

        let no_path = br#"{"track_id":"42","file_path":"  ","file_format":"wav"}"#;
        assert!(TranscodeJob::decode(no_path).is_err());

        assert!(TranscodeJob::decode(b"not json").is_err());
    }

    #[test]
    fn test_job_transitions_forward() {
        let mut job = ConversionJob::new(42, "wav", "mp3");
        job.transition(JobStatus::Processing).unwrap();
        assert!(job.started_at.is_some());
        job.set_progress(1, 2);
        assert_eq!(job.progress, 0.5);
        job.transition(JobStatus::Completed).unwrap();
        assert_eq!(job.progress, 1.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_rejects_backward_transitions() {
        let mut job = ConversionJob::new(42, "wav", "mp3");
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Completed).unwrap();

        let err = job.transition(JobStatus::Processing).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(err.to, JobStatus::Processing);
        assert!(job.transition(JobStatus::Pending).is_err());
    }

    #[test]
    fn test_job_retry_returns_to_pending() {
        let mut job = ConversionJob::new(42, "wav", "mp3");
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Pending).unwrap();
        assert!(job.started_at.is_none());
        job.transition(JobStatus::Processing).unwrap();
        job.fail("no bitrate artifact produced").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("no bitrate artifact produced"));
        job.transition(JobStatus::Pending).unwrap();
    }

    #[test]
    fn test_result_serializes_with_camel_case_and_omits_empty_options() {
        let mut result = ProcessingResult::failed("42", "x");
        result.status = ResultStatus::Completed;
        result.error = None;
        result.versions.insert("320".into(), "42/320.mp3".into());

        let json: serde_json::Value = serde_json::to_value(&result).unwrap();
        assert_eq!(json["trackId"], "42");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["versions"]["320"], "42/320.mp3");
        assert!(json.get("previewPath").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("finishedAt").is_some());
    }

    #[test]
    fn test_parse_status_snapshot() {
        let snapshot = StatusSnapshot::new(ProcessingStatus::Processing);
        let raw = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            StatusSnapshot::parse_status(Some(&raw)),
            ProcessingStatus::Processing
        );
        assert_eq!(
            StatusSnapshot::parse_status(Some("{\"status\":\"weird\"}")),
            ProcessingStatus::Unknown
        );
        assert_eq!(StatusSnapshot::parse_status(None), ProcessingStatus::Unknown);
    }
}
