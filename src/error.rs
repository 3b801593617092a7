//! Error taxonomy shared by the pipelines and the delivery path.
//!
//! Ports return [`BoxError`] like any outbound adapter would; the services translate those into
//! the typed errors below so callers can decide between acknowledging, retrying and surfacing.

use crate::domain::jobs::InvalidTransition;
use std::time::Duration;
use thiserror::Error;

/// Error type returned by every port.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Decides whether a failed message is left on the bus for redelivery.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Job-level failures of the transcoding pipeline.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job message: {0}")]
    InvalidInput(String),

    #[error("source object missing: {bucket}/{key}")]
    SourceMissing { bucket: String, key: String },

    #[error("failed to download source {key}: {source}")]
    DownloadFailed {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("encoder unavailable")]
    EncoderUnavailable,

    #[error("persistence error: {0}")]
    Persistence(#[source] BoxError),

    #[error("failed to publish processing result: {0}")]
    Publish(#[source] BoxError),

    #[error("job interrupted by shutdown")]
    Interrupted,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::SourceMissing { .. }
                | JobError::DownloadFailed { .. }
                | JobError::Persistence(_)
                | JobError::Publish(_)
                | JobError::Interrupted
        )
    }
}

/// Failure of a single artifact; absorbed into the job's partial result.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("encode failed for {artifact}: {source}")]
    EncodeFailed {
        artifact: String,
        #[source]
        source: EncodeError,
    },

    #[error("upload failed for {key}: {source}")]
    UploadFailed {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("encoder output unusable: {0}")]
    Scratch(#[source] std::io::Error),
}

/// Encoder invocation failures.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("encoder binary not available")]
    Unavailable,

    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder exited with {status}: {output}")]
    Failed { status: String, output: String },

    #[error("encoder timed out after {0:?}")]
    TimedOut(Duration),

    #[error("encoder cancelled")]
    Cancelled,

    #[error("encoder io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Track sync failures.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid track message: {0}")]
    InvalidInput(String),

    #[error("persistence error: {0}")]
    Persistence(#[source] BoxError),
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Persistence(_))
    }
}

/// Failures surfaced by the streaming delivery path.
///
/// The HTTP adapter maps these to status codes with generic bodies; detail only goes to logs.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage object unavailable: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(#[source] BoxError),
}

#[derive(Error, Debug)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);
