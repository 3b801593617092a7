use crate::error::EncodeError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Preview clip window, in seconds from the start of the source.
pub const PREVIEW_START_SECS: u32 = 15;
pub const PREVIEW_DURATION_SECS: u32 = 30;
pub const PREVIEW_BITRATE_KBPS: u32 = 128;

/// Audio encoder capability.
///
/// Outputs are written to encoder-chosen scratch paths; the caller owns and removes them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Whether jobs can be encoded at all
    fn is_available(&self) -> bool;

    /// Encode the whole source at the target bitrate
    async fn transcode(
        &self,
        source: &Path,
        bitrate_kbps: u32,
        source_format: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError>;

    /// Encode the fixed preview window of the source
    async fn make_preview(
        &self,
        source: &Path,
        source_format: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError>;
}
