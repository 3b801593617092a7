//! `ffmpeg` subprocess encoder.

use crate::config::PipelineConfig;
use crate::domain::quality::ARTIFACT_EXTENSION;
use crate::error::EncodeError;
use crate::ports::encoder::{
    Encoder, PREVIEW_BITRATE_KBPS, PREVIEW_DURATION_SECS, PREVIEW_START_SECS,
};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Captured encoder output kept in errors, in bytes.
const OUTPUT_TAIL: usize = 2048;

const WELL_KNOWN_DIRS: [&str; 6] = [
    "/usr/local/bin",
    "/usr/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
    "C:\\ffmpeg\\bin",
    "C:\\Program Files\\ffmpeg\\bin",
];

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// First directory containing `name` as a regular file.
fn find_in<I>(dirs: I, name: &str) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Resolve the encoder binary: an explicit path wins, otherwise the working directory, `PATH`
/// and the usual install locations are searched in that order.
pub fn locate_ffmpeg(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured ffmpeg binary does not exist");
        return None;
    }

    let cwd = std::env::current_dir().ok().into_iter();
    let path_dirs = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default();
    let well_known = WELL_KNOWN_DIRS.iter().map(PathBuf::from);

    find_in(cwd.chain(path_dirs).chain(well_known), binary_name())
}

/// Argument list for one encode. The preview window is applied after the input so seeking is
/// sample-accurate.
fn encode_args(
    source: &Path,
    output: &Path,
    bitrate_kbps: u32,
    source_format: &str,
    preview: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(source.as_os_str().to_owned());
    if preview {
        args.extend([
            OsString::from("-ss"),
            OsString::from(PREVIEW_START_SECS.to_string()),
            OsString::from("-t"),
            OsString::from(PREVIEW_DURATION_SECS.to_string()),
        ]);
    }
    args.extend([
        OsString::from("-map"),
        OsString::from("0:a"),
        OsString::from("-b:a"),
        OsString::from(format!("{}k", bitrate_kbps)),
    ]);
    if !source_format.eq_ignore_ascii_case(ARTIFACT_EXTENSION) {
        args.extend([OsString::from("-codec:a"), OsString::from("libmp3lame")]);
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Last `max` bytes of the output, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    binary: Option<PathBuf>,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(config: &PipelineConfig) -> Self {
        let binary = locate_ffmpeg(config.ffmpeg_path.as_deref());
        match &binary {
            Some(path) => tracing::info!(path = %path.display(), "using ffmpeg"),
            None => tracing::warn!("ffmpeg not found, transcoding jobs will be skipped"),
        }
        Self {
            binary,
            scratch_dir: config.scratch_dir.clone(),
            timeout: config.encode_timeout,
        }
    }

    pub fn with_binary(binary: Option<PathBuf>, scratch_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            scratch_dir,
            timeout,
        }
    }

    async fn run(
        &self,
        source: &Path,
        label: &str,
        bitrate_kbps: u32,
        source_format: &str,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        let binary = self.binary.as_ref().ok_or(EncodeError::Unavailable)?;

        // Removed on every path except success.
        let output = TempPath::try_from_path(self.scratch_dir.join(format!(
            "cadenza-{}-{}.{}",
            label,
            Uuid::new_v4(),
            ARTIFACT_EXTENSION
        )))?;
        let args = encode_args(source, &output, bitrate_kbps, source_format, preview);

        let child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncodeError::Spawn)?;

        // Losing branches drop the child, which kills the process.
        let finished = tokio::select! {
            result = child.wait_with_output() => result?,
            _ = cancel.cancelled() => return Err(EncodeError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => return Err(EncodeError::TimedOut(self.timeout)),
        };

        let mut combined = String::from_utf8_lossy(&finished.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&finished.stderr));

        if !finished.status.success() {
            return Err(EncodeError::Failed {
                status: finished.status.to_string(),
                output: tail(&combined, OUTPUT_TAIL),
            });
        }
        if !output.is_file() {
            return Err(EncodeError::Failed {
                status: finished.status.to_string(),
                output: "encoder produced no output file".to_string(),
            });
        }

        tracing::debug!(label, source = %source.display(), "encode finished");
        Ok(output.keep().map_err(std::io::Error::from)?)
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    async fn transcode(
        &self,
        source: &Path,
        bitrate_kbps: u32,
        source_format: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        let label = bitrate_kbps.to_string();
        self.run(source, &label, bitrate_kbps, source_format, false, cancel)
            .await
    }

    async fn make_preview(
        &self,
        source: &Path,
        source_format: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        self.run(source, "preview", PREVIEW_BITRATE_KBPS, source_format, true, cancel)
            .await
    }
}
