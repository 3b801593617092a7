/// Bitrate labels (kbps) that can be requested for streaming.
pub const SUPPORTED_QUALITIES: [&str; 5] = ["64", "128", "192", "256", "320"];

pub const DEFAULT_QUALITY: &str = "320";

/// Delivery codec container produced by the encoder.
pub const ARTIFACT_EXTENSION: &str = "mp3";

pub fn is_supported(quality: &str) -> bool {
    SUPPORTED_QUALITIES.contains(&quality)
}

/// Requested quality when supported, otherwise the fallback.
pub fn resolve<'a>(requested: Option<&'a str>, fallback: &'a str) -> &'a str {
    match requested.map(str::trim) {
        Some(quality) if is_supported(quality) => quality,
        _ => fallback,
    }
}

pub fn content_type_for(format: &str) -> &'static str {
    match format.trim().to_ascii_lowercase().as_str() {
        "mp3" | "mpeg" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Key of a per-bitrate artifact in the tracks bucket.
pub fn artifact_key(track_id: u64, bitrate: &str) -> String {
    format!("{}/{}.{}", track_id, bitrate, ARTIFACT_EXTENSION)
}

/// Key of the preview clip in the previews bucket.
pub fn preview_key(track_id: u64) -> String {
    format!("{}/preview.{}", track_id, ARTIFACT_EXTENSION)
}
