use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Persisted track record.
///
/// Soft-deleted tracks keep their row; `deleted_at` is set and lookups skip them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub id: u64,
    pub title: String,
    pub artist_id: u64,
    pub album_id: Option<u64>,
    pub user_id: u64,
    /// Object key of the original upload in the sources bucket
    pub file_path: String,
    pub file_size: i64,
    pub file_format: String,
    /// Duration in seconds, 0.0 when unknown
    pub duration: f64,
    pub bit_rate: i32,
    pub sample_rate: i32,
    pub track_number: i32,
    pub genre: String,
    pub play_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Track {
    /// Minimal record for a track first seen through a transcoding job.
    ///
    /// `updated_at` stays at the epoch: it orders upstream sync messages, and any upstream record
    /// must win over this placeholder.
    pub fn from_upload(id: u64, user_id: u64, file_path: &str, file_name: &str, file_format: &str) -> Self {
        let title = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or(file_path)
            .to_string();

        Self {
            id,
            title,
            user_id,
            file_path: file_path.to_string(),
            file_format: file_format.to_string(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Latest upstream change applied to this row, deletion included.
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.deleted_at.map_or(self.updated_at, |deleted| deleted.max(self.updated_at))
    }

    /// Merge a partial update. Unset fields keep their stored value.
    pub fn apply(&mut self, patch: &TrackPatch) {
        fn set<T: Clone>(field: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *field = value.clone();
            }
        }
        set(&mut self.title, &patch.title);
        set(&mut self.artist_id, &patch.artist_id);
        if patch.album_id.is_some() {
            self.album_id = patch.album_id;
        }
        set(&mut self.user_id, &patch.user_id);
        set(&mut self.file_path, &patch.file_path);
        set(&mut self.file_size, &patch.file_size);
        set(&mut self.file_format, &patch.file_format);
        set(&mut self.duration, &patch.duration);
        set(&mut self.bit_rate, &patch.bit_rate);
        set(&mut self.sample_rate, &patch.sample_rate);
        set(&mut self.track_number, &patch.track_number);
        set(&mut self.genre, &patch.genre);
        set(&mut self.play_count, &patch.play_count);
        set(&mut self.created_at, &patch.created_at);
        set(&mut self.updated_at, &patch.updated_at);
        if patch.restore {
            self.deleted_at = None;
        }
    }

    /// Duration when the track carries one.
    pub fn known_duration(&self) -> Option<f64> {
        (self.duration.is_finite() && self.duration > 0.0).then_some(self.duration)
    }
}

/// Attributes to change on a stored track. `None` leaves the stored value alone, so counters
/// accumulated elsewhere survive the update.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TrackPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Clear `deleted_at`
    #[serde(skip)]
    pub restore: bool,
}

/// Aggregate playback statistics for one track.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamStats {
    pub track_id: u64,
    pub total_streams: i64,
    pub unique_users: i64,
    pub last_streamed_at: Option<DateTime<Utc>>,
}

impl StreamStats {
    pub fn empty(track_id: u64) -> Self {
        Self {
            track_id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_upload_uses_file_stem_as_title() {
        let track = Track::from_upload(42, 7, "raw/42.wav", "My Song.wav", "wav");
        assert_eq!(track.id, 42);
        assert_eq!(track.user_id, 7);
        assert_eq!(track.title, "My Song");
        assert_eq!(track.file_path, "raw/42.wav");
        assert_eq!(track.file_format, "wav");
        assert_eq!(track.play_count, 0);
        assert_eq!(track.updated_at, DateTime::<Utc>::default());
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut track = Track::from_upload(42, 7, "raw/42.wav", "My Song.wav", "wav");
        track.play_count = 3;
        track.deleted_at = Some(Utc::now());

        track.apply(&TrackPatch {
            title: Some("Intro".into()),
            duration: Some(183.2),
            ..Default::default()
        });
        assert_eq!(track.title, "Intro");
        assert_eq!(track.duration, 183.2);
        assert_eq!(track.play_count, 3);
        assert_eq!(track.file_path, "raw/42.wav");
        assert!(track.is_deleted());

        track.apply(&TrackPatch {
            restore: true,
            ..Default::default()
        });
        assert!(!track.is_deleted());
    }

    #[test]
    fn test_last_changed_at_counts_deletion() {
        let mut track = Track::default();
        let updated = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let deleted = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        track.updated_at = updated;
        assert_eq!(track.last_changed_at(), updated);
        track.deleted_at = Some(deleted);
        assert_eq!(track.last_changed_at(), deleted);
    }

    #[test]
    fn test_from_upload_falls_back_to_path_without_name() {
        let track = Track::from_upload(1, 0, "raw/1.flac", "", "flac");
        assert_eq!(track.title, "raw/1.flac");
    }

    #[test]
    fn test_known_duration() {
        let mut track = Track::default();
        assert_eq!(track.known_duration(), None);
        track.duration = 183.5;
        assert_eq!(track.known_duration(), Some(183.5));
        track.duration = f64::NAN;
        assert_eq!(track.known_duration(), None);
    }
}
