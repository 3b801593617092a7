use super::track::{Track, TrackPatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Track projection published by the upstream system of record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackMessage {
    pub id: u64,
    pub title: String,
    pub artist_id: u64,
    pub album_id: u64,
    pub user_id: u64,
    pub file_path: String,
    pub file_size: i64,
    pub file_format: String,
    pub duration: f64,
    pub bit_rate: i32,
    pub sample_rate: i32,
    pub track_number: i32,
    pub genre: String,
    pub play_count: i64,
    /// RFC3339
    pub created_at: String,
    /// RFC3339
    pub updated_at: String,
    pub is_deleted: bool,
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn non_zero<T: Copy + Default + PartialEq>(value: T) -> Option<T> {
    (value != T::default()).then_some(value)
}

impl TrackMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        parse_timestamp(&self.updated_at)
    }

    /// Converts the projection into a track row. Play count is carried as sent.
    pub fn to_track(&self) -> Track {
        Track {
            id: self.id,
            title: self.title.clone(),
            artist_id: self.artist_id,
            album_id: (self.album_id != 0).then_some(self.album_id),
            user_id: self.user_id,
            file_path: self.file_path.clone(),
            file_size: self.file_size,
            file_format: self.file_format.clone(),
            duration: self.duration,
            bit_rate: self.bit_rate,
            sample_rate: self.sample_rate,
            track_number: self.track_number,
            genre: self.genre.clone(),
            play_count: self.play_count,
            created_at: parse_timestamp(&self.created_at),
            updated_at: self.updated_at(),
            deleted_at: None,
        }
    }

    /// Changes this projection makes to an existing track. Zero and empty fields are treated as
    /// not sent, so a message without a play count keeps the stored one.
    pub fn to_patch(&self) -> TrackPatch {
        TrackPatch {
            title: non_empty(&self.title),
            artist_id: non_zero(self.artist_id),
            album_id: non_zero(self.album_id),
            user_id: non_zero(self.user_id),
            file_path: non_empty(&self.file_path),
            file_size: non_zero(self.file_size),
            file_format: non_empty(&self.file_format),
            duration: (self.duration.is_finite() && self.duration > 0.0).then_some(self.duration),
            bit_rate: non_zero(self.bit_rate),
            sample_rate: non_zero(self.sample_rate),
            track_number: non_zero(self.track_number),
            genre: non_empty(&self.genre),
            play_count: (self.play_count > 0).then_some(self.play_count),
            created_at: non_zero(parse_timestamp(&self.created_at)),
            updated_at: non_zero(self.updated_at()),
            restore: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_camel_case_message() {
        let payload = br#"{
            "id": 42, "title": "Intro", "artistId": 3, "albumId": 0, "userId": 7,
            "filePath": "raw/42.flac", "fileSize": 1024, "fileFormat": "flac",
            "duration": 183.2, "bitRate": 1411, "sampleRate": 44100, "trackNumber": 1,
            "genre": "ambient", "playCount": 12,
            "createdAt": "2024-01-02T03:04:05Z", "updatedAt": "2024-02-03T04:05:06+02:00",
            "isDeleted": false
        }"#;
        let message = TrackMessage::decode(payload).unwrap();
        let track = message.to_track();

        assert_eq!(track.id, 42);
        assert_eq!(track.album_id, None);
        assert_eq!(track.sample_rate, 44100);
        assert_eq!(track.play_count, 12);
        assert_eq!(track.created_at.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert_eq!(track.updated_at.to_rfc3339(), "2024-02-03T02:05:06+00:00");
    }

    #[test]
    fn test_missing_fields_default_and_bad_timestamps_fall_back() {
        let message = TrackMessage::decode(br#"{"id": 5, "updatedAt": "yesterday"}"#).unwrap();
        assert!(!message.is_deleted);
        assert_eq!(message.updated_at(), DateTime::<Utc>::default());
        assert_eq!(message.to_track().title, "");
    }

    #[test]
    fn test_patch_skips_zero_and_empty_fields() {
        let message =
            TrackMessage::decode(br#"{"id": 5, "title": "Intro", "duration": 90.5, "updatedAt": "2024-03-01T00:00:00Z"}"#)
                .unwrap();
        let patch = message.to_patch();

        assert_eq!(patch.title.as_deref(), Some("Intro"));
        assert_eq!(patch.duration, Some(90.5));
        assert_eq!(patch.play_count, None);
        assert_eq!(patch.file_path, None);
        assert_eq!(patch.album_id, None);
        assert_eq!(patch.created_at, None);
        assert_eq!(patch.updated_at, Some(message.updated_at()));
    }
}
