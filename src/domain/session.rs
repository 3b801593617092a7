use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Who is playing: the upstream user plus the client connection details.
///
/// A new session from the same context supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientContext {
    pub user_id: u64,
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientContext {
    /// Stable key for the context, safe to use as a storage key.
    pub fn key(&self) -> String {
        let raw = format!("{}|{}|{}", self.user_id, self.ip_address, self.user_agent);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()).to_string()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidPosition {
    #[error("position is not a number: {0:?}")]
    NotANumber(String),
    #[error("position must be finite and non-negative, got {0}")]
    OutOfRange(f64),
}

/// Parses a playback position sent by a client.
pub fn parse_position(raw: &str) -> Result<f64, InvalidPosition> {
    let position: f64 = raw
        .trim()
        .parse()
        .map_err(|_| InvalidPosition::NotANumber(raw.to_string()))?;
    if !position.is_finite() || position < 0.0 {
        return Err(InvalidPosition::OutOfRange(position));
    }
    Ok(position)
}

/// One playback attempt by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: String,
    pub user_id: u64,
    pub track_id: u64,
    pub quality: String,
    /// Playback position in seconds
    pub current_pos: f64,
    pub is_active: bool,
    pub ip_address: String,
    pub user_agent: String,
    pub started_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    pub fn start(context: &ClientContext, track_id: u64, quality: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: context.user_id,
            track_id,
            quality: quality.to_string(),
            current_pos: 0.0,
            is_active: true,
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            started_at: now,
            last_access_at: now,
            ended_at: None,
        }
    }

    /// Stores a validated position, clamped to the track duration when it is known.
    /// Returns the position actually stored.
    pub fn update_position(
        &mut self,
        position: f64,
        duration: Option<f64>,
    ) -> Result<f64, InvalidPosition> {
        if !position.is_finite() || position < 0.0 {
            return Err(InvalidPosition::OutOfRange(position));
        }
        let position = match duration {
            Some(duration) if duration > 0.0 => position.min(duration),
            _ => position,
        };

        self.current_pos = position;
        self.is_active = true;
        self.ended_at = None;
        self.touch();
        Ok(position)
    }

    pub fn touch(&mut self) {
        self.last_access_at = Utc::now();
    }

    pub fn end(&mut self) {
        let now = Utc::now();
        self.is_active = false;
        self.ended_at = Some(now);
        self.last_access_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ClientContext {
        ClientContext {
            user_id: 7,
            ip_address: "10.0.0.1".into(),
            user_agent: "curl/8.0".into(),
        }
    }

    #[test]
    fn test_start_session() {
        let session = StreamSession::start(&context(), 42, "320");
        assert_eq!(session.track_id, 42);
        assert_eq!(session.user_id, 7);
        assert_eq!(session.current_pos, 0.0);
        assert!(session.is_active);
        assert!(Uuid::parse_str(&session.session_id).is_ok());
        assert_eq!(session.ip_address, "10.0.0.1");
        assert_eq!(session.user_agent, "curl/8.0");
    }

    #[test]
    fn test_context_key_is_stable_and_distinct() {
        let a = context();
        let mut b = context();
        assert_eq!(a.key(), b.key());
        b.user_agent = "Firefox".into();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("12.5").unwrap(), 12.5);
        assert_eq!(parse_position(" 0 ").unwrap(), 0.0);
        assert!(matches!(parse_position("-1"), Err(InvalidPosition::OutOfRange(_))));
        assert!(matches!(parse_position("NaN"), Err(InvalidPosition::OutOfRange(_))));
        assert!(matches!(parse_position("inf"), Err(InvalidPosition::OutOfRange(_))));
        assert!(matches!(parse_position("abc"), Err(InvalidPosition::NotANumber(_))));
    }

    #[test]
    fn test_update_position_clamps_to_duration() {
        let mut session = StreamSession::start(&context(), 42, "320");
        assert_eq!(session.update_position(500.0, Some(180.0)).unwrap(), 180.0);
        assert_eq!(session.current_pos, 180.0);
        assert_eq!(session.update_position(500.0, None).unwrap(), 500.0);
        assert!(session.update_position(-3.0, Some(180.0)).is_err());
        assert_eq!(session.current_pos, 500.0);
    }

    #[test]
    fn test_end_marks_inactive() {
        let mut session = StreamSession::start(&context(), 42, "320");
        session.end();
        assert!(!session.is_active);
        assert!(session.ended_at.is_some());
    }
}
