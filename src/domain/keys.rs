//! Status cache key layout and expirations.

use std::time::Duration;

/// Track and processing snapshots.
pub const TRACK_SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const QUALITIES_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Hash field holding the last reported position under [`session_position`].
pub const POSITION_FIELD: &str = "position";

pub fn track_info(track_id: u64) -> String {
    format!("track:{}:info", track_id)
}

pub fn processing_status(track_id: u64) -> String {
    format!("track:{}:processing_status", track_id)
}

pub fn qualities(track_id: u64) -> String {
    format!("track:{}:qualities", track_id)
}

pub fn session(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn session_position(session_id: &str) -> String {
    format!("session:{}:pos", session_id)
}
