//! HTTP inbound adapter
//!
//! Axum router for streaming delivery:
//! - Ranged artifact streaming, downloads and previews
//! - Session status and playback progress
//! - Catalogue reporting (qualities, status, popular tracks)
//! - JSON error bodies

pub mod client;
pub mod error;
pub mod handlers;
pub mod routes;

pub use routes::create_router;
