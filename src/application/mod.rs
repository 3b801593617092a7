//! Application layer - Generic services that use ports.

// Bus consumption shared by both pipelines
pub mod consumer;

// Transcoding pipeline and track sync
pub mod track_sync;
pub mod transcoder;

// Streaming delivery
pub mod delivery;
pub mod stats;
