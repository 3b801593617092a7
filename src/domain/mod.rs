//! Domain layer - Pure business logic.

// Catalogue and transcoding
pub mod jobs;
pub mod quality;
pub mod sync;
pub mod track;

// Delivery
pub mod keys;
pub mod range;
pub mod session;
