//! Cadenza - Audio Transcoding and Streaming Library
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, tracks, sessions, ranges, qualities)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations
//! - application/: Generic services
//! - config: Environment configuration
//! - error: Error taxonomy
//! - runtime: Logging and shutdown plumbing for the binaries
//!
//! # Features
//! - `local`: Filesystem object store, Redis Streams bus and Redis status cache
//! - `aws`: S3 object store and DynamoDB repositories
//! - `full`: All features

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod runtime;

// Re-exports for convenience
pub use config::AppConfig;
pub use error::{DeliveryError, JobError, SyncError};

#[cfg(feature = "local")]
pub use adapters::local::{FsObjectStore, RedisBus, RedisPool};

#[cfg(feature = "aws")]
pub use adapters::aws::{DynamoRepository, S3ObjectStore};
