//! Redis adapter.
//!
//! This module provides Redis-backed implementations of:
//! - `MessageBus` over Redis Streams consumer groups
//! - `StatusCache` for processing-status and session snapshots

mod bus;
mod cache;
mod error;
mod pool;

pub use bus::RedisBus;
pub use error::RedisAdapterError;
pub use pool::RedisPool;

/// Stream entry field holding the message key
const KEY_FIELD: &str = "key";
/// Stream entry field holding the payload
const VALUE_FIELD: &str = "value";
